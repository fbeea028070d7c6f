use serde::{Deserialize, Serialize};

/// Body returned by the pre-recorded `/listen` endpoint.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PrerecordedResponse {
    pub results: PrerecordedResults,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct PrerecordedResults {
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Channel {
    pub alternatives: Vec<Alternative>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Word {
    pub word: String,
    pub start: f32,
    pub end: f32,
    pub confidence: f32,
}

impl PrerecordedResponse {
    /// Best transcript of the first channel, if any.
    pub fn transcript(&self) -> Option<&str> {
        self.results
            .channels
            .first()
            .and_then(|c| c.alternatives.first())
            .map(|a| a.transcript.as_str())
    }
}
