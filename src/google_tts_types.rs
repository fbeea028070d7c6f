use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
pub struct SynthesisInput {
    pub text: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSelectionParams {
    pub language_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    pub audio_encoding: String,
    pub sample_rate_hertz: u32,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeSpeechRequest {
    pub input: SynthesisInput,
    pub voice: VoiceSelectionParams,
    pub audio_config: AudioConfig,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeSpeechResponse {
    /// Base64 WAV (LINEAR16 comes with a RIFF header)
    pub audio_content: String,
}
