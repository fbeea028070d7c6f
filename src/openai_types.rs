use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OpenAIMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize, Default)]
pub struct OpenAIPayload {
    pub model: String,
    pub messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIBatchResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: Option<OpenAIUsageStats>,
    pub choices: Vec<OpenAIBatchChoice>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIBatchChoice {
    pub message: OpenAIResponseMessage,
    pub finish_reason: Option<String>,
}

/// Assistant messages may carry `"content": null` (tool calls, refusals).
#[derive(Deserialize, Debug)]
pub struct OpenAIResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct OpenAIUsageStats {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
