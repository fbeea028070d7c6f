use crate::anthropic_types::{AnthropicBlock, AnthropicMessage, AnthropicRequest, AnthropicResponse};
use crate::config::{CallSettings, ProviderKind, ProviderSettings};
use crate::error::{CallError, ProviderError};
use crate::extraction::extraction_instruction;
use crate::gemini_types::{
    GeminiContent, GeminiGenerationConfig, GeminiPart, GeminiRequest, GeminiResponse,
};
use crate::openai_types::{OpenAIBatchResponse, OpenAIMessage, OpenAIPayload};
use crate::profile::BusinessProfile;
use crate::types::{ChatMessage, ChatRole};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionMode {
    /// Short spoken replies grounded in the business profile
    Conversation,
    /// Structured JSON over a whole transcript
    Extraction,
}

impl InstructionMode {
    fn max_tokens(&self) -> u32 {
        match self {
            InstructionMode::Conversation => 150,
            InstructionMode::Extraction => 500,
        }
    }

    fn temperature(&self) -> f32 {
        match self {
            InstructionMode::Conversation => 0.7,
            InstructionMode::Extraction => 0.1,
        }
    }

    pub fn system_prompt(&self, profile: &BusinessProfile) -> String {
        match self {
            InstructionMode::Conversation => profile.system_prompt(),
            InstructionMode::Extraction => extraction_instruction(profile),
        }
    }
}

/// A single language-model provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn label(&self) -> &str;

    async fn complete(
        &self,
        history: &[ChatMessage],
        profile: &BusinessProfile,
        mode: InstructionMode,
    ) -> Result<String, ProviderError>;
}

/// HTTP client for one configured provider.
pub struct ProviderClient {
    settings: ProviderSettings,
    label: String,
    http_client: reqwest::Client,
}

impl ProviderClient {
    pub fn new(settings: ProviderSettings, http_client: reqwest::Client) -> Self {
        Self {
            label: settings.label(),
            settings,
            http_client,
        }
    }

    async fn post_json<B, R>(&self, request: reqwest::RequestBuilder, body: &B) -> Result<R, ProviderError>
    where
        B: serde::Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let resp = request.json(body).send().await.map_err(|e| {
            warn!(provider = %self.label, error = %e, "provider request failed");
            ProviderError::from_reqwest(&e)
        })?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &text));
        }
        resp.json::<R>().await.map_err(|e| {
            error!(provider = %self.label, error = %e, "unparseable provider response");
            ProviderError::Transient(format!("malformed response: {e}"))
        })
    }

    async fn complete_openai(
        &self,
        history: &[ChatMessage],
        system: String,
        mode: InstructionMode,
    ) -> Result<Option<String>, ProviderError> {
        let mut messages = vec![OpenAIMessage {
            role: ChatRole::System.as_str().to_string(),
            content: system,
        }];
        messages.extend(history.iter().map(|m| OpenAIMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));
        let payload = OpenAIPayload {
            model: self.settings.model.clone(),
            messages,
            max_tokens: Some(mode.max_tokens()),
            temperature: Some(mode.temperature()),
        };
        let mut request = self
            .http_client
            .post(format!("{}/chat/completions", self.settings.base_url));
        if let Some(key) = &self.settings.api_key {
            request = request.bearer_auth(key);
        }
        let resp: OpenAIBatchResponse = self.post_json(request, &payload).await?;
        if let Some(usage) = &resp.usage {
            debug!(provider = %self.label, total_tokens = usage.total_tokens, "completion usage");
        }
        Ok(resp.choices.into_iter().next().and_then(|c| c.message.content))
    }

    async fn complete_gemini(
        &self,
        history: &[ChatMessage],
        system: String,
        mode: InstructionMode,
    ) -> Result<Option<String>, ProviderError> {
        let contents = caller_first(history)
            .iter()
            .map(|m| GeminiContent {
                role: Some(match m.role {
                    ChatRole::Assistant => "model".to_string(),
                    _ => "user".to_string(),
                }),
                parts: vec![GeminiPart {
                    text: m.content.clone(),
                }],
            })
            .collect();
        let payload = GeminiRequest {
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: system }],
            },
            contents,
            generation_config: GeminiGenerationConfig {
                max_output_tokens: mode.max_tokens(),
                temperature: mode.temperature(),
            },
        };
        let url = format!(
            "{}/models/{}:generateContent",
            self.settings.base_url, self.settings.model
        );
        let mut request = self.http_client.post(url);
        if let Some(key) = &self.settings.api_key {
            request = request.query(&[("key", key)]);
        }
        let resp: GeminiResponse = self.post_json(request, &payload).await?;
        Ok(resp
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<String>>()
                    .join("")
            }))
    }

    async fn complete_anthropic(
        &self,
        history: &[ChatMessage],
        system: String,
        mode: InstructionMode,
    ) -> Result<Option<String>, ProviderError> {
        let payload = AnthropicRequest {
            model: self.settings.model.clone(),
            system,
            messages: caller_first(history)
                .iter()
                .map(|m| AnthropicMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: mode.max_tokens(),
            temperature: mode.temperature(),
        };
        let mut request = self
            .http_client
            .post(format!("{}/messages", self.settings.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION);
        if let Some(key) = &self.settings.api_key {
            request = request.header("x-api-key", key);
        }
        let resp: AnthropicResponse = self.post_json(request, &payload).await?;
        Ok(resp.content.into_iter().find_map(|block| match block {
            AnthropicBlock::Text { text } => Some(text),
            AnthropicBlock::Other => None,
        }))
    }
}

/// Gemini and Anthropic reject conversations that open with an assistant turn.
fn caller_first(history: &[ChatMessage]) -> &[ChatMessage] {
    let start = history
        .iter()
        .position(|m| m.role == ChatRole::User)
        .unwrap_or(history.len());
    &history[start..]
}

#[async_trait]
impl LanguageModel for ProviderClient {
    fn label(&self) -> &str {
        &self.label
    }

    async fn complete(
        &self,
        history: &[ChatMessage],
        profile: &BusinessProfile,
        mode: InstructionMode,
    ) -> Result<String, ProviderError> {
        let system = mode.system_prompt(profile);
        let text = match self.settings.kind {
            ProviderKind::OpenAiCompatible => self.complete_openai(history, system, mode).await?,
            ProviderKind::Gemini => self.complete_gemini(history, system, mode).await?,
            ProviderKind::Anthropic => self.complete_anthropic(history, system, mode).await?,
        };
        match text.map(|t| t.trim().to_string()) {
            Some(t) if !t.is_empty() => Ok(t),
            _ => Err(ProviderError::Transient("empty completion".to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReply {
    pub text: String,
    pub provider: String,
}

/// Priority-ordered providers shared by every call.
pub struct InferenceChain {
    providers: Vec<Arc<dyn LanguageModel>>,
    provider_timeout: Duration,
    ceiling: Duration,
}

impl InferenceChain {
    pub fn new(
        providers: Vec<Arc<dyn LanguageModel>>,
        provider_timeout: Duration,
        ceiling: Duration,
    ) -> Self {
        Self {
            providers,
            provider_timeout,
            ceiling,
        }
    }

    pub fn from_settings(
        providers: &[ProviderSettings],
        call: &CallSettings,
        http_client: &reqwest::Client,
    ) -> Self {
        let providers = providers
            .iter()
            .map(|p| {
                Arc::new(ProviderClient::new(p.clone(), http_client.clone())) as Arc<dyn LanguageModel>
            })
            .collect();
        Self::new(providers, call.provider_timeout, call.inference_ceiling)
    }

    /// Per-call view of the chain; remembers which providers failed fatally.
    pub fn session(self: &Arc<Self>) -> ChainSession {
        ChainSession {
            chain: self.clone(),
            disabled: vec![false; self.providers.len()],
        }
    }
}

pub struct ChainSession {
    chain: Arc<InferenceChain>,
    disabled: Vec<bool>,
}

impl ChainSession {
    /// Try providers in order until one answers.  Rate-limited providers are skipped
    /// without retry, transient failures get one retry, fatal failures disable the
    /// provider for the rest of the call.  Bounded by the chain's total ceiling.
    pub async fn complete(
        &mut self,
        history: &[ChatMessage],
        profile: &BusinessProfile,
        mode: InstructionMode,
    ) -> Result<ChainReply, CallError> {
        let deadline = Instant::now() + self.chain.ceiling;

        for (idx, provider) in self.chain.providers.iter().enumerate() {
            if self.disabled[idx] {
                debug!(provider = provider.label(), "skipping disabled provider");
                continue;
            }
            let mut retried = false;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    warn!("inference ceiling reached");
                    return Err(CallError::InferenceExhausted);
                }
                let budget = remaining.min(self.chain.provider_timeout);
                let started = Instant::now();
                let result = match timeout(budget, provider.complete(history, profile, mode)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "no answer within {}ms",
                        budget.as_millis()
                    ))),
                };
                match result {
                    Ok(text) => {
                        info!(
                            provider = provider.label(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "provider answered"
                        );
                        return Ok(ChainReply {
                            text,
                            provider: provider.label().to_string(),
                        });
                    }
                    Err(ProviderError::RateLimited(detail)) => {
                        warn!(provider = provider.label(), %detail, "rate limited, advancing");
                        break;
                    }
                    Err(ProviderError::Transient(detail)) if !retried => {
                        warn!(provider = provider.label(), %detail, "transient failure, retrying");
                        retried = true;
                    }
                    Err(ProviderError::Transient(detail)) => {
                        warn!(provider = provider.label(), %detail, "transient failure, advancing");
                        break;
                    }
                    Err(ProviderError::Fatal(detail)) => {
                        error!(provider = provider.label(), %detail, "fatal failure, disabling for this call");
                        self.disabled[idx] = true;
                        break;
                    }
                }
            }
        }
        Err(CallError::InferenceExhausted)
    }
}
