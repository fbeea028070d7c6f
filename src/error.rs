use thiserror::Error;
use tracing::error;

pub async fn handle_error(e: impl std::error::Error) {
    error!("ERROR: {e}")
}

/// Failures that can happen while a call is in progress or being wrapped up.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("no speech captured before the silence timeout")]
    InputTimeout,
    #[error("transcription failed: {0}")]
    TranscriptionFailure(String),
    #[error("every inference provider failed")]
    InferenceExhausted,
    #[error("synthesis failed: {0}")]
    SynthesisFailure(String),
    #[error("caller hung up")]
    TelephonyDisconnect,
    #[error("telephony protocol error: {0}")]
    Telephony(String),
    #[error("no valid booking in transcript: {0}")]
    ExtractionInvalid(String),
    #[error("booking store write conflict: {0}")]
    StoreWriteConflict(String),
    #[error("notification delivery failed: {0}")]
    NotificationDeliveryFailure(String),
}

/// How a single language-model provider failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Classify an HTTP status returned by a provider.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = format!("{status}: {}", truncate(body, 200));
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ProviderError::RateLimited(detail)
        } else if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            ProviderError::Transient(detail)
        } else {
            ProviderError::Fatal(detail)
        }
    }

    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ProviderError::from_status(status, ""),
            None => ProviderError::Transient(e.to_string()),
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("record not found")]
    NotFound,
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
}

impl From<StoreError> for CallError {
    fn from(e: StoreError) -> Self {
        CallError::StoreWriteConflict(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(String),
    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
    #[error("failed to load business profile {path}: {message}")]
    Profile { path: String, message: String },
}
