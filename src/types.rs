use crate::config::Config;
use crate::inference::InferenceChain;
use crate::notify::NotificationDispatcher;
use crate::phone::PhoneClass;
use crate::profile::BusinessProfile;
use crate::speech::{Synthesizer, Transcriber};
use crate::store::BookingStore;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use time::OffsetDateTime;

pub struct AppState {
    pub config: Config,
    pub store: BookingStore,
    pub chain: Arc<InferenceChain>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub dispatcher: Arc<NotificationDispatcher>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BusinessMode {
    #[serde(alias = "termin")]
    Appointment,
    #[serde(alias = "auftrag", alias = "anfrage")]
    Inquiry,
}

impl BusinessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessMode::Appointment => "appointment",
            BusinessMode::Inquiry => "inquiry",
        }
    }
}

/// How a call ended.  Assigned exactly once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "kebab-case")]
#[sqlx(rename_all = "kebab-case")]
pub enum TerminalStatus {
    Completed,
    HungUp,
    TimedOut,
    MaxTurnsReached,
    Error,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::HungUp => "hung-up",
            TerminalStatus::TimedOut => "timed-out",
            TerminalStatus::MaxTurnsReached => "max-turns-reached",
            TerminalStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageLatencies {
    pub transcribe: Duration,
    pub infer: Duration,
    pub synthesize: Duration,
    pub speak: Duration,
}

/// One caller utterance and the reply we played back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub index: usize,
    pub caller_text: String,
    pub reply_text: String,
    /// Label of the provider that produced the reply; `None` for canned replies
    pub provider: Option<String>,
    pub latencies: StageLatencies,
    /// Playback of the reply was cut off by caller speech
    pub barge_in: bool,
    /// The reply is a substitute for a failed stage
    pub degraded: bool,
}

/// Everything about a turn except its position, which the session assigns.
#[derive(Debug, Clone, Default)]
pub struct TurnDraft {
    pub caller_text: String,
    pub reply_text: String,
    pub provider: Option<String>,
    pub latencies: StageLatencies,
    pub barge_in: bool,
    pub degraded: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("call {call_id} already ended with status {status}")]
pub struct SessionClosed {
    pub call_id: String,
    pub status: TerminalStatus,
}

/// State of one phone call, owned by the call's worker task.
#[derive(Debug)]
pub struct CallSession {
    call_id: String,
    caller_number: String,
    phone_class: PhoneClass,
    profile: Arc<BusinessProfile>,
    started_at: OffsetDateTime,
    started: Instant,
    greeting: Option<String>,
    turns: Vec<Turn>,
    status: Option<TerminalStatus>,
}

impl CallSession {
    pub fn new(
        call_id: String,
        caller_number: String,
        phone_class: PhoneClass,
        profile: Arc<BusinessProfile>,
    ) -> Self {
        Self {
            call_id,
            caller_number,
            phone_class,
            profile,
            started_at: OffsetDateTime::now_utc(),
            started: Instant::now(),
            greeting: None,
            turns: vec![],
            status: None,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn caller_number(&self) -> &str {
        &self.caller_number
    }

    pub fn phone_class(&self) -> PhoneClass {
        self.phone_class
    }

    pub fn profile(&self) -> &BusinessProfile {
        &self.profile
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn status(&self) -> Option<TerminalStatus> {
        self.status
    }

    pub fn set_greeting(&mut self, greeting: String) {
        self.greeting = Some(greeting);
    }

    fn ensure_open(&self) -> Result<(), SessionClosed> {
        match self.status {
            Some(status) => Err(SessionClosed {
                call_id: self.call_id.clone(),
                status,
            }),
            None => Ok(()),
        }
    }

    /// Append a finished turn; its index is its position in the call.
    pub fn append_turn(&mut self, draft: TurnDraft) -> Result<&Turn, SessionClosed> {
        self.ensure_open()?;
        let index = self.turns.len();
        self.turns.push(Turn {
            index,
            caller_text: draft.caller_text,
            reply_text: draft.reply_text,
            provider: draft.provider,
            latencies: draft.latencies,
            barge_in: draft.barge_in,
            degraded: draft.degraded,
        });
        Ok(&self.turns[index])
    }

    pub fn finish(&mut self, status: TerminalStatus) -> Result<(), SessionClosed> {
        self.ensure_open()?;
        self.status = Some(status);
        Ok(())
    }

    /// Aggregate conversation up till now; sent to the language model as context
    pub fn history(&self) -> Vec<ChatMessage> {
        let mut conversation = Vec::with_capacity(self.turns.len() * 2 + 1);
        if let Some(greeting) = &self.greeting {
            conversation.push(ChatMessage::assistant(greeting.clone()));
        }
        for turn in &self.turns {
            if !turn.caller_text.is_empty() {
                conversation.push(ChatMessage::user(turn.caller_text.clone()));
            }
            if !turn.reply_text.is_empty() {
                conversation.push(ChatMessage::assistant(turn.reply_text.clone()));
            }
        }
        conversation
    }

    /// Plain-text transcript with speaker labels, used for extraction and the call log.
    pub fn transcript(&self) -> String {
        self.history()
            .iter()
            .map(|m| match m.role {
                ChatRole::User => format!("Anrufer: {}", m.content),
                _ => format!("Assistent: {}", m.content),
            })
            .collect::<Vec<String>>()
            .join("\n")
    }
}
