use crate::consts::{
    APOLOGY_REPLY, ASSISTANT_FAREWELL_PHRASES, CALLER_FAREWELL_PHRASES, FALLBACK_REPLY,
    FAREWELL_REPLY, REPROMPT,
};
use crate::error::ConfigError;
use crate::phone::PhoneRules;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Everything the process needs, read once at startup and shared by reference.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub agi_bind_addr: SocketAddr,
    pub database_url: String,
    pub audio_dir: PathBuf,
    pub profiles_dir: PathBuf,
    /// Name of the profile file (without `.json`) used for inbound calls
    pub active_business: String,
    /// Row in the `businesses` table that call bookings are written to
    pub booking_business_id: Option<i64>,
    pub log_level: String,
    pub call: CallSettings,
    pub providers: Vec<ProviderSettings>,
    pub stt: SttBackend,
    pub tts: TtsBackend,
    pub phone: PhoneRules,
    pub extraction: ExtractionSettings,
    pub notify: NotifySettings,
}

/// Limits and canned utterances for the turn loop.
#[derive(Debug, Clone)]
pub struct CallSettings {
    pub max_turns: usize,
    pub max_call_duration: Duration,
    pub silence_timeout: Duration,
    pub max_utterance: Duration,
    pub no_input_retries: u32,
    pub stt_timeout: Duration,
    pub tts_timeout: Duration,
    pub provider_timeout: Duration,
    pub inference_ceiling: Duration,
    pub language: String,
    pub farewell_phrases: Vec<String>,
    pub assistant_farewell_phrases: Vec<String>,
    pub fallback_reply: String,
    pub apology_reply: String,
    pub reprompt: String,
    pub farewell_reply: String,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_call_duration: Duration::from_secs(300),
            silence_timeout: Duration::from_secs(2),
            max_utterance: Duration::from_secs(30),
            no_input_retries: 2,
            stt_timeout: Duration::from_secs(20),
            tts_timeout: Duration::from_secs(15),
            provider_timeout: Duration::from_secs(15),
            inference_ceiling: Duration::from_secs(25),
            language: "de".to_string(),
            farewell_phrases: to_strings(CALLER_FAREWELL_PHRASES),
            assistant_farewell_phrases: to_strings(ASSISTANT_FAREWELL_PHRASES),
            fallback_reply: FALLBACK_REPLY.to_string(),
            apology_reply: APOLOGY_REPLY.to_string(),
            reprompt: REPROMPT.to_string(),
            farewell_reply: FAREWELL_REPLY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// `/chat/completions` style APIs: OpenAI, Groq, Ollama
    OpenAiCompatible,
    Gemini,
    Anthropic,
}

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

impl ProviderSettings {
    /// Human readable identity recorded on every turn.
    pub fn label(&self) -> String {
        format!("{}/{}", self.name, self.model)
    }
}

#[derive(Debug, Clone)]
pub enum SttBackend {
    Deepgram {
        api_key: String,
        model: String,
        base_url: String,
    },
    Whisper {
        binary: PathBuf,
        model_path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub enum TtsBackend {
    Google {
        api_key: String,
        voice: String,
        language_code: String,
        base_url: String,
    },
    /// Piper renders at the voice's native rate; `sox` resamples to 8 kHz for the PBX
    Piper {
        binary: PathBuf,
        voice_model: PathBuf,
        sox: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    /// Drafts reporting a lower confidence are stored as `none`
    pub min_confidence: f32,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self { min_confidence: 0.0 }
    }
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub web_base_url: Option<String>,
    pub sms: Option<SmsSettings>,
    pub email: Option<EmailSettings>,
    pub telegram: Option<TelegramSettings>,
    pub max_attempts: u32,
    pub retry_base: Duration,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            web_base_url: None,
            sms: None,
            email: None,
            telegram: None,
            max_attempts: 3,
            retry_base: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub enum SmsSettings {
    Twilio {
        account_sid: String,
        auth_token: String,
        from: String,
    },
    Sipgate {
        token_id: String,
        token: String,
        sms_id: String,
    },
}

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let defaults = CallSettings::default();

        let call = CallSettings {
            max_turns: env.parse("MAX_TURNS", defaults.max_turns)?,
            max_call_duration: env.secs("MAX_CALL_DURATION_SECS", defaults.max_call_duration)?,
            silence_timeout: env.secs("SILENCE_TIMEOUT_SECS", defaults.silence_timeout)?,
            max_utterance: env.secs("MAX_UTTERANCE_SECS", defaults.max_utterance)?,
            no_input_retries: env.parse("NO_INPUT_RETRIES", defaults.no_input_retries)?,
            stt_timeout: env.secs("STT_TIMEOUT_SECS", defaults.stt_timeout)?,
            tts_timeout: env.secs("TTS_TIMEOUT_SECS", defaults.tts_timeout)?,
            provider_timeout: env.secs("PROVIDER_TIMEOUT_SECS", defaults.provider_timeout)?,
            inference_ceiling: env.secs("INFERENCE_CEILING_SECS", defaults.inference_ceiling)?,
            language: env.or("LANGUAGE", &defaults.language),
            farewell_phrases: env
                .list("FAREWELL_PHRASES")
                .unwrap_or(defaults.farewell_phrases),
            assistant_farewell_phrases: env
                .list("ASSISTANT_FAREWELL_PHRASES")
                .unwrap_or(defaults.assistant_farewell_phrases),
            fallback_reply: env.or("FALLBACK_REPLY", &defaults.fallback_reply),
            apology_reply: env.or("APOLOGY_REPLY", &defaults.apology_reply),
            reprompt: env.or("REPROMPT", &defaults.reprompt),
            farewell_reply: env.or("FAREWELL_REPLY", &defaults.farewell_reply),
        };

        let phone = match env.list("MOBILE_PREFIXES") {
            Some(mobile_prefixes) => PhoneRules { mobile_prefixes },
            None => PhoneRules::default(),
        };

        let config = Config {
            bind_addr: env.parse("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 5000)))?,
            agi_bind_addr: env.parse("AGI_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 4573)))?,
            database_url: env.or("DATABASE_URL", "sqlite://calls.db?mode=rwc"),
            audio_dir: PathBuf::from(env.or("AUDIO_DIR", "/var/lib/phone-assistant/audio")),
            profiles_dir: PathBuf::from(env.or("PROFILES_DIR", "profiles")),
            active_business: env.or("ACTIVE_BUSINESS", "handwerk"),
            booking_business_id: env.optional_parse("BOOKING_BUSINESS_ID")?,
            log_level: env.or("LOG_LEVEL", "info"),
            providers: provider_list(&env)?,
            stt: stt_backend(&env)?,
            tts: tts_backend(&env)?,
            phone,
            extraction: ExtractionSettings {
                min_confidence: env.parse("EXTRACTION_MIN_CONFIDENCE", 0.0)?,
            },
            notify: notify_settings(&env)?,
            call,
        };
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call.max_turns == 0 {
            return Err(invalid("MAX_TURNS", "must be at least 1"));
        }
        let timeouts = [
            ("SILENCE_TIMEOUT_SECS", self.call.silence_timeout),
            ("MAX_CALL_DURATION_SECS", self.call.max_call_duration),
            ("MAX_UTTERANCE_SECS", self.call.max_utterance),
            ("STT_TIMEOUT_SECS", self.call.stt_timeout),
            ("TTS_TIMEOUT_SECS", self.call.tts_timeout),
            ("PROVIDER_TIMEOUT_SECS", self.call.provider_timeout),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(invalid(field, "must be positive"));
        }
        if self.call.inference_ceiling < self.call.provider_timeout {
            return Err(invalid(
                "INFERENCE_CEILING_SECS",
                "must not be shorter than PROVIDER_TIMEOUT_SECS",
            ));
        }
        if self.providers.is_empty() {
            return Err(invalid("LLM_PROVIDERS", "at least one provider is required"));
        }
        if !(0.0..=1.0).contains(&self.extraction.min_confidence) {
            return Err(invalid("EXTRACTION_MIN_CONFIDENCE", "must be within 0..=1"));
        }
        if self.notify.max_attempts == 0 {
            return Err(invalid("NOTIFY_MAX_ATTEMPTS", "must be at least 1"));
        }
        Ok(())
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<'a, F: Fn(&str) -> Option<String>> Env<'a, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.optional_parse(key)?.unwrap_or(default))
    }

    fn optional_parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|_| invalid(key, &format!("cannot parse '{raw}'"))),
            None => Ok(None),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .optional_parse::<u64>(key)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    }

    fn flag(&self, key: &str) -> bool {
        matches!(
            self.get(key).map(|v| v.to_lowercase()).as_deref(),
            Some("1" | "true" | "yes")
        )
    }

    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}

/// `LLM_PROVIDERS=groq,groq:llama-3.1-8b-instant,gemini` builds an ordered chain; a `:model`
/// suffix overrides `<NAME>_MODEL` for that entry only.
fn provider_list<F: Fn(&str) -> Option<String>>(
    env: &Env<'_, F>,
) -> Result<Vec<ProviderSettings>, ConfigError> {
    let entries = env
        .list("LLM_PROVIDERS")
        .unwrap_or_else(|| vec!["groq".to_string()]);
    let mut providers = Vec::with_capacity(entries.len());
    for entry in entries {
        let (name, model_override) = match entry.split_once(':') {
            Some((name, model)) => (name.to_lowercase(), Some(model.to_string())),
            None => (entry.to_lowercase(), None),
        };
        let (kind, default_base, default_model, needs_key) = match name.as_str() {
            "groq" => (
                ProviderKind::OpenAiCompatible,
                "https://api.groq.com/openai/v1",
                "llama-3.1-8b-instant",
                true,
            ),
            "openai" => (
                ProviderKind::OpenAiCompatible,
                "https://api.openai.com/v1",
                "gpt-4o-mini",
                true,
            ),
            "ollama" => (
                ProviderKind::OpenAiCompatible,
                "http://localhost:11434/v1",
                "llama3.1:8b",
                false,
            ),
            "gemini" => (
                ProviderKind::Gemini,
                "https://generativelanguage.googleapis.com/v1beta",
                "gemini-2.0-flash",
                true,
            ),
            "anthropic" => (
                ProviderKind::Anthropic,
                "https://api.anthropic.com/v1",
                "claude-3-5-haiku-latest",
                true,
            ),
            other => {
                return Err(invalid(
                    "LLM_PROVIDERS",
                    &format!("unknown provider '{other}'"),
                ))
            }
        };
        let prefix = name.to_uppercase();
        let api_key = env.get(&format!("{prefix}_API_KEY"));
        if needs_key && api_key.is_none() {
            return Err(ConfigError::Missing(format!("{prefix}_API_KEY")));
        }
        let model = model_override
            .unwrap_or_else(|| env.or(&format!("{prefix}_MODEL"), default_model));
        providers.push(ProviderSettings {
            base_url: env
                .or(&format!("{prefix}_BASE_URL"), default_base)
                .trim_end_matches('/')
                .to_string(),
            name,
            kind,
            api_key,
            model,
        });
    }
    Ok(providers)
}

fn stt_backend<F: Fn(&str) -> Option<String>>(env: &Env<'_, F>) -> Result<SttBackend, ConfigError> {
    match env.or("STT_BACKEND", "whisper").as_str() {
        "deepgram" => Ok(SttBackend::Deepgram {
            api_key: env.require("DEEPGRAM_API_KEY")?,
            model: env.or("DEEPGRAM_MODEL", "nova-2"),
            base_url: env.or("DEEPGRAM_BASE_URL", "https://api.deepgram.com/v1"),
        }),
        "whisper" => Ok(SttBackend::Whisper {
            binary: PathBuf::from(env.or("WHISPER_BINARY", "/opt/whisper.cpp/main")),
            model_path: PathBuf::from(env.or(
                "WHISPER_MODEL_PATH",
                "/opt/whisper.cpp/models/ggml-small.bin",
            )),
        }),
        other => Err(invalid("STT_BACKEND", &format!("unknown backend '{other}'"))),
    }
}

fn tts_backend<F: Fn(&str) -> Option<String>>(env: &Env<'_, F>) -> Result<TtsBackend, ConfigError> {
    match env.or("TTS_BACKEND", "piper").as_str() {
        "google" => Ok(TtsBackend::Google {
            api_key: env.require("GOOGLE_TTS_API_KEY")?,
            voice: env.or("GOOGLE_TTS_VOICE", "de-DE-Standard-C"),
            language_code: env.or("GOOGLE_TTS_LANGUAGE", "de-DE"),
            base_url: env.or(
                "GOOGLE_TTS_BASE_URL",
                "https://texttospeech.googleapis.com/v1",
            ),
        }),
        "piper" => Ok(TtsBackend::Piper {
            binary: PathBuf::from(env.or("PIPER_PATH", "/opt/piper/piper")),
            voice_model: PathBuf::from(env.or(
                "PIPER_VOICE",
                "/opt/piper/voices/de_DE-thorsten-high.onnx",
            )),
            sox: PathBuf::from(env.or("SOX_PATH", "sox")),
        }),
        other => Err(invalid("TTS_BACKEND", &format!("unknown backend '{other}'"))),
    }
}

fn notify_settings<F: Fn(&str) -> Option<String>>(
    env: &Env<'_, F>,
) -> Result<NotifySettings, ConfigError> {
    let defaults = NotifySettings::default();
    let sms = match env.get("SMS_PROVIDER").as_deref() {
        Some("twilio") => Some(SmsSettings::Twilio {
            account_sid: env.require("TWILIO_ACCOUNT_SID")?,
            auth_token: env.require("TWILIO_AUTH_TOKEN")?,
            from: env.require("TWILIO_FROM_NUMBER")?,
        }),
        Some("sipgate") => Some(SmsSettings::Sipgate {
            token_id: env.require("SIPGATE_TOKEN_ID")?,
            token: env.require("SIPGATE_TOKEN")?,
            sms_id: env.or("SIPGATE_SMS_ID", "s0"),
        }),
        Some(other) => {
            return Err(invalid("SMS_PROVIDER", &format!("unknown provider '{other}'")))
        }
        None => None,
    };
    let email = if env.flag("EMAIL_ENABLED") {
        Some(EmailSettings {
            smtp_host: env.or("EMAIL_SMTP_HOST", "smtp.gmail.com"),
            smtp_port: env.parse("EMAIL_SMTP_PORT", 587)?,
            username: env.require("EMAIL_SMTP_USER")?,
            password: env.require("EMAIL_SMTP_PASS")?,
            from: match env.get("EMAIL_FROM") {
                Some(from) => from,
                None => env.require("EMAIL_SMTP_USER")?,
            },
            to: env
                .list("EMAIL_TO")
                .filter(|to| !to.is_empty())
                .ok_or_else(|| ConfigError::Missing("EMAIL_TO".to_string()))?,
        })
    } else {
        None
    };
    let telegram = if env.flag("TELEGRAM_ENABLED") {
        Some(TelegramSettings {
            bot_token: env.require("TELEGRAM_BOT_TOKEN")?,
            chat_id: env.require("TELEGRAM_CHAT_ID")?,
            api_base: env.or("TELEGRAM_API_BASE", "https://api.telegram.org"),
        })
    } else {
        None
    };

    Ok(NotifySettings {
        web_base_url: env
            .get("WEB_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string()),
        sms,
        email,
        telegram,
        max_attempts: env.parse("NOTIFY_MAX_ATTEMPTS", defaults.max_attempts)?,
        retry_base: env
            .optional_parse::<u64>("NOTIFY_RETRY_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_base),
    })
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
