//! Fakes for every port of the call pipeline, shared by the unit tests.

use crate::config::Config;
use crate::db_types::Business;
use crate::error::{CallError, ProviderError};
use crate::inference::{InferenceChain, InstructionMode, LanguageModel};
use crate::notify::{DeliveryError, NotificationDispatcher, OperatorChannel, SmsChannel};
use crate::phone::PhoneRules;
use crate::profile::{BusinessProfile, FaqEntry};
use crate::speech::{Synthesizer, Transcriber, VoiceProfile};
use crate::store::{BookingStore, NewBusiness};
use crate::turn_io::{AudioClip, AudioSegment, PlayOutcome, RecordOutcome, TurnIo};
use crate::types::{AppState, ChatMessage};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn sample_profile() -> BusinessProfile {
    BusinessProfile {
        name: "Salon Schnitt".to_string(),
        industry: Some("Friseur".to_string()),
        mode: None,
        phone: Some("030 1234567".to_string()),
        email: Some("info@salon-schnitt.de".to_string()),
        address: Some("Hauptstraße 5, 10115 Berlin".to_string()),
        opening_hours: BTreeMap::from([
            ("Montag-Freitag".to_string(), "9-18 Uhr".to_string()),
            ("Samstag".to_string(), "9-14 Uhr".to_string()),
        ]),
        services: vec!["Haarschnitt".to_string(), "Färben".to_string()],
        important_info: vec!["Kartenzahlung möglich".to_string()],
        directives: vec!["Immer höflich bleiben".to_string()],
        faq: vec![FaqEntry {
            question: "Haben Sie samstags geöffnet?".to_string(),
            answer: "Ja, von 9 bis 14 Uhr.".to_string(),
        }],
        custom_instructions: None,
        greeting: None,
        voice: None,
    }
}

/// Language model answering from a queue of canned results.
pub struct ScriptedModel {
    label: String,
    replies: Mutex<VecDeque<Result<String, ProviderError>>>,
    extraction: Mutex<Option<String>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            replies: Mutex::new(VecDeque::new()),
            extraction: Mutex::new(None),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn replies(self: Arc<Self>, replies: Vec<Result<String, ProviderError>>) -> Arc<Self> {
        self.replies.lock().unwrap().extend(replies);
        self
    }

    /// JSON returned for extraction requests.
    pub fn extraction(self: Arc<Self>, json: &str) -> Arc<Self> {
        *self.extraction.lock().unwrap() = Some(json.to_string());
        self
    }

    pub fn delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn complete(
        &self,
        _history: &[ChatMessage],
        _profile: &BusinessProfile,
        mode: InstructionMode,
    ) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if mode == InstructionMode::Extraction {
            if let Some(json) = self.extraction.lock().unwrap().clone() {
                return Ok(json);
            }
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Alles klar.".to_string()))
    }
}

/// What the caller does when the line is open for recording.
#[derive(Debug, Clone)]
pub enum CallerEvent {
    Say(String),
    Silence,
    HangUp,
}

impl CallerEvent {
    pub fn say(text: &str) -> Self {
        CallerEvent::Say(text.to_string())
    }
}

fn segment(text: &str) -> AudioSegment {
    AudioSegment {
        path: PathBuf::from("caller.wav"),
        data: text.as_bytes().to_vec(),
    }
}

#[derive(Default)]
struct ScriptedIoInner {
    events: VecDeque<CallerEvent>,
    interruptions: HashMap<usize, String>,
    stalls: HashSet<usize>,
    played: Vec<(PathBuf, bool)>,
    commands: Vec<&'static str>,
    hung_up: bool,
}

/// Telephony fake; the caller's audio is the UTF-8 of what they say.  Hangs up when
/// the script runs out.  Clones share state.
#[derive(Clone, Default)]
pub struct ScriptedIo {
    inner: Arc<Mutex<ScriptedIoInner>>,
}

impl ScriptedIo {
    pub fn new(events: Vec<CallerEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScriptedIoInner {
                events: events.into(),
                ..Default::default()
            })),
        }
    }

    /// The caller talks over the `index`-th playback (0 is the greeting).
    pub fn interrupt_play(self, index: usize, text: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .interruptions
            .insert(index, text.to_string());
        self
    }

    /// The `index`-th playback never returns.
    pub fn stall_play(self, index: usize) -> Self {
        self.inner.lock().unwrap().stalls.insert(index);
        self
    }

    /// Every command issued on the line, in order.
    pub fn commands(&self) -> Vec<&'static str> {
        self.inner.lock().unwrap().commands.clone()
    }

    /// Clip paths played so far, with whether barge-in was allowed.
    pub fn played(&self) -> Vec<(PathBuf, bool)> {
        self.inner.lock().unwrap().played.clone()
    }

    pub fn hung_up(&self) -> bool {
        self.inner.lock().unwrap().hung_up
    }
}

#[async_trait]
impl TurnIo for ScriptedIo {
    async fn record(
        &mut self,
        _max_duration: Duration,
        _silence_timeout: Duration,
    ) -> Result<RecordOutcome, CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push("record");
        match inner.events.pop_front() {
            Some(CallerEvent::Say(text)) => Ok(RecordOutcome::Speech(segment(&text))),
            Some(CallerEvent::Silence) => Ok(RecordOutcome::Silence),
            Some(CallerEvent::HangUp) | None => Err(CallError::TelephonyDisconnect),
        }
    }

    async fn play(&mut self, clip: &AudioClip, allow_barge_in: bool) -> Result<PlayOutcome, CallError> {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            inner.commands.push("play");
            if inner.hung_up {
                return Err(CallError::TelephonyDisconnect);
            }
            let index = inner.played.len();
            inner.played.push((clip.path.clone(), allow_barge_in));
            if inner.stalls.contains(&index) {
                None
            } else {
                match inner.interruptions.remove(&index) {
                    Some(text) if allow_barge_in => Some(PlayOutcome::Interrupted(segment(&text))),
                    _ => Some(PlayOutcome::Completed),
                }
            }
        };
        match outcome {
            Some(outcome) => Ok(outcome),
            None => std::future::pending().await,
        }
    }

    async fn hangup(&mut self) -> Result<(), CallError> {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push("hangup");
        inner.hung_up = true;
        Ok(())
    }

    async fn hold_music(&mut self, _on: bool) -> Result<(), CallError> {
        self.inner.lock().unwrap().commands.push("hold");
        Ok(())
    }
}

/// Returns the audio bytes as text.
#[derive(Default)]
pub struct EchoTranscriber {
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl EchoTranscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` requests.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for EchoTranscriber {
    async fn transcribe(&self, audio: &AudioSegment, _language: &str) -> Result<String, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CallError::TranscriptionFailure("scripted failure".to_string()));
        }
        Ok(String::from_utf8_lossy(&audio.data).to_string())
    }
}

/// Writes the text itself as the "audio" file.
#[derive(Default)]
pub struct FakeSynthesizer {
    texts: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

impl FakeSynthesizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail every text containing `needle`.
    pub fn fail_on(&self, needle: &str) {
        *self.fail_on.lock().unwrap() = Some(needle.to_string());
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for FakeSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        _voice: &VoiceProfile,
        out: &Path,
    ) -> Result<AudioClip, CallError> {
        self.texts.lock().unwrap().push(text.to_string());
        let failing = self
            .fail_on
            .lock()
            .unwrap()
            .as_deref()
            .map_or(false, |needle| text.contains(needle));
        if failing {
            return Err(CallError::SynthesisFailure("scripted failure".to_string()));
        }
        let path = out.with_extension("wav");
        tokio::fs::write(&path, text.as_bytes())
            .await
            .map_err(|e| CallError::SynthesisFailure(e.to_string()))?;
        Ok(AudioClip { path })
    }
}

/// SMS channel that records what it sends; fails with the queued errors first.
pub struct RecordingSms {
    failures: Mutex<VecDeque<Result<(), DeliveryError>>>,
    sent: Mutex<Vec<(String, String)>>,
    attempts: AtomicUsize,
}

impl RecordingSms {
    pub fn new(failures: Vec<Result<(), DeliveryError>>) -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(failures.into()),
            sent: Mutex::new(vec![]),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SmsChannel for RecordingSms {
    fn name(&self) -> &str {
        "recording-sms"
    }

    async fn send_sms(&self, to: &str, body: &str) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(result) = self.failures.lock().unwrap().pop_front() {
            result?;
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}

pub struct RecordingOperator {
    name: String,
    failing: bool,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingOperator {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failing: false,
            sent: Mutex::new(vec![]),
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failing: true,
            sent: Mutex::new(vec![]),
        })
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperatorChannel for RecordingOperator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        if self.failing {
            return Err(DeliveryError::Permanent("mailbox unavailable".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

pub async fn memory_store() -> BookingStore {
    BookingStore::connect("sqlite::memory:", PhoneRules::default())
        .await
        .unwrap()
}

/// A hairdresser, so bookings default to appointments.
pub async fn seed_business(store: &BookingStore, name: &str) -> Business {
    store
        .create_business(NewBusiness {
            name: name.to_string(),
            business_type: "friseur".to_string(),
            mode: None,
            owner_name: Some("Inhaberin".to_string()),
            email: None,
            phone: Some("030 1234567".to_string()),
            address: None,
        })
        .await
        .unwrap()
}

pub fn test_config(audio_dir: &Path, profiles_dir: &Path) -> Config {
    let audio_dir = audio_dir.display().to_string();
    let profiles_dir = profiles_dir.display().to_string();
    let vars: HashMap<&str, String> = HashMap::from([
        ("LLM_PROVIDERS", "ollama".to_string()),
        ("AUDIO_DIR", audio_dir),
        ("PROFILES_DIR", profiles_dir),
        ("ACTIVE_BUSINESS", "salon".to_string()),
        ("DATABASE_URL", "sqlite::memory:".to_string()),
        ("SILENCE_TIMEOUT_SECS", "1".to_string()),
        ("WEB_BASE_URL", "https://termine.example.de".to_string()),
        ("NOTIFY_RETRY_BASE_MS", "1".to_string()),
    ]);
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

/// Everything a call needs, wired to fakes.
pub struct TestApp {
    pub state: Arc<AppState>,
    pub models: Vec<Arc<ScriptedModel>>,
    pub transcriber: Arc<EchoTranscriber>,
    pub synthesizer: Arc<FakeSynthesizer>,
    pub sms: Arc<RecordingSms>,
    pub operator: Arc<RecordingOperator>,
    pub business: Business,
    pub dir: tempfile::TempDir,
}

pub async fn test_app(models: Vec<Arc<ScriptedModel>>) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let audio_dir = dir.path().join("audio");
    let profiles_dir = dir.path().join("profiles");
    std::fs::create_dir_all(&audio_dir).unwrap();
    std::fs::create_dir_all(&profiles_dir).unwrap();
    std::fs::write(
        profiles_dir.join("salon.json"),
        serde_json::to_string(&sample_profile()).unwrap(),
    )
    .unwrap();

    let config = test_config(&audio_dir, &profiles_dir);
    let store = memory_store().await;
    let business = seed_business(&store, &sample_profile().name).await;
    let chain = Arc::new(InferenceChain::new(
        models
            .iter()
            .map(|m| m.clone() as Arc<dyn LanguageModel>)
            .collect(),
        Duration::from_millis(500),
        Duration::from_secs(2),
    ));
    let transcriber = EchoTranscriber::new();
    let synthesizer = FakeSynthesizer::new();
    let sms = RecordingSms::new(vec![]);
    let operator = RecordingOperator::new("email");
    let dispatcher = Arc::new(NotificationDispatcher::new(
        Some(sms.clone()),
        vec![operator.clone()],
        &config.notify,
    ));
    let state = Arc::new(AppState {
        config,
        store,
        chain,
        transcriber: transcriber.clone(),
        synthesizer: synthesizer.clone(),
        dispatcher,
    });
    TestApp {
        state,
        models,
        transcriber,
        synthesizer,
        sms,
        operator,
        business,
        dir,
    }
}
