use crate::config::CallSettings;
use crate::error::CallError;
use crate::inference::{ChainSession, InstructionMode};
use crate::speech::{Synthesizer, Transcriber, VoiceProfile};
use crate::turn_io::{AudioClip, AudioSegment, PlayOutcome, RecordOutcome, TurnIo};
use crate::types::{CallSession, ChatMessage, StageLatencies, TerminalStatus, TurnDraft};
use crate::utils::contains_phrase;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// Slack on top of the recording limits before a silent adapter is given up on.
const RECORD_GRACE: Duration = Duration::from_secs(5);

/// A reply waiting to be spoken, together with what the caller said.
#[derive(Debug)]
struct PendingTurn {
    draft: TurnDraft,
    /// The call is over once this reply has been played
    ends_call: bool,
}

#[derive(Debug)]
enum CallState {
    Greeting,
    Listening,
    Transcribing { audio: AudioSegment },
    Inferring { caller_text: String, latencies: StageLatencies },
    Synthesizing(PendingTurn),
    Speaking { pending: PendingTurn, clip: AudioClip },
    Ended(TerminalStatus),
}

impl CallState {
    fn name(&self) -> &'static str {
        match self {
            CallState::Greeting => "greeting",
            CallState::Listening => "listening",
            CallState::Transcribing { .. } => "transcribing",
            CallState::Inferring { .. } => "inferring",
            CallState::Synthesizing(_) => "synthesizing",
            CallState::Speaking { .. } => "speaking",
            CallState::Ended(_) => "ended",
        }
    }
}

/// How an I/O failure ends the call.
fn ended_by(e: CallError) -> CallState {
    match e {
        CallError::TelephonyDisconnect => CallState::Ended(TerminalStatus::HungUp),
        other => {
            error!(error = %other, "telephony failure");
            CallState::Ended(TerminalStatus::Error)
        }
    }
}

/// Drives one call through listen, transcribe, infer, synthesize and speak until it ends.
pub struct CallOrchestrator<'a, Io> {
    io: Io,
    settings: &'a CallSettings,
    chain: ChainSession,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn Synthesizer>,
    voice: VoiceProfile,
    audio_dir: PathBuf,
    apology: Option<AudioClip>,
    reprompt: Option<AudioClip>,
    clips: usize,
    no_input: u32,
    /// A command was abandoned mid-flight; its reply may still be on the channel
    channel_lost: bool,
}

impl<'a, Io: TurnIo> CallOrchestrator<'a, Io> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        io: Io,
        settings: &'a CallSettings,
        chain: ChainSession,
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn Synthesizer>,
        voice: VoiceProfile,
        audio_dir: PathBuf,
    ) -> Self {
        Self {
            io,
            settings,
            chain,
            transcriber,
            synthesizer,
            voice,
            audio_dir,
            apology: None,
            reprompt: None,
            clips: 0,
            no_input: 0,
            channel_lost: false,
        }
    }

    /// The chain session outlives the conversation; extraction reuses it.
    pub fn into_chain(self) -> ChainSession {
        self.chain
    }

    pub async fn run(&mut self, session: &mut CallSession) -> TerminalStatus {
        let mut state = CallState::Greeting;
        loop {
            debug!(call_id = session.call_id(), state = state.name(), "call state");
            state = match state {
                CallState::Greeting => self.greet(session).await,
                CallState::Listening => self.listen(session).await,
                CallState::Transcribing { audio } => self.transcribe(session, audio).await,
                CallState::Inferring {
                    caller_text,
                    latencies,
                } => self.infer(session, caller_text, latencies).await,
                CallState::Synthesizing(pending) => self.synthesize(pending).await,
                CallState::Speaking { pending, clip } => self.speak(session, pending, clip).await,
                CallState::Ended(status) => {
                    if let Err(e) = session.finish(status) {
                        error!(error = %e, "call finished twice");
                    }
                    if self.channel_lost {
                        warn!(call_id = session.call_id(), "telephony channel out of sync, not hanging up");
                    } else if let Err(e) = self.io.hangup().await {
                        debug!(error = %e, "hangup on a closed channel");
                    }
                    info!(
                        call_id = session.call_id(),
                        status = status.as_str(),
                        turns = session.turns().len(),
                        elapsed_s = session.elapsed().as_secs(),
                        "call ended"
                    );
                    return status;
                }
            };
        }
    }

    async fn render(&mut self, text: &str) -> Result<AudioClip, CallError> {
        let out = self.audio_dir.join(format!("reply{}", self.clips));
        self.clips += 1;
        match timeout(
            self.settings.tts_timeout,
            self.synthesizer.synthesize(text, &self.voice, &out),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CallError::SynthesisFailure(format!(
                "no audio within {}s",
                self.settings.tts_timeout.as_secs()
            ))),
        }
    }

    /// End the call after a telephony command was cut off by a timeout.  No further
    /// command may be sent on the channel.
    fn abandon_channel(&mut self, session: &CallSession, stage: &str) -> CallState {
        warn!(call_id = session.call_id(), stage, "telephony command did not return");
        self.channel_lost = true;
        CallState::Ended(TerminalStatus::TimedOut)
    }

    fn remaining(&self, session: &CallSession) -> Duration {
        self.settings
            .max_call_duration
            .saturating_sub(session.elapsed())
    }

    /// Play a clip that is not a turn (greeting, re-prompt).  Caller speech during it
    /// goes straight to transcription.
    async fn play_prompt(&mut self, session: &CallSession, clip: &AudioClip) -> CallState {
        let remaining = self.remaining(session);
        match timeout(remaining, self.io.play(clip, true)).await {
            Ok(Ok(PlayOutcome::Completed)) => CallState::Listening,
            Ok(Ok(PlayOutcome::Interrupted(audio))) => {
                self.hold(true).await;
                CallState::Transcribing { audio }
            }
            Ok(Err(e)) => ended_by(e),
            Err(_) => self.abandon_channel(session, "prompt"),
        }
    }

    async fn hold(&mut self, on: bool) {
        if let Err(e) = self.io.hold_music(on).await {
            debug!(error = %e, "hold music unavailable");
        }
    }

    async fn greet(&mut self, session: &mut CallSession) -> CallState {
        let greeting = session.profile().greeting();
        let clip = match self.render(&greeting).await {
            Ok(clip) => clip,
            Err(e) => {
                error!(call_id = session.call_id(), error = %e, "cannot synthesize greeting");
                return CallState::Ended(TerminalStatus::Error);
            }
        };
        let apology = self.settings.apology_reply.clone();
        match self.render(&apology).await {
            Ok(apology) => self.apology = Some(apology),
            Err(e) => {
                error!(call_id = session.call_id(), error = %e, "cannot synthesize apology");
                return CallState::Ended(TerminalStatus::Error);
            }
        }
        session.set_greeting(greeting);
        self.play_prompt(session, &clip).await
    }

    async fn listen(&mut self, session: &mut CallSession) -> CallState {
        if session.elapsed() >= self.settings.max_call_duration {
            info!(call_id = session.call_id(), "call duration ceiling reached");
            return CallState::Ended(TerminalStatus::TimedOut);
        }
        let ceiling = self.settings.max_utterance + self.settings.silence_timeout + RECORD_GRACE;
        let recorded = timeout(
            ceiling,
            self.io
                .record(self.settings.max_utterance, self.settings.silence_timeout),
        )
        .await;
        match recorded {
            Ok(Ok(RecordOutcome::Speech(audio))) => {
                self.hold(true).await;
                CallState::Transcribing { audio }
            }
            Ok(Ok(RecordOutcome::Silence)) => self.no_input(session).await,
            Ok(Err(e)) => ended_by(e),
            Err(_) => {
                debug!(call_id = session.call_id(), error = %CallError::InputTimeout, "recording cut off");
                self.abandon_channel(session, "record")
            }
        }
    }

    async fn no_input(&mut self, session: &mut CallSession) -> CallState {
        self.no_input += 1;
        if self.no_input > self.settings.no_input_retries {
            info!(call_id = session.call_id(), attempts = self.no_input, "caller stayed silent");
            return CallState::Ended(TerminalStatus::TimedOut);
        }
        debug!(call_id = session.call_id(), attempt = self.no_input, "no input, re-prompting");
        if self.reprompt.is_none() {
            let text = self.settings.reprompt.clone();
            match self.render(&text).await {
                Ok(clip) => self.reprompt = Some(clip),
                Err(e) => warn!(error = %e, "cannot synthesize re-prompt, using apology"),
            }
        }
        match self.reprompt.clone().or_else(|| self.apology.clone()) {
            Some(clip) => self.play_prompt(session, &clip).await,
            None => CallState::Listening,
        }
    }

    async fn transcribe(&mut self, session: &mut CallSession, audio: AudioSegment) -> CallState {
        let started = Instant::now();
        let mut last_error = None;
        for attempt in 1..=2 {
            let result = match timeout(
                self.settings.stt_timeout,
                self.transcriber.transcribe(&audio, &self.settings.language),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(CallError::TranscriptionFailure("timed out".to_string())),
            };
            match result {
                Ok(text) if text.trim().is_empty() => {
                    debug!(call_id = session.call_id(), "empty transcript");
                    self.hold(false).await;
                    return self.no_input(session).await;
                }
                Ok(text) => {
                    self.no_input = 0;
                    info!(call_id = session.call_id(), caller = %text, "caller said");
                    return CallState::Inferring {
                        caller_text: text.trim().to_string(),
                        latencies: StageLatencies {
                            transcribe: started.elapsed(),
                            ..Default::default()
                        },
                    };
                }
                Err(e) => {
                    warn!(call_id = session.call_id(), attempt, error = %e, "transcription failed");
                    last_error = Some(e);
                }
            }
        }
        error!(
            call_id = session.call_id(),
            error = ?last_error,
            "transcription failed twice, apologizing"
        );
        let pending = PendingTurn {
            draft: TurnDraft {
                reply_text: self.settings.apology_reply.clone(),
                latencies: StageLatencies {
                    transcribe: started.elapsed(),
                    ..Default::default()
                },
                degraded: true,
                ..Default::default()
            },
            ends_call: false,
        };
        match self.apology.clone() {
            Some(clip) => CallState::Speaking { pending, clip },
            None => CallState::Synthesizing(pending),
        }
    }

    async fn infer(
        &mut self,
        session: &mut CallSession,
        caller_text: String,
        mut latencies: StageLatencies,
    ) -> CallState {
        if contains_phrase(&caller_text, &self.settings.farewell_phrases) {
            info!(call_id = session.call_id(), "caller said goodbye");
            return CallState::Synthesizing(PendingTurn {
                draft: TurnDraft {
                    caller_text,
                    reply_text: self.settings.farewell_reply.clone(),
                    latencies,
                    ..Default::default()
                },
                ends_call: true,
            });
        }

        let mut history = session.history();
        history.push(ChatMessage::user(caller_text.clone()));
        let started = Instant::now();
        let reply = timeout(
            self.settings.inference_ceiling,
            self.chain
                .complete(&history, session.profile(), InstructionMode::Conversation),
        )
        .await
        .unwrap_or(Err(CallError::InferenceExhausted));
        latencies.infer = started.elapsed();

        let (reply_text, provider, degraded) = match reply {
            Ok(reply) => (reply.text, Some(reply.provider), false),
            Err(e) => {
                warn!(call_id = session.call_id(), error = %e, "using fallback reply");
                (self.settings.fallback_reply.clone(), None, true)
            }
        };
        let ends_call =
            !degraded && contains_phrase(&reply_text, &self.settings.assistant_farewell_phrases);
        CallState::Synthesizing(PendingTurn {
            draft: TurnDraft {
                caller_text,
                reply_text,
                provider,
                latencies,
                degraded,
                ..Default::default()
            },
            ends_call,
        })
    }

    async fn synthesize(&mut self, mut pending: PendingTurn) -> CallState {
        let started = Instant::now();
        let text = pending.draft.reply_text.clone();
        let rendered = self.render(&text).await;
        pending.draft.latencies.synthesize = started.elapsed();
        match rendered {
            Ok(clip) => CallState::Speaking { pending, clip },
            Err(e) => match self.apology.clone() {
                Some(apology) => {
                    warn!(error = %e, "synthesis failed, playing apology");
                    pending.draft.reply_text = self.settings.apology_reply.clone();
                    pending.draft.degraded = true;
                    CallState::Speaking {
                        pending,
                        clip: apology,
                    }
                }
                None => {
                    error!(error = %e, "synthesis failed and no apology cached");
                    CallState::Ended(TerminalStatus::Error)
                }
            },
        }
    }

    async fn speak(
        &mut self,
        session: &mut CallSession,
        mut pending: PendingTurn,
        clip: AudioClip,
    ) -> CallState {
        let started = Instant::now();
        let remaining = self.remaining(session);
        let played = timeout(remaining, self.io.play(&clip, !pending.ends_call)).await;
        pending.draft.latencies.speak = started.elapsed();

        let interrupted = match played {
            Ok(Ok(PlayOutcome::Completed)) => None,
            Ok(Ok(PlayOutcome::Interrupted(audio))) => {
                pending.draft.barge_in = true;
                Some(audio)
            }
            Ok(Err(e)) => {
                self.append(session, pending.draft);
                return ended_by(e);
            }
            Err(_) => {
                self.append(session, pending.draft);
                return self.abandon_channel(session, "reply");
            }
        };
        self.append(session, pending.draft);

        if pending.ends_call {
            return CallState::Ended(TerminalStatus::Completed);
        }
        if session.turns().len() >= self.settings.max_turns {
            info!(call_id = session.call_id(), "turn limit reached");
            return CallState::Ended(TerminalStatus::MaxTurnsReached);
        }
        if session.elapsed() >= self.settings.max_call_duration {
            return CallState::Ended(TerminalStatus::TimedOut);
        }
        match interrupted {
            Some(audio) => {
                debug!(call_id = session.call_id(), "caller barged in");
                self.hold(true).await;
                CallState::Transcribing { audio }
            }
            None => CallState::Listening,
        }
    }

    fn append(&self, session: &mut CallSession, draft: TurnDraft) {
        let call_id = session.call_id().to_string();
        match session.append_turn(draft) {
            Ok(turn) => debug!(
                call_id = %call_id,
                index = turn.index,
                provider = ?turn.provider,
                barge_in = turn.barge_in,
                degraded = turn.degraded,
                "turn recorded"
            ),
            Err(e) => error!(error = %e, "turn after end of call"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::inference::{InferenceChain, LanguageModel};
    use crate::phone::PhoneClass;
    use crate::testing::{
        sample_profile, CallerEvent, EchoTranscriber, FakeSynthesizer, ScriptedIo, ScriptedModel,
    };

    struct Harness {
        settings: CallSettings,
        models: Vec<Arc<ScriptedModel>>,
        transcriber: Arc<EchoTranscriber>,
        synthesizer: Arc<FakeSynthesizer>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(models: Vec<Arc<ScriptedModel>>) -> Self {
            Self {
                settings: CallSettings {
                    silence_timeout: Duration::from_millis(10),
                    max_utterance: Duration::from_millis(100),
                    ..Default::default()
                },
                models,
                transcriber: EchoTranscriber::new(),
                synthesizer: FakeSynthesizer::new(),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        async fn run(&self, io: &ScriptedIo) -> CallSession {
            let chain = Arc::new(InferenceChain::new(
                self.models
                    .iter()
                    .map(|m| m.clone() as Arc<dyn LanguageModel>)
                    .collect(),
                Duration::from_millis(200),
                Duration::from_secs(2),
            ));
            let mut session = CallSession::new(
                "call-1".to_string(),
                "01711234567".to_string(),
                PhoneClass::Mobile,
                Arc::new(sample_profile()),
            );
            let mut orchestrator = CallOrchestrator::new(
                io.clone(),
                &self.settings,
                chain.session(),
                self.transcriber.clone(),
                self.synthesizer.clone(),
                VoiceProfile {
                    language_code: "de-DE".to_string(),
                    voice: None,
                },
                self.dir.path().to_path_buf(),
            );
            orchestrator.run(&mut session).await;
            session
        }
    }

    #[tokio::test]
    async fn caller_farewell_ends_call_in_same_turn() {
        let model = ScriptedModel::new("groq/llama").replies(vec![Ok("Gern, auf welchen Namen?".into())]);
        let harness = Harness::new(vec![model]);
        let io = ScriptedIo::new(vec![
            CallerEvent::say("Ich brauche einen Termin"),
            CallerEvent::say("Nein danke, TSCHÜSS!"),
        ]);
        let session = harness.run(&io).await;

        assert_eq!(session.status(), Some(TerminalStatus::Completed));
        let turns = session.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].provider.as_deref(), Some("groq/llama"));
        assert_eq!(turns[1].provider, None);
        assert_eq!(turns[1].reply_text, harness.settings.farewell_reply);
        // greeting, reply, farewell; the farewell may not be interrupted
        let played = io.played();
        assert_eq!(played.len(), 3);
        assert!(!played[2].1);
        assert!(io.hung_up());
    }

    #[tokio::test]
    async fn turn_indices_are_contiguous_and_limit_is_enforced() {
        let harness = Harness {
            settings: CallSettings {
                max_turns: 3,
                ..Harness::new(vec![]).settings
            },
            ..Harness::new(vec![ScriptedModel::new("a")])
        };
        let io = ScriptedIo::new((0..10).map(|i| CallerEvent::say(&format!("Frage {i}"))).collect());
        let session = harness.run(&io).await;

        assert_eq!(session.status(), Some(TerminalStatus::MaxTurnsReached));
        let indices: Vec<usize> = session.turns().iter().map(|t| t.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn exhausted_chain_substitutes_fallback_reply() {
        let a = ScriptedModel::new("a").replies(vec![Err(ProviderError::Fatal("401".into()))]);
        let b = ScriptedModel::new("b").replies(vec![Err(ProviderError::RateLimited("429".into()))]);
        let harness = Harness::new(vec![a, b]);
        let io = ScriptedIo::new(vec![CallerEvent::say("Hallo?"), CallerEvent::HangUp]);
        let session = harness.run(&io).await;

        assert_eq!(session.status(), Some(TerminalStatus::HungUp));
        let turn = &session.turns()[0];
        assert_eq!(turn.reply_text, harness.settings.fallback_reply);
        assert!(turn.degraded);
        assert_eq!(turn.provider, None);
    }

    #[tokio::test]
    async fn barge_in_cuts_playback_and_transcribes_interruption() {
        let model = ScriptedModel::new("a").replies(vec![
            Ok("Wir haben montags bis freitags von neun bis achtzehn Uhr geöffnet.".into()),
            Ok("Samstags bis vierzehn Uhr.".into()),
        ]);
        let harness = Harness::new(vec![model.clone()]);
        // play #1 is the first reply (play #0 is the greeting)
        let io = ScriptedIo::new(vec![CallerEvent::say("Wann haben Sie offen?"), CallerEvent::HangUp])
            .interrupt_play(1, "Und samstags?");
        let session = harness.run(&io).await;

        let turns = session.turns();
        assert_eq!(turns.len(), 2);
        assert!(turns[0].barge_in);
        assert_eq!(turns[1].caller_text, "Und samstags?");
        assert!(!turns[1].barge_in);
        assert_eq!(model.calls(), 2);
        assert_eq!(session.status(), Some(TerminalStatus::HungUp));
    }

    #[tokio::test]
    async fn silence_reprompts_then_times_out() {
        let harness = Harness::new(vec![ScriptedModel::new("a")]);
        let io = ScriptedIo::new(vec![
            CallerEvent::Silence,
            CallerEvent::Silence,
            CallerEvent::Silence,
        ]);
        let session = harness.run(&io).await;

        assert_eq!(session.status(), Some(TerminalStatus::TimedOut));
        assert!(session.turns().is_empty());
        // greeting plus two re-prompts
        assert_eq!(io.played().len(), 3);
        assert!(harness.synthesizer.texts().contains(&harness.settings.reprompt));
    }

    #[tokio::test]
    async fn speech_after_reprompt_resets_the_no_input_counter() {
        let harness = Harness::new(vec![ScriptedModel::new("a")]);
        let io = ScriptedIo::new(vec![
            CallerEvent::Silence,
            CallerEvent::Silence,
            CallerEvent::say("Doch, ich bin da."),
            CallerEvent::Silence,
            CallerEvent::Silence,
            CallerEvent::say("Tschüss"),
        ]);
        let session = harness.run(&io).await;
        assert_eq!(session.status(), Some(TerminalStatus::Completed));
        assert_eq!(session.turns().len(), 2);
    }

    #[tokio::test]
    async fn failed_transcription_is_retried_once_then_apologized() {
        let harness = Harness::new(vec![ScriptedModel::new("a")]);
        harness.transcriber.fail_next(2);
        let io = ScriptedIo::new(vec![CallerEvent::say("rauschen"), CallerEvent::say("Tschüss")]);
        let session = harness.run(&io).await;

        let turns = session.turns();
        assert_eq!(turns.len(), 2);
        assert!(turns[0].degraded);
        assert_eq!(turns[0].caller_text, "");
        assert_eq!(turns[0].reply_text, harness.settings.apology_reply);
        assert_eq!(harness.transcriber.calls(), 3);
        assert_eq!(session.status(), Some(TerminalStatus::Completed));
    }

    #[tokio::test]
    async fn synthesis_failure_plays_cached_apology() {
        let model = ScriptedModel::new("a").replies(vec![Ok("Das kostet 25 Euro.".into())]);
        let harness = Harness::new(vec![model]);
        harness.synthesizer.fail_on("25 Euro");
        let io = ScriptedIo::new(vec![CallerEvent::say("Was kostet ein Haarschnitt?"), CallerEvent::HangUp]);
        let session = harness.run(&io).await;

        let turn = &session.turns()[0];
        assert!(turn.degraded);
        assert_eq!(turn.reply_text, harness.settings.apology_reply);
        assert_eq!(turn.provider.as_deref(), Some("a"));
        let played = io.played();
        assert_eq!(played[1].0, played_apology(&harness));
    }

    fn played_apology(harness: &Harness) -> PathBuf {
        // the apology is the second clip rendered, right after the greeting
        harness.dir.path().join("reply1.wav")
    }

    #[tokio::test]
    async fn greeting_synthesis_failure_ends_with_error() {
        let harness = Harness::new(vec![ScriptedModel::new("a")]);
        harness.synthesizer.fail_on("Guten Tag");
        let io = ScriptedIo::new(vec![CallerEvent::say("Hallo")]);
        let session = harness.run(&io).await;
        assert_eq!(session.status(), Some(TerminalStatus::Error));
        assert!(io.played().is_empty());
        assert!(io.hung_up());
    }

    #[tokio::test]
    async fn assistant_goodbye_ends_call_after_playback() {
        let model = ScriptedModel::new("a").replies(vec![Ok(
            "Ihr Termin ist notiert. Auf Wiederhören!".into(),
        )]);
        let harness = Harness::new(vec![model]);
        let io = ScriptedIo::new(vec![CallerEvent::say("Morgen um zehn, Müller."), CallerEvent::say("Hallo?")]);
        let session = harness.run(&io).await;

        assert_eq!(session.status(), Some(TerminalStatus::Completed));
        assert_eq!(session.turns().len(), 1);
        assert!(!io.played()[1].1);
    }

    #[tokio::test]
    async fn empty_transcript_counts_as_no_input() {
        let harness = Harness::new(vec![ScriptedModel::new("a")]);
        let io = ScriptedIo::new(vec![
            CallerEvent::say("   "),
            CallerEvent::say(""),
            CallerEvent::say(" "),
        ]);
        let session = harness.run(&io).await;
        assert_eq!(session.status(), Some(TerminalStatus::TimedOut));
        assert!(session.turns().is_empty());
    }

    #[tokio::test]
    async fn empty_transcript_between_silences_uses_up_retries() {
        let harness = Harness::new(vec![ScriptedModel::new("a")]);
        assert_eq!(harness.settings.no_input_retries, 2);
        let io = ScriptedIo::new(vec![
            CallerEvent::Silence,
            CallerEvent::say("  "),
            CallerEvent::Silence,
            CallerEvent::say("zu spät"),
        ]);
        let session = harness.run(&io).await;
        assert_eq!(session.status(), Some(TerminalStatus::TimedOut));
        assert!(session.turns().is_empty());
        // greeting plus two re-prompts
        assert_eq!(io.played().len(), 3);
    }

    #[tokio::test]
    async fn stalled_playback_sends_no_further_commands() {
        let harness = Harness {
            settings: CallSettings {
                max_call_duration: Duration::from_millis(300),
                ..Harness::new(vec![]).settings
            },
            ..Harness::new(vec![ScriptedModel::new("a")])
        };
        let io = ScriptedIo::new(vec![CallerEvent::say("Hallo"), CallerEvent::say("Noch da?")])
            .stall_play(1);
        let session = harness.run(&io).await;

        assert_eq!(session.status(), Some(TerminalStatus::TimedOut));
        assert_eq!(session.turns().len(), 1);
        assert!(!io.hung_up());
        assert_eq!(io.commands().last(), Some(&"play"));
        assert_eq!(io.played().len(), 2);
    }

    #[tokio::test]
    async fn duration_ceiling_ends_call() {
        let harness = Harness {
            settings: CallSettings {
                max_call_duration: Duration::ZERO,
                ..Harness::new(vec![]).settings
            },
            ..Harness::new(vec![ScriptedModel::new("a")])
        };
        let io = ScriptedIo::new(vec![CallerEvent::say("Hallo")]);
        let session = harness.run(&io).await;
        assert_eq!(session.status(), Some(TerminalStatus::TimedOut));
    }
}
