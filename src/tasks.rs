use crate::agi::{AgiChannel, AgiTurnIo};
use crate::call_session::CallOrchestrator;
use crate::config::{Config, TtsBackend};
use crate::db_types::Business;
use crate::error::{CallError, StoreError};
use crate::extraction::{extract_booking, BookingDraft};
use crate::inference::ChainSession;
use crate::notify::{BookingEvent, DispatchReport};
use crate::phone::normalize_number;
use crate::profile::BusinessProfile;
use crate::speech::VoiceProfile;
use crate::store::CreatedRecord;
use crate::turn_io::{CallArtifacts, TurnIo};
use crate::types::{AppState, CallSession, TerminalStatus};

use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outcome of one call after the post-call pipeline ran.
#[derive(Debug)]
pub struct CallReport {
    pub call_id: String,
    pub status: TerminalStatus,
    pub turns: usize,
    pub draft: BookingDraft,
    pub record: Option<CreatedRecord>,
    /// Portal token of the caller, landline or mobile
    pub customer_token: Option<String>,
    /// Row of the archived call, if archiving worked
    pub archived: Option<i64>,
    /// Notifications keep going after the call is done
    pub notifications: Option<JoinHandle<DispatchReport>>,
}

/// Task that handles one FastAGI connection from answering to archiving.
pub async fn handle_agi_call(stream: TcpStream, state: Arc<AppState>) -> Result<CallReport, CallError> {
    let mut channel = AgiChannel::new(stream);
    let env = channel.read_environment().await?;
    let call_id = env
        .call_id()
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let business = env.arg(1).unwrap_or(&state.config.active_business).to_string();

    let profile = match BusinessProfile::load(&state.config.profiles_dir, &business).await {
        Ok(profile) => profile,
        Err(e) => {
            error!(%call_id, error = %e, "cannot serve call without a business profile");
            let _ = channel.command("HANGUP").await;
            return Err(CallError::Telephony(e.to_string()));
        }
    };

    let artifacts = CallArtifacts::create(&state.config.audio_dir, &call_id).await?;
    let call = &state.config.call;
    let mut io = AgiTurnIo::new(
        channel,
        artifacts.dir().to_path_buf(),
        (call.max_utterance, call.silence_timeout),
    );
    io.answer().await?;
    info!(%call_id, %business, "answered call");

    let report = run_call(
        io,
        &state,
        call_id,
        env.caller_number(),
        Arc::new(profile),
        artifacts.dir(),
    )
    .await;
    drop(artifacts);
    Ok(report)
}

/// Run the conversation over any telephony host, then the post-call pipeline.
pub async fn run_call<Io: TurnIo>(
    io: Io,
    state: &AppState,
    call_id: String,
    caller_number: String,
    profile: Arc<BusinessProfile>,
    audio_dir: &Path,
) -> CallReport {
    let caller_number = normalize_number(&caller_number);
    let phone_class = state.store.phone_rules().classify(&caller_number);
    let mut session = CallSession::new(call_id, caller_number, phone_class, profile.clone());
    debug!(
        call_id = session.call_id(),
        phone_class = phone_class.as_str(),
        "call session started"
    );

    let mut orchestrator = CallOrchestrator::new(
        io,
        &state.config.call,
        state.chain.session(),
        state.transcriber.clone(),
        state.synthesizer.clone(),
        voice_for(&profile, &state.config),
        audio_dir.to_path_buf(),
    );
    let status = orchestrator.run(&mut session).await;
    let mut chain = orchestrator.into_chain();
    wrap_up(state, &mut chain, &session, status).await
}

fn voice_for(profile: &BusinessProfile, config: &Config) -> VoiceProfile {
    let language_code = match &config.tts {
        TtsBackend::Google { language_code, .. } => language_code.clone(),
        TtsBackend::Piper { .. } => {
            let lang = &config.call.language;
            format!("{}-{}", lang, lang.to_uppercase())
        }
    };
    VoiceProfile {
        language_code,
        voice: profile.voice.clone(),
    }
}

/// Configured business id, or the business row named like the profile.
async fn resolve_business(state: &AppState, profile: &BusinessProfile) -> Result<Option<Business>, StoreError> {
    match state.config.booking_business_id {
        Some(id) => state.store.business(id).await,
        None => state.store.business_by_name(&profile.name).await,
    }
}

/// Extraction, booking write, archive and notifications.  Store failures are logged;
/// the call is over either way.
async fn wrap_up(
    state: &AppState,
    chain: &mut ChainSession,
    session: &CallSession,
    status: TerminalStatus,
) -> CallReport {
    let call_id = session.call_id().to_string();
    let draft = extract_booking(chain, session, &state.config.extraction).await;

    let business = match resolve_business(state, session.profile()).await {
        Ok(Some(business)) => Some(business),
        Ok(None) => {
            warn!(%call_id, business = %session.profile().name, "no business row for profile, booking not stored");
            None
        }
        Err(e) => {
            error!(%call_id, error = %e, "failed to look up business");
            None
        }
    };

    let mut record = None;
    let mut customer_token = None;
    if let Some(business) = &business {
        match state.store.record_booking(business.id, &draft, Some(&call_id)).await {
            Ok(created) => record = created,
            Err(e) => error!(%call_id, error = %CallError::from(e), "failed to store booking"),
        }
        if let (Some(_), Some(phone)) = (&record, &draft.customer_phone) {
            match state.store.customer_token(business.id, phone).await {
                Ok(token) => customer_token = Some(token),
                Err(e) => warn!(%call_id, error = %e, "no customer portal token"),
            }
        }
    }

    let archived = match state
        .store
        .archive_call(session, business.as_ref().map(|b| b.id), draft.kind())
        .await
    {
        Ok(row) => Some(row),
        Err(e) => {
            error!(%call_id, error = %e, "failed to archive call");
            None
        }
    };

    let notifications = match (&business, &record) {
        (Some(business), Some(created)) => {
            info!(
                %call_id,
                kind = created.kind.table(),
                id = created.id,
                duplicate_of = ?created.duplicate_of,
                "booking stored"
            );
            Some(state.dispatcher.spawn_booking_created(BookingEvent {
                business_name: business.name.clone(),
                business_phone: business.phone.clone(),
                record: created.clone(),
                draft: draft.clone(),
                customer_phone: draft.customer_phone.clone(),
                customer_token: customer_token.clone(),
                call_duration: session.elapsed(),
            }))
        }
        _ => None,
    };

    CallReport {
        call_id,
        status,
        turns: session.turns().len(),
        draft,
        record,
        customer_token,
        archived,
        notifications,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_types::RecordStatus;
    use crate::extraction::BookingKind;
    use crate::notify::Delivery;
    use crate::phone::PhoneClass;
    use crate::testing::{sample_profile, test_app, CallerEvent, ScriptedIo, ScriptedModel, TestApp};
    use time::OffsetDateTime;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    const BOOKING_JSON: &str = r#"{"has_booking_request": true, "booking_type": "termin",
        "customer_name": "Frau Weber", "phone": null, "requested_date": "morgen",
        "requested_time": "10 Uhr", "service_name": "Haarschnitt"}"#;

    async fn call(app: &TestApp, caller: &str, io: &ScriptedIo) -> CallReport {
        let audio = app.dir.path().join("audio").join("call-1");
        std::fs::create_dir_all(&audio).unwrap();
        run_call(
            io.clone(),
            &app.state,
            "call-1".to_string(),
            caller.to_string(),
            Arc::new(sample_profile()),
            &audio,
        )
        .await
    }

    #[tokio::test]
    async fn booking_call_ends_with_stored_appointment_and_sms() {
        let model = ScriptedModel::new("a")
            .replies(vec![Ok("Gern, morgen um 10 Uhr ist frei. Auf welchen Namen?".into())])
            .extraction(BOOKING_JSON);
        let app = test_app(vec![model]).await;
        let io = ScriptedIo::new(vec![
            CallerEvent::say("Ich hätte gern einen Termin morgen um 10 Uhr"),
            CallerEvent::say("Tschüss"),
        ]);

        let report = call(&app, "0171 1234567", &io).await;
        assert_eq!(report.status, TerminalStatus::Completed);
        assert_eq!(report.turns, 2);
        assert_eq!(report.draft.kind(), BookingKind::Appointment);

        let record = report.record.clone().unwrap();
        let appointment = app
            .state
            .store
            .appointment(app.business.id, record.id)
            .await
            .unwrap()
            .unwrap();
        let tomorrow = OffsetDateTime::now_utc().date().next_day().unwrap();
        assert_eq!(
            appointment.requested_date.as_deref(),
            Some(crate::utils::format_date(tomorrow).as_str())
        );
        assert_eq!(appointment.requested_time.as_deref(), Some("10:00"));
        assert_eq!(appointment.status, RecordStatus::New);
        assert_eq!(appointment.call_id.as_deref(), Some("call-1"));

        let dispatch = report.notifications.unwrap().await.unwrap();
        assert_eq!(dispatch.customer_sms, Delivery::Sent { attempts: 1 });
        let sms = app.sms.sent();
        assert_eq!(sms[0].0, "01711234567");
        assert!(sms[0].1.contains("https://termine.example.de/kunde?t="));
        assert_eq!(app.operator.sent().len(), 1);

        let archived = app.state.store.call_by_call_id("call-1").await.unwrap().unwrap();
        assert_eq!(Some(archived.id), report.archived);
        assert_eq!(app.state.store.call_turns(archived.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn max_turns_still_runs_the_post_call_pipeline() {
        let model = ScriptedModel::new("a").extraction(BOOKING_JSON);
        let app = test_app(vec![model]).await;
        let io = ScriptedIo::new((0..25).map(|i| CallerEvent::say(&format!("Frage {i}"))).collect());

        let report = call(&app, "0171 1234567", &io).await;
        assert_eq!(report.status, TerminalStatus::MaxTurnsReached);
        assert_eq!(report.turns, 20);
        assert!(report.record.is_some());
        assert!(report.archived.is_some());
    }

    #[tokio::test]
    async fn landline_booking_asks_for_callback() {
        let model = ScriptedModel::new("a").extraction(BOOKING_JSON);
        let app = test_app(vec![model]).await;
        let io = ScriptedIo::new(vec![CallerEvent::say("Termin morgen um 10"), CallerEvent::HangUp]);

        let report = call(&app, "030 1234567", &io).await;
        assert_eq!(report.status, TerminalStatus::HungUp);
        let record = report.record.clone().unwrap();
        assert_eq!(record.phone_class, PhoneClass::Landline);
        assert!(record.callback_required);

        let dispatch = report.notifications.unwrap().await.unwrap();
        assert_eq!(dispatch.customer_sms, Delivery::Skipped("landline"));
        assert!(app.sms.sent().is_empty());
        assert!(app.operator.sent()[0].0.starts_with("RÜCKRUF ERBETEN"));

        // the SMS is skipped but the caller still gets portal access
        let token = report.customer_token.unwrap();
        let customer = app.state.store.customer_by_token(&token).await.unwrap().unwrap();
        assert_eq!(customer.business_id, app.business.id);
        assert_eq!(customer.customer_phone, "0301234567");
    }

    #[tokio::test]
    async fn exhausted_chain_archives_call_without_booking() {
        let model = ScriptedModel::new("a").replies(
            (0..3)
                .map(|_| Err(crate::error::ProviderError::Fatal("401".into())))
                .collect(),
        );
        let app = test_app(vec![model]).await;
        let io = ScriptedIo::new(vec![CallerEvent::say("Hallo?"), CallerEvent::HangUp]);

        let report = call(&app, "0171 1234567", &io).await;
        assert_eq!(report.status, TerminalStatus::HungUp);
        assert_eq!(report.draft.kind(), BookingKind::None);
        assert!(report.record.is_none());
        assert!(report.notifications.is_none());
        let archived = app.state.store.call_by_call_id("call-1").await.unwrap().unwrap();
        assert_eq!(archived.booking_kind, "none");
    }

    #[tokio::test]
    async fn agi_connection_is_answered_and_archived() {
        let app = test_app(vec![ScriptedModel::new("a")]).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let asterisk = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, mut write) = stream.into_split();
            write
                .write_all(b"agi_uniqueid: 1700000000.42\nagi_callerid: 01711234567\nagi_arg_1: salon\n\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(read).lines();
            let mut seen = vec![];
            while let Ok(Some(command)) = lines.next_line().await {
                // the caller hangs up during the greeting
                let reply = if command == "ANSWER" { "200 result=0" } else { "200 result=-1" };
                seen.push(command);
                if write.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            seen
        });

        let (stream, _) = listener.accept().await.unwrap();
        let report = handle_agi_call(stream, app.state.clone()).await.unwrap();
        assert_eq!(report.call_id, "1700000000.42");
        assert_eq!(report.status, TerminalStatus::HungUp);
        assert_eq!(report.turns, 0);

        let seen = asterisk.await.unwrap();
        assert_eq!(seen[0], "ANSWER");
        assert!(seen[1].starts_with("STREAM FILE"));

        let archived = app
            .state
            .store
            .call_by_call_id("1700000000.42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(archived.status, "hung-up");
        assert!(!app.dir.path().join("audio").join("1700000000.42").exists());
    }
}
