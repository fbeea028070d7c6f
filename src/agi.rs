use crate::error::CallError;
use crate::tasks;
use crate::types::AppState;
use crate::turn_io::{AudioClip, AudioSegment, PlayOutcome, RecordOutcome, TurnIo};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Recordings smaller than this hold nothing but the WAV header and line noise.
pub const MIN_SPEECH_BYTES: u64 = 1_000;

const BARGE_IN_DIGITS: &str = "0123456789#*";

/// Variables Asterisk sends before the first command (`agi_callerid`, `agi_uniqueid`, ...).
#[derive(Debug, Clone, Default)]
pub struct AgiEnvironment {
    vars: HashMap<String, String>,
}

impl AgiEnvironment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.get("agi_uniqueid").filter(|v| !v.is_empty())
    }

    /// Caller ID, empty for anonymous callers.
    pub fn caller_number(&self) -> String {
        match self.get("agi_callerid") {
            Some(id) if !matches!(id.to_lowercase().as_str(), "unknown" | "anonymous" | "") => {
                id.to_string()
            }
            _ => String::new(),
        }
    }

    /// Dialplan arguments, `AGI(agi://host,arg1,...)`, 1-based.
    pub fn arg(&self, n: usize) -> Option<&str> {
        self.get(&format!("agi_arg_{n}")).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgiReply {
    pub code: u16,
    pub result: i32,
    pub data: Option<String>,
}

/// Parse a `200 result=1 (timeout) endpos=1234` style line.
pub fn parse_reply(line: &str) -> Result<AgiReply, CallError> {
    let line = line.trim();
    if line.starts_with("HANGUP") {
        return Err(CallError::TelephonyDisconnect);
    }
    let code: u16 = line
        .get(..3)
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| CallError::Telephony(format!("unexpected AGI line '{line}'")))?;
    match code {
        200 => {}
        511 => return Err(CallError::TelephonyDisconnect),
        _ => return Err(CallError::Telephony(format!("AGI error: {line}"))),
    }
    let result = line
        .split_whitespace()
        .find_map(|part| part.strip_prefix("result="))
        .and_then(|r| r.parse::<i32>().ok())
        .ok_or_else(|| CallError::Telephony(format!("AGI reply without result: '{line}'")))?;
    let data = match (line.find('('), line.rfind(')')) {
        (Some(start), Some(end)) if end > start => Some(line[start + 1..end].to_string()),
        _ => None,
    };
    Ok(AgiReply { code, result, data })
}

fn quote(path: &std::path::Path) -> String {
    format!("\"{}\"", path.display().to_string().replace('"', ""))
}

/// One FastAGI connection.
pub struct AgiChannel<S> {
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> AgiChannel<S> {
    pub fn new(stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }

    async fn read_line(&mut self) -> Result<String, CallError> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.map_err(|e| {
            warn!(error = %e, "AGI read failed");
            CallError::TelephonyDisconnect
        })?;
        if n == 0 {
            return Err(CallError::TelephonyDisconnect);
        }
        Ok(line.trim_end().to_string())
    }

    pub async fn read_environment(&mut self) -> Result<AgiEnvironment, CallError> {
        let mut env = AgiEnvironment::default();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                env.vars.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        debug!(vars = env.vars.len(), "read AGI environment");
        Ok(env)
    }

    pub async fn command(&mut self, command: &str) -> Result<AgiReply, CallError> {
        debug!(%command, "AGI command");
        self.writer
            .write_all(format!("{command}\n").as_bytes())
            .await
            .map_err(|_| CallError::TelephonyDisconnect)?;
        self.writer
            .flush()
            .await
            .map_err(|_| CallError::TelephonyDisconnect)?;
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                continue;
            }
            if line.starts_with("520-") {
                // multi-line usage message, ends with "520 End of proper usage."
                while !self.read_line().await?.starts_with("520 ") {}
                return Err(CallError::Telephony(format!("invalid AGI command usage: {command}")));
            }
            return parse_reply(&line);
        }
    }
}

/// [`TurnIo`] over FastAGI.  Recordings go into the call's artifact directory,
/// which Asterisk must be able to write.
pub struct AgiTurnIo<S> {
    channel: AgiChannel<S>,
    dir: PathBuf,
    recordings: usize,
    barge_in_limits: (Duration, Duration),
    music_on: bool,
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> AgiTurnIo<S> {
    /// `barge_in_limits` bounds the recording taken after the caller interrupts playback.
    pub fn new(channel: AgiChannel<S>, dir: PathBuf, barge_in_limits: (Duration, Duration)) -> Self {
        Self {
            channel,
            dir,
            recordings: 0,
            barge_in_limits,
            music_on: false,
        }
    }

    pub async fn answer(&mut self) -> Result<(), CallError> {
        let reply = self.channel.command("ANSWER").await?;
        if reply.result < 0 {
            return Err(CallError::TelephonyDisconnect);
        }
        Ok(())
    }

    async fn record_segment(
        &mut self,
        max_duration: Duration,
        silence_timeout: Duration,
    ) -> Result<RecordOutcome, CallError> {
        let base = self.dir.join(format!("caller{}", self.recordings));
        self.recordings += 1;
        let silence_secs = silence_timeout.as_secs_f32().ceil().max(1.0) as u64;
        let reply = self
            .channel
            .command(&format!(
                "RECORD FILE {} wav \"#\" {} 0 s={}",
                quote(&base),
                max_duration.as_millis(),
                silence_secs
            ))
            .await?;
        if reply.result < 0 {
            return Err(CallError::TelephonyDisconnect);
        }
        let wav = base.with_extension("wav");
        match tokio::fs::metadata(&wav).await {
            Ok(meta) if meta.len() >= MIN_SPEECH_BYTES => {
                let data = tokio::fs::read(&wav).await.map_err(|e| {
                    error!(error = %e, path = %wav.display(), "failed to read recording");
                    CallError::Telephony(format!("unreadable recording: {e}"))
                })?;
                Ok(RecordOutcome::Speech(AudioSegment { path: wav, data }))
            }
            Ok(_) => Ok(RecordOutcome::Silence),
            Err(_) => {
                debug!(path = %wav.display(), "no recording written");
                Ok(RecordOutcome::Silence)
            }
        }
    }

    async fn set_music(&mut self, on: bool) -> Result<(), CallError> {
        if self.music_on == on {
            return Ok(());
        }
        let command = if on { "SET MUSIC ON default" } else { "SET MUSIC OFF" };
        self.channel.command(command).await?;
        self.music_on = on;
        Ok(())
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> TurnIo for AgiTurnIo<S> {
    async fn record(
        &mut self,
        max_duration: Duration,
        silence_timeout: Duration,
    ) -> Result<RecordOutcome, CallError> {
        self.set_music(false).await?;
        self.record_segment(max_duration, silence_timeout).await
    }

    async fn play(&mut self, clip: &AudioClip, allow_barge_in: bool) -> Result<PlayOutcome, CallError> {
        self.set_music(false).await?;
        let digits = if allow_barge_in { BARGE_IN_DIGITS } else { "" };
        let reply = self
            .channel
            .command(&format!("STREAM FILE {} \"{digits}\"", quote(&clip.stem_path())))
            .await?;
        match reply.result {
            r if r < 0 => Err(CallError::TelephonyDisconnect),
            0 => Ok(PlayOutcome::Completed),
            digit => {
                debug!(digit, "playback interrupted by caller");
                let (max, silence) = self.barge_in_limits;
                match self.record_segment(max, silence).await? {
                    RecordOutcome::Speech(segment) => Ok(PlayOutcome::Interrupted(segment)),
                    // a key press without speech after it
                    RecordOutcome::Silence => Ok(PlayOutcome::Completed),
                }
            }
        }
    }

    async fn hangup(&mut self) -> Result<(), CallError> {
        self.channel.command("HANGUP").await.map(|_| ())
    }

    async fn hold_music(&mut self, on: bool) -> Result<(), CallError> {
        self.set_music(on).await
    }
}

/// FastAGI accept loop; every connection is one call.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "FastAGI server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "accepted AGI connection");
        let state = state.clone();
        tokio::spawn(async move {
            match tasks::handle_agi_call(stream, state).await {
                Ok(report) => info!(
                    %peer,
                    call_id = %report.call_id,
                    status = %report.status,
                    turns = report.turns,
                    booking = report.draft.kind().as_str(),
                    record_id = ?report.record.as_ref().map(|r| r.id),
                    archived = report.archived.is_some(),
                    portal_token = report.customer_token.is_some(),
                    notifying = report.notifications.is_some(),
                    "call finished"
                ),
                Err(e) => warn!(%peer, error = %e, "call ended with error"),
            }
        });
    }
}
