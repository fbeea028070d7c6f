use crate::config::{SttBackend, TtsBackend};
use crate::deepgram_types::PrerecordedResponse;
use crate::error::CallError;
use crate::google_tts_types::{
    AudioConfig, SynthesisInput, SynthesizeSpeechRequest, SynthesizeSpeechResponse,
    VoiceSelectionParams,
};
use crate::turn_io::{AudioClip, AudioSegment};
use crate::utils::b64_decode_to_buf;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

/// Asterisk plays 8 kHz mono without resampling.
pub const PBX_SAMPLE_RATE: u32 = 8_000;

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Empty string when the recording holds no recognizable speech.
    async fn transcribe(&self, audio: &AudioSegment, language: &str) -> Result<String, CallError>;
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Render `text` to `<out>.wav`.
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceProfile,
        out: &Path,
    ) -> Result<AudioClip, CallError>;
}

/// Per-business voice selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceProfile {
    pub language_code: String,
    /// Backend specific voice name, or the default voice when absent
    pub voice: Option<String>,
}

pub fn transcriber_from_settings(
    backend: &SttBackend,
    http_client: &reqwest::Client,
) -> Arc<dyn Transcriber> {
    match backend {
        SttBackend::Deepgram {
            api_key,
            model,
            base_url,
        } => Arc::new(DeepgramTranscriber {
            api_key: api_key.clone(),
            model: model.clone(),
            base_url: base_url.clone(),
            http_client: http_client.clone(),
        }),
        SttBackend::Whisper { binary, model_path } => Arc::new(WhisperTranscriber {
            binary: binary.clone(),
            model_path: model_path.clone(),
        }),
    }
}

pub fn synthesizer_from_settings(
    backend: &TtsBackend,
    http_client: &reqwest::Client,
) -> Arc<dyn Synthesizer> {
    match backend {
        TtsBackend::Google {
            api_key,
            voice,
            language_code,
            base_url,
        } => Arc::new(GoogleSynthesizer {
            api_key: api_key.clone(),
            default_voice: voice.clone(),
            default_language: language_code.clone(),
            base_url: base_url.clone(),
            http_client: http_client.clone(),
        }),
        TtsBackend::Piper {
            binary,
            voice_model,
            sox,
        } => Arc::new(PiperSynthesizer {
            binary: binary.clone(),
            voice_model: voice_model.clone(),
            sox: sox.clone(),
        }),
    }
}

/// Deepgram pre-recorded `/listen` endpoint.
pub struct DeepgramTranscriber {
    api_key: String,
    model: String,
    base_url: String,
    http_client: reqwest::Client,
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn transcribe(&self, audio: &AudioSegment, language: &str) -> Result<String, CallError> {
        let resp = self
            .http_client
            .post(format!("{}/listen", self.base_url))
            .query(&[
                ("model", self.model.as_str()),
                ("language", language),
                ("smart_format", "true"),
            ])
            .header("Authorization", format!("Token {}", self.api_key))
            .header("Content-Type", "audio/wav")
            .body(audio.data.clone())
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "failed to send audio to deepgram");
                CallError::TranscriptionFailure(e.to_string())
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "deepgram rejected audio");
            return Err(CallError::TranscriptionFailure(format!("deepgram returned {status}")));
        }
        let body: PrerecordedResponse = resp.json().await.map_err(|e| {
            error!(error = %e, "failed to parse deepgram response");
            CallError::TranscriptionFailure(e.to_string())
        })?;
        let transcript = body.transcript().unwrap_or_default().trim().to_string();
        debug!(%transcript, "deepgram transcript");
        Ok(transcript)
    }
}

/// Local whisper.cpp binary.
pub struct WhisperTranscriber {
    binary: PathBuf,
    model_path: PathBuf,
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &AudioSegment, language: &str) -> Result<String, CallError> {
        let output = Command::new(&self.binary)
            .arg("-m")
            .arg(&self.model_path)
            .args(["-l", language, "-nt", "-f"])
            .arg(&audio.path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                error!(error = %e, binary = %self.binary.display(), "failed to start whisper");
                CallError::TranscriptionFailure(e.to_string())
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(status = %output.status, %stderr, "whisper failed");
            return Err(CallError::TranscriptionFailure(format!(
                "whisper exited with {}",
                output.status
            )));
        }
        let transcript = whisper_text(&String::from_utf8_lossy(&output.stdout));
        debug!(%transcript, "whisper transcript");
        Ok(transcript)
    }
}

/// Join whisper's output lines and drop its non-speech markers like `[BLANK_AUDIO]`.
fn whisper_text(stdout: &str) -> String {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| !(line.starts_with('[') && line.ends_with(']')))
        .filter(|line| !(line.starts_with('(') && line.ends_with(')')))
        .collect::<Vec<&str>>()
        .join(" ")
}

/// Google Cloud Text-to-Speech, LINEAR16 at the PBX rate.
pub struct GoogleSynthesizer {
    api_key: String,
    default_voice: String,
    default_language: String,
    base_url: String,
    http_client: reqwest::Client,
}

#[async_trait]
impl Synthesizer for GoogleSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceProfile,
        out: &Path,
    ) -> Result<AudioClip, CallError> {
        let request = SynthesizeSpeechRequest {
            input: SynthesisInput {
                text: text.to_string(),
            },
            voice: VoiceSelectionParams {
                language_code: if voice.language_code.is_empty() {
                    self.default_language.clone()
                } else {
                    voice.language_code.clone()
                },
                name: Some(voice.voice.clone().unwrap_or_else(|| self.default_voice.clone())),
            },
            audio_config: AudioConfig {
                audio_encoding: "LINEAR16".to_string(),
                sample_rate_hertz: PBX_SAMPLE_RATE,
            },
        };
        let resp = self
            .http_client
            .post(format!("{}/text:synthesize", self.base_url))
            .query(&[("key", &self.api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "failed to send request to google tts");
                CallError::SynthesisFailure(e.to_string())
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(%status, %body, "google tts rejected request");
            return Err(CallError::SynthesisFailure(format!("google tts returned {status}")));
        }
        let body: SynthesizeSpeechResponse = resp.json().await.map_err(|e| {
            error!(error = %e, "failed to parse google tts response");
            CallError::SynthesisFailure(e.to_string())
        })?;
        let mut wav = Vec::new();
        b64_decode_to_buf(body.audio_content, &mut wav)
            .map_err(|e| CallError::SynthesisFailure(format!("bad audio content: {e}")))?;
        let path = out.with_extension("wav");
        tokio::fs::write(&path, &wav)
            .await
            .map_err(|e| CallError::SynthesisFailure(format!("cannot write {}: {e}", path.display())))?;
        debug!(bytes = wav.len(), path = %path.display(), "synthesized reply");
        Ok(AudioClip { path })
    }
}

/// Local piper binary, resampled with sox.
pub struct PiperSynthesizer {
    binary: PathBuf,
    voice_model: PathBuf,
    sox: PathBuf,
}

#[async_trait]
impl Synthesizer for PiperSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceProfile,
        out: &Path,
    ) -> Result<AudioClip, CallError> {
        let model = voice
            .voice
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.voice_model.clone());
        let raw = out.with_extension("raw.wav");
        let mut child = Command::new(&self.binary)
            .arg("--model")
            .arg(&model)
            .arg("--output_file")
            .arg(&raw)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!(error = %e, binary = %self.binary.display(), "failed to start piper");
                CallError::SynthesisFailure(e.to_string())
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| CallError::SynthesisFailure(format!("piper stdin: {e}")))?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CallError::SynthesisFailure(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(status = %output.status, %stderr, "piper failed");
            return Err(CallError::SynthesisFailure(format!("piper exited with {}", output.status)));
        }

        let path = out.with_extension("wav");
        let status = Command::new(&self.sox)
            .arg(&raw)
            .arg("-r")
            .arg(PBX_SAMPLE_RATE.to_string())
            .args(["-c", "1"])
            .arg(&path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| {
                error!(error = %e, "failed to start sox");
                CallError::SynthesisFailure(e.to_string())
            })?;
        let _ = tokio::fs::remove_file(&raw).await;
        if !status.success() {
            return Err(CallError::SynthesisFailure(format!("sox exited with {status}")));
        }
        Ok(AudioClip { path })
    }
}
