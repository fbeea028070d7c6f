use crate::error::CallError;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Caller speech captured by the telephony host (8 kHz mono WAV).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSegment {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

/// A synthesized WAV file ready to be played to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub path: PathBuf,
}

impl AudioClip {
    /// Asterisk wants playback paths without the extension.
    pub fn stem_path(&self) -> PathBuf {
        self.path.with_extension("")
    }
}

#[derive(Debug)]
pub enum RecordOutcome {
    Speech(AudioSegment),
    /// Nothing but silence before the timeout
    Silence,
}

#[derive(Debug)]
pub enum PlayOutcome {
    Completed,
    /// Caller started talking; playback was stopped and their speech captured
    Interrupted(AudioSegment),
}

/// Audio primitives of the telephony host for one call.
#[async_trait]
pub trait TurnIo: Send {
    async fn record(
        &mut self,
        max_duration: Duration,
        silence_timeout: Duration,
    ) -> Result<RecordOutcome, CallError>;

    async fn play(&mut self, clip: &AudioClip, allow_barge_in: bool) -> Result<PlayOutcome, CallError>;

    async fn hangup(&mut self) -> Result<(), CallError>;

    /// Hold music while the caller waits on transcription, inference and synthesis.
    async fn hold_music(&mut self, _on: bool) -> Result<(), CallError> {
        Ok(())
    }
}

/// Per-call scratch directory for recordings and synthesized replies.
/// Removed when dropped, whatever way the call ended.
#[derive(Debug)]
pub struct CallArtifacts {
    dir: PathBuf,
}

impl CallArtifacts {
    pub async fn create(audio_dir: &Path, call_id: &str) -> Result<Self, CallError> {
        let safe_id: String = call_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let safe_id = if safe_id.trim_matches('.').is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            safe_id
        };
        let dir = audio_dir.join(safe_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CallError::Telephony(format!("cannot create {}: {e}", dir.display())))?;
        debug!(dir = %dir.display(), "created call audio directory");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `name` without extension; the caller decides the format.
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Drop for CallArtifacts {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(error = %e, dir = %self.dir.display(), "failed to remove call audio directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn artifacts_are_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let artifacts = CallArtifacts::create(root.path(), "1700000000.42").await.unwrap();
        let dir = artifacts.dir().to_path_buf();
        tokio::fs::write(artifacts.path("reply0.wav"), b"RIFF").await.unwrap();
        assert!(dir.exists());
        drop(artifacts);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn call_ids_cannot_escape_the_audio_dir() {
        let root = tempfile::tempdir().unwrap();
        let artifacts = CallArtifacts::create(root.path(), "../../etc").await.unwrap();
        assert!(artifacts.dir().starts_with(root.path()));
        assert_eq!(artifacts.dir().file_name().unwrap(), ".._.._etc");

        let dots = CallArtifacts::create(root.path(), "..").await.unwrap();
        assert_eq!(dots.dir().parent(), Some(root.path()));
    }

    #[test]
    fn clips_play_without_extension() {
        let clip = AudioClip {
            path: PathBuf::from("/tmp/call/reply3.wav"),
        };
        assert_eq!(clip.stem_path(), PathBuf::from("/tmp/call/reply3"));
    }
}
