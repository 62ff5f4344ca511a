//! Shared state and message types
//!
//! Everything here is plain data: what consumers observe through the watch
//! channels, and what the remote endpoint sends during a live session.

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_STREAM_SAMPLE_RATE;
use crate::error::{CodecError, ErrorKind};

/// How the bytes behind a track locator are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackEncoding {
    /// A container file (wav, mp3, flac, ogg, m4a...) detected on load
    ContainerFile,
    /// Base64 text carrying little-endian PCM16 at the stream sample rate
    RawPcmBase64,
}

/// One playable unit of audio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Opaque reference resolved by a [`TrackLoader`](crate::playback::TrackLoader)
    pub locator: String,
    pub label: String,
    pub encoding: TrackEncoding,
}

impl Track {
    pub fn new(
        locator: impl Into<String>,
        label: impl Into<String>,
        encoding: TrackEncoding,
    ) -> Self {
        Self {
            locator: locator.into(),
            label: label.into(),
            encoding,
        }
    }

    /// Container file track labelled with its locator
    pub fn file(locator: impl Into<String>) -> Self {
        let locator = locator.into();
        Self::new(locator.clone(), locator, TrackEncoding::ContainerFile)
    }

    /// Identity is the locator only; labels may differ between requests.
    pub fn same_source(&self, other: &Track) -> bool {
        self.locator == other.locator
    }

    /// File extension of the locator, used as a format hint
    pub fn extension(&self) -> Option<&str> {
        let name = self.locator.rsplit(['/', '\\']).next()?;
        let (_, ext) = name.rsplit_once('.')?;
        let ext = ext.split(['?', '#']).next()?;
        (!ext.is_empty()).then_some(ext)
    }
}

/// Process-wide playback status
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    pub active_track: Option<Track>,
    pub is_playing: bool,
    pub position_seconds: f64,
    pub duration_seconds: f64,
    pub last_error: Option<ErrorKind>,
}

impl PlaybackState {
    /// With no active track nothing can be playing and position is zero.
    pub fn is_consistent(&self) -> bool {
        self.active_track.is_some() || (!self.is_playing && self.position_seconds == 0.0)
    }
}

/// Observable view of the autoplay queue
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub tracks: Vec<Track>,
    pub current_index: Option<usize>,
    pub active: bool,
}

impl QueueSnapshot {
    pub fn current_track(&self) -> Option<&Track> {
        self.current_index.and_then(|i| self.tracks.get(i))
    }
}

/// Live session lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Listening,
    Analyzing,
    Speaking,
    Error,
}

impl SessionState {
    /// States that hold device resources
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Listening
                | SessionState::Analyzing
                | SessionState::Speaking
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Listening => "listening",
            SessionState::Analyzing => "analyzing",
            SessionState::Speaking => "speaking",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Observable view of the current live session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: Option<uuid::Uuid>,
    pub state: SessionState,
    pub error: Option<ErrorKind>,
    pub frames_sent: u64,
    pub chunks_scheduled: u64,
    pub chunks_dropped: u64,
}

/// Inline audio blob as sent by live synthesis endpoints
///
/// ```json
/// { "mimeType": "audio/pcm;rate=24000", "data": "AAABAAIA..." }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineAudio {
    pub mime_type: String,
    pub data: String,
}

impl InlineAudio {
    pub fn from_json(json: &str) -> Result<Self, CodecError> {
        serde_json::from_str(json).map_err(|e| CodecError::DecodeFailed(e.to_string()))
    }

    /// Raw PCM blobs only; anything else cannot be scheduled directly.
    pub fn is_pcm(&self) -> bool {
        let mime = self.mime_type.to_ascii_lowercase();
        mime.starts_with("audio/") && (mime.contains("pcm") || mime.contains("l16"))
    }

    /// Sample rate from the `rate=` parameter, or the stream default
    pub fn sample_rate(&self) -> u32 {
        self.mime_type
            .split(';')
            .filter_map(|part| part.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse().ok())
            .unwrap_or(DEFAULT_STREAM_SAMPLE_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_identity_ignores_label() {
        let a = Track::new("surah/1.mp3", "Al-Fatiha", TrackEncoding::ContainerFile);
        let b = Track::new("surah/1.mp3", "Opening", TrackEncoding::ContainerFile);
        let c = Track::file("surah/2.mp3");
        assert!(a.same_source(&b));
        assert!(!a.same_source(&c));
    }

    #[test]
    fn test_track_extension() {
        assert_eq!(Track::file("a/b/c.mp3").extension(), Some("mp3"));
        assert_eq!(Track::file("https://cdn/x.ogg?sig=1").extension(), Some("ogg"));
        assert_eq!(Track::file("noext").extension(), None);
        assert_eq!(Track::file("dir.d/noext").extension(), None);
    }

    #[test]
    fn test_default_state_is_consistent() {
        assert!(PlaybackState::default().is_consistent());
        let broken = PlaybackState {
            is_playing: true,
            ..Default::default()
        };
        assert!(!broken.is_consistent());
    }

    #[test]
    fn test_inline_audio_rate() {
        let blob =
            InlineAudio::from_json(r#"{"mimeType":"audio/pcm;rate=16000","data":""}"#).unwrap();
        assert!(blob.is_pcm());
        assert_eq!(blob.sample_rate(), 16000);

        let blob = InlineAudio {
            mime_type: "audio/pcm".into(),
            data: String::new(),
        };
        assert_eq!(blob.sample_rate(), DEFAULT_STREAM_SAMPLE_RATE);

        let blob = InlineAudio {
            mime_type: "image/png".into(),
            data: String::new(),
        };
        assert!(!blob.is_pcm());
    }
}
