//! Error types for the audio engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device and output errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Playback failed: {0}")]
    PlaybackFailed(String),

    #[error("Output is closed")]
    OutputClosed,
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Decoding failed: {0}")]
    DecodeFailed(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),
}

/// Errors returned to handle callers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Engine is no longer running")]
    EngineStopped,
}

/// Failure classification surfaced on observable state.
///
/// Consumers are usually far removed in time from the call that caused a
/// failure, so errors land here instead of being returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ErrorKind {
    ResourceUnavailable(String),
    DecodeFailed(String),
    PlaybackFailed(String),
    TransportClosed(String),
}

impl ErrorKind {
    /// Recoverable errors are absorbed locally; everything else ends the
    /// session or the current track.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::DecodeFailed(_))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ResourceUnavailable(msg) => write!(f, "resource unavailable: {}", msg),
            ErrorKind::DecodeFailed(msg) => write!(f, "decode failed: {}", msg),
            ErrorKind::PlaybackFailed(msg) => write!(f, "playback failed: {}", msg),
            ErrorKind::TransportClosed(msg) => write!(f, "transport closed: {}", msg),
        }
    }
}

impl From<&AudioError> for ErrorKind {
    fn from(err: &AudioError) -> Self {
        match err {
            AudioError::ResourceUnavailable(msg) => ErrorKind::ResourceUnavailable(msg.clone()),
            AudioError::DeviceNotFound(msg) => ErrorKind::ResourceUnavailable(msg.clone()),
            other => ErrorKind::PlaybackFailed(other.to_string()),
        }
    }
}

impl From<&CodecError> for ErrorKind {
    fn from(err: &CodecError) -> Self {
        ErrorKind::DecodeFailed(err.to_string())
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
