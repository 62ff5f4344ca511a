//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or none
//! at all) is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub playback: PlaybackConfig,
    pub capture: CaptureConfig,
    pub stream: StreamConfig,
}

/// Single-track playback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Position update cadence while playing
    pub position_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            position_interval_ms: DEFAULT_POSITION_INTERVAL_MS,
        }
    }
}

/// Microphone capture and outbound frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Frames per captured block. Larger blocks mean fewer, later frames.
    pub frame_size: usize,
    /// Rate of the PCM16 frames handed to `on_frame`
    pub target_sample_rate: u32,
    /// Blocks the capture ring holds before dropping
    pub ring_capacity: usize,
    /// How often the ring is drained
    pub poll_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_CAPTURE_FRAME_SIZE,
            target_sample_rate: DEFAULT_CAPTURE_SAMPLE_RATE,
            ring_capacity: CAPTURE_RING_CAPACITY,
            poll_interval_ms: DEFAULT_CAPTURE_POLL_MS,
        }
    }
}

/// Synthesized audio coming back from the remote endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_STREAM_SAMPLE_RATE,
            channels: DEFAULT_STREAM_CHANNELS,
        }
    }
}

impl EngineConfig {
    /// Read and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: EngineConfig =
            toml::from_str(&text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when the
    /// file is missing or unusable
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => {
                tracing::info!("Loaded configuration from {}", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("Ignoring configuration at {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// `<config dir>/live-audio-core/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "live-audio", "live-audio-core")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.playback.position_interval_ms == 0 {
            return Err(Error::Config("playback.position_interval_ms must be > 0".into()));
        }
        if self.capture.frame_size == 0 {
            return Err(Error::Config("capture.frame_size must be > 0".into()));
        }
        if self.capture.target_sample_rate == 0 {
            return Err(Error::Config("capture.target_sample_rate must be > 0".into()));
        }
        if self.capture.ring_capacity == 0 {
            return Err(Error::Config("capture.ring_capacity must be > 0".into()));
        }
        if self.capture.poll_interval_ms == 0 {
            return Err(Error::Config("capture.poll_interval_ms must be > 0".into()));
        }
        if self.stream.sample_rate == 0 || self.stream.channels == 0 {
            return Err(Error::Config("stream.sample_rate and stream.channels must be > 0".into()));
        }
        Ok(())
    }
}
