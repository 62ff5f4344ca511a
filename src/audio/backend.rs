//! Device abstraction
//!
//! The engine never touches a sound card directly. An [`AudioBackend`]
//! opens at most one [`AudioOutput`] and one [`AudioInput`]; device threads
//! report back through [`DeviceEvent`]s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::audio::buffer::{PcmBuffer, SharedRingBuffer};
use crate::error::AudioError;

/// Handle of one buffer scheduled on an output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

impl std::fmt::Display for VoiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "voice#{}", self.0)
    }
}

static NEXT_VOICE: AtomicU64 = AtomicU64::new(1);

impl VoiceId {
    /// Voice ids are unique for the whole process so a late event from a
    /// closed output can never match a voice on the next one.
    pub fn next() -> Self {
        VoiceId(NEXT_VOICE.fetch_add(1, Ordering::Relaxed))
    }
}

/// Asynchronous notifications from device threads
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A voice played to its natural end. Never sent for stopped voices.
    VoiceEnded(VoiceId),
    /// The output device rejected audio or disappeared
    OutputFailed(String),
    /// The capture device failed
    CaptureFailed(String),
}

pub type DeviceEventSender = mpsc::UnboundedSender<DeviceEvent>;
pub type DeviceEventReceiver = mpsc::UnboundedReceiver<DeviceEvent>;

/// An open output stream that plays scheduled voices
pub trait AudioOutput: Send {
    /// Output clock in seconds; monotonic while the output is open
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Schedule `buffer` to start at `start_at` (clock seconds), skipping the
    /// first `offset` seconds of it. A start time in the past starts now.
    fn start_voice(
        &mut self,
        buffer: Arc<PcmBuffer>,
        start_at: f64,
        offset: f64,
    ) -> Result<VoiceId, AudioError>;

    /// Silence a voice immediately. Unknown voices are ignored.
    fn stop_voice(&mut self, voice: VoiceId);

    /// Stop every voice and close the stream. Idempotent.
    fn close(&mut self);
}

/// An open capture stream delivering fixed-size blocks into a ring
pub trait AudioInput: Send {
    fn frames(&self) -> SharedRingBuffer;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;

    /// Stop capturing. Idempotent.
    fn close(&mut self);
}

/// Factory for device streams
pub trait AudioBackend: Send + Sync {
    fn open_output(&self, events: DeviceEventSender) -> Result<Box<dyn AudioOutput>, AudioError>;

    /// Open the capture device delivering blocks of `frame_size` frames
    /// into a ring of `ring_capacity` blocks.
    fn open_input(
        &self,
        frame_size: usize,
        ring_capacity: usize,
        events: DeviceEventSender,
    ) -> Result<Box<dyn AudioInput>, AudioError>;
}

/// Create the device event channel
pub fn device_channel() -> (DeviceEventSender, DeviceEventReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_ids_are_unique() {
        let a = VoiceId::next();
        let b = VoiceId::next();
        assert!(b > a);
        assert_eq!(format!("{}", VoiceId(7)), "voice#7");
    }
}
