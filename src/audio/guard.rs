//! Resource lifecycle guard
//!
//! Every component that needs the sound card goes through
//! [`ResourceGuard::acquire`] and holds the returned [`ResourceBundle`] for
//! as long as it uses the device. The bundle releases on drop, so early
//! returns and `?` never leak a device, and the guard refuses a second
//! acquisition while one is live.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::audio::backend::{AudioBackend, AudioInput, AudioOutput, DeviceEventSender};
use crate::config::CaptureConfig;
use crate::error::AudioError;

/// What a caller needs from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceRequest {
    /// Output only (single track playback)
    Output,
    /// Output and capture (live session)
    Duplex,
}

/// Occupancy marker for one process-wide slot
struct Lease {
    slot: Arc<AtomicBool>,
}

impl Lease {
    fn claim(slot: &Arc<AtomicBool>, what: &str) -> Result<Self, AudioError> {
        if slot.swap(true, Ordering::SeqCst) {
            return Err(AudioError::ResourceUnavailable(format!("{} already in use", what)));
        }
        Ok(Self { slot: slot.clone() })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::SeqCst);
    }
}

/// Hands out device bundles, one at a time
#[derive(Clone)]
pub struct ResourceGuard {
    backend: Arc<dyn AudioBackend>,
    capture: CaptureConfig,
    output_slot: Arc<AtomicBool>,
    input_slot: Arc<AtomicBool>,
}

impl ResourceGuard {
    pub fn new(backend: Arc<dyn AudioBackend>, capture: CaptureConfig) -> Self {
        Self {
            backend,
            capture,
            output_slot: Arc::new(AtomicBool::new(false)),
            input_slot: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Acquire the requested devices. On failure anything already opened is
    /// released before the error is returned.
    pub fn acquire(
        &self,
        request: ResourceRequest,
        events: DeviceEventSender,
    ) -> Result<ResourceBundle, AudioError> {
        let mut bundle = ResourceBundle::empty();

        bundle.output_lease = Some(Lease::claim(&self.output_slot, "audio output")?);
        let output = self
            .backend
            .open_output(events.clone())
            .map_err(unavailable)?;
        bundle.output = Some(output);

        if request == ResourceRequest::Duplex {
            bundle.input_lease = Some(Lease::claim(&self.input_slot, "microphone")?);
            let input = self
                .backend
                .open_input(self.capture.frame_size, self.capture.ring_capacity, events)
                .map_err(unavailable)?;
            bundle.input = Some(input);
        }

        tracing::debug!("Acquired {:?} resources", request);
        Ok(bundle)
    }

    pub fn output_in_use(&self) -> bool {
        self.output_slot.load(Ordering::SeqCst)
    }

    pub fn input_in_use(&self) -> bool {
        self.input_slot.load(Ordering::SeqCst)
    }
}

fn unavailable(err: AudioError) -> AudioError {
    match err {
        AudioError::ResourceUnavailable(_) => err,
        other => AudioError::ResourceUnavailable(other.to_string()),
    }
}

/// Devices held by one owner. Released exactly once, at the latest on drop.
pub struct ResourceBundle {
    output: Option<Box<dyn AudioOutput>>,
    input: Option<Box<dyn AudioInput>>,
    output_lease: Option<Lease>,
    input_lease: Option<Lease>,
}

impl ResourceBundle {
    fn empty() -> Self {
        Self {
            output: None,
            input: None,
            output_lease: None,
            input_lease: None,
        }
    }

    pub fn output(&self) -> Option<&dyn AudioOutput> {
        self.output.as_deref()
    }

    pub fn output_mut(&mut self) -> Option<&mut (dyn AudioOutput + 'static)> {
        self.output.as_deref_mut()
    }

    pub fn input(&self) -> Option<&dyn AudioInput> {
        self.input.as_deref()
    }

    /// Tear down capture only, keeping the output alive
    pub fn release_input(&mut self) {
        if let Some(mut input) = self.input.take() {
            input.close();
            tracing::debug!("Capture released");
        }
        self.input_lease = None;
    }

    /// Close everything. Safe to call repeatedly and on partial bundles.
    pub fn release(&mut self) {
        self.release_input();
        if let Some(mut output) = self.output.take() {
            output.close();
            tracing::debug!("Output released");
        }
        self.output_lease = None;
    }

    pub fn is_released(&self) -> bool {
        self.output.is_none()
            && self.input.is_none()
            && self.output_lease.is_none()
            && self.input_lease.is_none()
    }
}

impl Drop for ResourceBundle {
    fn drop(&mut self) {
        self.release();
    }
}
