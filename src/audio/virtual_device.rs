//! Deterministic in-process backend
//!
//! Nothing plays: the clock only moves when the host calls
//! [`VirtualBackend::advance`], which is also when voices finish and
//! [`DeviceEvent::VoiceEnded`] is sent. Used for headless hosts and tests.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::audio::backend::{
    AudioBackend, AudioInput, AudioOutput, DeviceEvent, DeviceEventSender, VoiceId,
};
use crate::audio::buffer::{create_shared_buffer, AudioFrame, PcmBuffer, SharedRingBuffer};
use crate::constants::VIRTUAL_OUTPUT_SAMPLE_RATE;
use crate::error::AudioError;

/// A voice as the virtual output recorded it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceRecord {
    pub voice: VoiceId,
    pub start: f64,
    pub end: f64,
    pub offset: f64,
}

struct OutputSlot {
    id: u64,
    events: DeviceEventSender,
    active: BTreeMap<VoiceId, VoiceRecord>,
}

struct InputSlot {
    id: u64,
    ring: SharedRingBuffer,
    frame_size: usize,
    sequence: u32,
}

struct VirtualState {
    clock: f64,
    next_handle: u64,
    output: Option<OutputSlot>,
    input: Option<InputSlot>,
    history: Vec<VoiceRecord>,
    deny_output: Option<String>,
    deny_input: Option<String>,
    reject_voices: Option<String>,
    outputs_opened: usize,
    inputs_opened: usize,
}

/// Shared handle to the virtual device; clones see the same device.
#[derive(Clone)]
pub struct VirtualBackend {
    state: Arc<Mutex<VirtualState>>,
    sample_rate: u32,
    input_rate: u32,
    input_channels: u16,
}

impl VirtualBackend {
    pub fn new() -> Self {
        Self::with_rates(VIRTUAL_OUTPUT_SAMPLE_RATE, 48_000, 1)
    }

    pub fn with_rates(output_rate: u32, input_rate: u32, input_channels: u16) -> Self {
        Self {
            state: Arc::new(Mutex::new(VirtualState {
                clock: 0.0,
                next_handle: 1,
                output: None,
                input: None,
                history: Vec::new(),
                deny_output: None,
                deny_input: None,
                reject_voices: None,
                outputs_opened: 0,
                inputs_opened: 0,
            })),
            sample_rate: output_rate,
            input_rate,
            input_channels,
        }
    }

    pub fn now(&self) -> f64 {
        self.state.lock().clock
    }

    /// Move the clock forward, finishing voices in end-time order.
    /// Returns the voices that ended.
    pub fn advance(&self, seconds: f64) -> Vec<VoiceId> {
        let mut state = self.state.lock();
        state.clock += seconds.max(0.0);
        let clock = state.clock;

        let Some(output) = state.output.as_mut() else {
            return Vec::new();
        };
        let mut finished: Vec<VoiceRecord> = output
            .active
            .values()
            .filter(|record| record.end <= clock + 1e-9)
            .copied()
            .collect();
        finished.sort_by(|a, b| a.end.total_cmp(&b.end));

        for record in &finished {
            output.active.remove(&record.voice);
            let _ = output.events.send(DeviceEvent::VoiceEnded(record.voice));
        }
        finished.into_iter().map(|r| r.voice).collect()
    }

    /// Simulate the output device failing mid-stream
    pub fn fail_output(&self, message: &str) {
        let state = self.state.lock();
        if let Some(output) = state.output.as_ref() {
            let _ = output.events.send(DeviceEvent::OutputFailed(message.to_string()));
        }
    }

    /// Push one captured block as if the microphone produced it.
    /// Returns false when no input is open or the ring overflowed.
    pub fn capture(&self, samples: Vec<f32>) -> bool {
        let mut state = self.state.lock();
        let clock = state.clock;
        let channels = self.input_channels;
        let Some(input) = state.input.as_mut() else {
            return false;
        };
        let sequence = input.sequence;
        input.sequence = input.sequence.wrapping_add(1);
        let frame = AudioFrame::new(samples, channels, (clock * 1_000_000.0) as u64, sequence);
        input.ring.push(frame)
    }

    /// Push a block of the configured frame size filled with `value`
    pub fn capture_block(&self, value: f32) -> bool {
        let len = {
            let state = self.state.lock();
            match state.input.as_ref() {
                Some(input) => input.frame_size * self.input_channels as usize,
                None => return false,
            }
        };
        self.capture(vec![value; len])
    }

    pub fn deny_output(&self, reason: &str) {
        self.state.lock().deny_output = Some(reason.to_string());
    }

    pub fn allow_output(&self) {
        self.state.lock().deny_output = None;
    }

    pub fn deny_input(&self, reason: &str) {
        self.state.lock().deny_input = Some(reason.to_string());
    }

    pub fn allow_input(&self) {
        self.state.lock().deny_input = None;
    }

    /// Make `start_voice` fail, as an output rejecting audio would
    pub fn reject_voices(&self, reason: Option<&str>) {
        self.state.lock().reject_voices = reason.map(str::to_string);
    }

    pub fn live_outputs(&self) -> usize {
        usize::from(self.state.lock().output.is_some())
    }

    pub fn live_inputs(&self) -> usize {
        usize::from(self.state.lock().input.is_some())
    }

    pub fn outputs_opened(&self) -> usize {
        self.state.lock().outputs_opened
    }

    pub fn inputs_opened(&self) -> usize {
        self.state.lock().inputs_opened
    }

    /// Voices currently scheduled or playing
    pub fn active_voices(&self) -> Vec<VoiceRecord> {
        let state = self.state.lock();
        let mut voices: Vec<VoiceRecord> = state
            .output
            .as_ref()
            .map(|o| o.active.values().copied().collect())
            .unwrap_or_default();
        voices.sort_by(|a, b| a.start.total_cmp(&b.start));
        voices
    }

    /// Every voice ever started, in start order
    pub fn history(&self) -> Vec<VoiceRecord> {
        self.state.lock().history.clone()
    }
}

impl Default for VirtualBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioBackend for VirtualBackend {
    fn open_output(&self, events: DeviceEventSender) -> Result<Box<dyn AudioOutput>, AudioError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.deny_output.clone() {
            return Err(AudioError::ResourceUnavailable(reason));
        }
        if state.output.is_some() {
            return Err(AudioError::ResourceUnavailable("virtual output busy".into()));
        }
        let id = state.next_handle;
        state.next_handle += 1;
        state.outputs_opened += 1;
        state.output = Some(OutputSlot {
            id,
            events,
            active: BTreeMap::new(),
        });
        Ok(Box::new(VirtualOutput {
            state: self.state.clone(),
            id,
            sample_rate: self.sample_rate,
            closed: false,
        }))
    }

    fn open_input(
        &self,
        frame_size: usize,
        ring_capacity: usize,
        _events: DeviceEventSender,
    ) -> Result<Box<dyn AudioInput>, AudioError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.deny_input.clone() {
            return Err(AudioError::ResourceUnavailable(reason));
        }
        if state.input.is_some() {
            return Err(AudioError::ResourceUnavailable("virtual microphone busy".into()));
        }
        let id = state.next_handle;
        state.next_handle += 1;
        state.inputs_opened += 1;
        let ring = create_shared_buffer(ring_capacity);
        state.input = Some(InputSlot {
            id,
            ring: ring.clone(),
            frame_size,
            sequence: 0,
        });
        Ok(Box::new(VirtualInput {
            state: self.state.clone(),
            id,
            ring,
            sample_rate: self.input_rate,
            channels: self.input_channels,
        }))
    }
}

struct VirtualOutput {
    state: Arc<Mutex<VirtualState>>,
    id: u64,
    sample_rate: u32,
    closed: bool,
}

impl AudioOutput for VirtualOutput {
    fn current_time(&self) -> f64 {
        self.state.lock().clock
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start_voice(
        &mut self,
        buffer: Arc<PcmBuffer>,
        start_at: f64,
        offset: f64,
    ) -> Result<VoiceId, AudioError> {
        if self.closed {
            return Err(AudioError::OutputClosed);
        }
        let mut state = self.state.lock();
        if let Some(reason) = state.reject_voices.clone() {
            return Err(AudioError::PlaybackFailed(reason));
        }
        let clock = state.clock;
        let start = start_at.max(clock);
        let remaining = (buffer.duration() - offset.max(0.0)).max(0.0);
        let record = VoiceRecord {
            voice: VoiceId::next(),
            start,
            end: start + remaining,
            offset,
        };
        let output = state.output.as_mut().filter(|o| o.id == self.id);
        let Some(output) = output else {
            return Err(AudioError::OutputClosed);
        };
        output.active.insert(record.voice, record);
        state.history.push(record);
        Ok(record.voice)
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        let mut state = self.state.lock();
        if let Some(output) = state.output.as_mut().filter(|o| o.id == self.id) {
            output.active.remove(&voice);
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.state.lock();
        if state.output.as_ref().is_some_and(|o| o.id == self.id) {
            state.output = None;
        }
    }
}

impl Drop for VirtualOutput {
    fn drop(&mut self) {
        self.close();
    }
}

struct VirtualInput {
    state: Arc<Mutex<VirtualState>>,
    id: u64,
    ring: SharedRingBuffer,
    sample_rate: u32,
    channels: u16,
}

impl AudioInput for VirtualInput {
    fn frames(&self) -> SharedRingBuffer {
        self.ring.clone()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn close(&mut self) {
        let mut state = self.state.lock();
        if state.input.as_ref().is_some_and(|i| i.id == self.id) {
            state.input = None;
        }
    }
}

impl Drop for VirtualInput {
    fn drop(&mut self) {
        self.close();
    }
}
