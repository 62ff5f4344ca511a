//! Sample-accurate voice rendering
//!
//! [`VoiceConverter`] brings decoded buffers to the device layout and rate
//! on the scheduling thread. [`VoiceRenderer`] owns the output clock and
//! mixes prepared voices; a device callback calls [`VoiceRenderer::render`]
//! for every buffer it has to fill.

use crate::audio::backend::VoiceId;
use crate::audio::buffer::PcmBuffer;
use crate::codec::resampler::StreamResampler;
use crate::error::CodecError;

/// Starts this close to the end of the previous voice are joined onto it
const SNAP_FRAMES: u64 = 1;

/// A voice converted to the device layout, ready to mix
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedVoice {
    start_frame: u64,
    /// Interleaved samples at the device rate and layout
    samples: Vec<f32>,
    /// Frames skipped from the front
    skip: usize,
}

impl PreparedVoice {
    pub fn start_frame(&self) -> u64 {
        self.start_frame
    }

    /// Frames this voice will play
    pub fn frames(&self, channels: u16) -> usize {
        (self.samples.len() / channels.max(1) as usize).saturating_sub(self.skip)
    }
}

struct ConverterStream {
    resampler: StreamResampler,
    /// Device frame where the last voice of this stream ends
    end_frame: u64,
}

/// Converts buffers for one output device.
///
/// Buffers at a foreign rate go through a [`StreamResampler`]. A buffer that
/// starts where the previous one of the same rate ended continues that
/// resampler, so back-to-back chunks form one seamless stream and exactly
/// tile the device clock.
pub struct VoiceConverter {
    sample_rate: u32,
    channels: u16,
    stream: Option<ConverterStream>,
}

impl VoiceConverter {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            stream: None,
        }
    }

    /// Convert `buffer` for a voice starting at `start_at` clock seconds,
    /// skipping its first `offset` seconds
    pub fn prepare(
        &mut self,
        buffer: &PcmBuffer,
        start_at: f64,
        offset: f64,
    ) -> Result<PreparedVoice, CodecError> {
        if buffer.sample_rate == 0 {
            return Err(CodecError::InvalidSampleRate(0));
        }
        let requested = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        let remixed = buffer.remix(self.channels);

        let (start_frame, samples) = if buffer.sample_rate == self.sample_rate {
            self.stream = None;
            (requested, remixed.samples)
        } else {
            let continues = offset <= 0.0
                && self.stream.as_ref().is_some_and(|s| {
                    s.resampler.source_rate() == buffer.sample_rate
                        && s.end_frame.abs_diff(requested) <= SNAP_FRAMES + 1
                });
            let mut stream = match self.stream.take() {
                Some(stream) if continues => stream,
                _ => ConverterStream {
                    resampler: StreamResampler::new(
                        buffer.sample_rate,
                        self.sample_rate,
                        self.channels,
                    )?,
                    end_frame: requested,
                },
            };
            let start_frame = stream.end_frame;
            let samples = stream.resampler.process(&remixed.samples)?;
            stream.end_frame = start_frame + (samples.len() / self.channels as usize) as u64;
            self.stream = Some(stream);
            (start_frame, samples)
        };

        let frames = samples.len() / self.channels as usize;
        let skip = ((offset.max(0.0) * self.sample_rate as f64).round() as usize).min(frames);
        Ok(PreparedVoice {
            start_frame,
            samples,
            skip,
        })
    }

    /// Drop resampler state; the next buffer starts a new stream
    pub fn reset(&mut self) {
        self.stream = None;
    }
}

struct Voice {
    id: VoiceId,
    start_frame: u64,
    samples: Vec<f32>,
    cursor: usize,
}

impl Voice {
    fn end_frame(&self, channels: usize) -> u64 {
        self.start_frame + ((self.samples.len() - self.cursor) / channels) as u64
    }
}

/// Renders scheduled voices onto an interleaved output stream
pub struct VoiceRenderer {
    sample_rate: u32,
    channels: u16,
    clock_frames: u64,
    voices: Vec<Voice>,
}

impl VoiceRenderer {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            channels: channels.max(1),
            clock_frames: 0,
            voices: Vec::with_capacity(16),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Output clock in seconds
    pub fn current_time(&self) -> f64 {
        self.clock_frames as f64 / self.sample_rate as f64
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Schedule a prepared voice. A start in the past starts now; a start
    /// within one frame of an existing voice's end is snapped onto it.
    pub fn add(&mut self, id: VoiceId, voice: PreparedVoice) {
        let channels = self.channels as usize;
        let mut start_frame = voice.start_frame.max(self.clock_frames);
        if let Some(end) = self
            .voices
            .iter()
            .map(|v| v.end_frame(channels))
            .filter(|end| end.abs_diff(start_frame) <= SNAP_FRAMES)
            .max()
        {
            start_frame = end.max(self.clock_frames);
        }

        self.voices.push(Voice {
            id,
            start_frame,
            samples: voice.samples,
            cursor: voice.skip * channels,
        });
    }

    /// Remove a voice without reporting it as finished
    pub fn remove(&mut self, id: VoiceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    /// Fill `out` (interleaved, device layout) and advance the clock.
    /// `finished` is cleared and receives the voices that played their last
    /// sample in this buffer.
    pub fn render(&mut self, out: &mut [f32], finished: &mut Vec<VoiceId>) {
        out.fill(0.0);
        finished.clear();
        let channels = self.channels as usize;
        let frames = out.len() / channels;
        let buffer_start = self.clock_frames;

        for voice in &mut self.voices {
            let first = voice.start_frame.saturating_sub(buffer_start) as usize;
            if first >= frames {
                continue;
            }
            for frame in first..frames {
                if voice.cursor >= voice.samples.len() {
                    break;
                }
                let dst = frame * channels;
                out[dst..dst + channels]
                    .iter_mut()
                    .zip(&voice.samples[voice.cursor..voice.cursor + channels])
                    .for_each(|(o, s)| *o += *s);
                voice.cursor += channels;
            }
            // Keep the start frame tracking the playhead so end_frame stays exact
            voice.start_frame = voice.start_frame.max(buffer_start + frames as u64);
        }

        self.clock_frames += frames as u64;

        self.voices.retain(|v| {
            let done = v.cursor >= v.samples.len();
            if done {
                finished.push(v.id);
            }
            !done
        });
    }
}
