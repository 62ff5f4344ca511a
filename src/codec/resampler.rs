//! Sample rate conversion
//!
//! [`StreamResampler`] wraps a band-limited rubato resampler and keeps its
//! filter state between calls, so consecutive blocks of one stream join
//! without a seam. The number of frames handed out is pinned to the running
//! total `round(frames_in * to / from)`: per-block counts never drift, no
//! matter how the block sizes fall. While the filter is still filling, the
//! shortfall is padded by holding the last frame; produced audio is never
//! dropped, it only trails by the filter latency.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::collections::VecDeque;

use crate::error::CodecError;

/// Largest block handed to rubato in one call
const CHUNK_FRAMES: usize = 1024;
const SINC_LEN: usize = 128;

/// Stateful interleaved resampler for one continuous stream
pub struct StreamResampler {
    inner: SincFixedIn<f32>,
    from: u32,
    to: u32,
    channels: usize,
    /// Planar input scratch, reused across calls
    planar: Vec<Vec<f32>>,
    /// Interleaved output produced by rubato but not yet handed out
    pending: VecDeque<f32>,
    /// Last frame handed out, repeated when rubato runs short
    last: Vec<f32>,
    frames_in: u64,
    frames_out: u64,
}

impl StreamResampler {
    pub fn new(from: u32, to: u32, channels: u16) -> Result<Self, CodecError> {
        if from == 0 {
            return Err(CodecError::InvalidSampleRate(from));
        }
        if to == 0 {
            return Err(CodecError::InvalidSampleRate(to));
        }
        let channels = channels.max(1) as usize;
        let params = SincInterpolationParameters {
            sinc_len: SINC_LEN,
            f_cutoff: 0.94,
            oversampling_factor: 128,
            interpolation: SincInterpolationType::Linear,
            window: WindowFunction::Blackman,
        };
        let inner = SincFixedIn::<f32>::new(
            to as f64 / from as f64,
            1.1,
            params,
            CHUNK_FRAMES,
            channels,
        )
        .map_err(|e| CodecError::EncodingFailed(format!("failed to create resampler: {e}")))?;

        Ok(Self {
            inner,
            from,
            to,
            channels,
            planar: vec![Vec::with_capacity(CHUNK_FRAMES); channels],
            pending: VecDeque::new(),
            last: vec![0.0; channels],
            frames_in: 0,
            frames_out: 0,
        })
    }

    pub fn source_rate(&self) -> u32 {
        self.from
    }

    pub fn target_rate(&self) -> u32 {
        self.to
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    /// Total input frames consumed since creation or the last reset
    pub fn frames_in(&self) -> u64 {
        self.frames_in
    }

    /// Total output frames handed out since creation or the last reset
    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    /// Output frames the next `frames` input frames will yield
    pub fn output_frames_for(&self, frames: usize) -> usize {
        (self.total_for(self.frames_in + frames as u64) - self.frames_out) as usize
    }

    fn total_for(&self, frames_in: u64) -> u64 {
        (frames_in * self.to as u64 + self.from as u64 / 2) / self.from as u64
    }

    /// Convert one interleaved block, continuing from the previous one
    pub fn process(&mut self, interleaved: &[f32]) -> Result<Vec<f32>, CodecError> {
        let channels = self.channels;
        if interleaved.len() % channels != 0 {
            return Err(CodecError::InvalidFrameSize(interleaved.len()));
        }
        let frames = interleaved.len() / channels;
        let target = self.output_frames_for(frames);

        for block in interleaved.chunks(CHUNK_FRAMES * channels) {
            self.feed(block)?;
        }

        let available = (self.pending.len() / channels).min(target);
        let mut out = Vec::with_capacity(target * channels);
        out.extend(self.pending.drain(..available * channels));
        if let Some(tail) = out.rchunks_exact(channels).next() {
            self.last.copy_from_slice(tail);
        }
        for _ in available..target {
            out.extend_from_slice(&self.last);
        }

        self.frames_in += frames as u64;
        self.frames_out += target as u64;
        Ok(out)
    }

    fn feed(&mut self, block: &[f32]) -> Result<(), CodecError> {
        let channels = self.channels;
        let frames = block.len() / channels;
        if frames == 0 {
            return Ok(());
        }
        self.inner.set_chunk_size(frames).map_err(resample_error)?;
        for (c, lane) in self.planar.iter_mut().enumerate() {
            lane.clear();
            lane.extend(block.iter().skip(c).step_by(channels));
        }
        let planar = self.inner.process(&self.planar, None).map_err(resample_error)?;
        let produced = planar.first().map_or(0, Vec::len);
        for i in 0..produced {
            self.pending.extend(planar.iter().map(|lane| lane[i]));
        }
        Ok(())
    }

    /// Forget all stream state; the next block starts a new stream
    pub fn reset(&mut self) {
        self.inner.reset();
        self.pending.clear();
        self.last.fill(0.0);
        self.frames_in = 0;
        self.frames_out = 0;
    }
}

fn resample_error(err: rubato::ResampleError) -> CodecError {
    CodecError::EncodingFailed(format!("resample error: {err}"))
}
