//! Capture and encode pipeline
//!
//! Drains the capture ring, encodes each block and hands the result straight
//! to the transport callback. Only resampler filter state carries over
//! between blocks; a block that cannot be encoded is dropped.

use bytes::Bytes;

use crate::audio::backend::AudioInput;
use crate::audio::buffer::SharedRingBuffer;
use crate::codec::FrameEncoder;
use crate::error::CodecError;

/// Transport callback receiving each encoded frame
pub type FrameSink = Box<dyn FnMut(Bytes) + Send>;

pub struct CapturePipeline {
    encoder: FrameEncoder,
    ring: SharedRingBuffer,
    frames_sent: u64,
    blocks_dropped: u64,
}

impl CapturePipeline {
    /// Attach to an open input, encoding to `target_rate`
    pub fn new(input: &dyn AudioInput, target_rate: u32) -> Result<Self, CodecError> {
        let encoder = FrameEncoder::new(input.sample_rate(), input.channels(), target_rate)?;
        Ok(Self {
            encoder,
            ring: input.frames(),
            frames_sent: 0,
            blocks_dropped: 0,
        })
    }

    /// Encode and send every queued block. Returns the frames sent.
    pub fn pump(&mut self, sink: &mut dyn FnMut(Bytes)) -> usize {
        let mut sent = 0;
        while let Some(block) = self.ring.pop() {
            match self.encoder.encode(&block.samples) {
                Ok(frame) if frame.is_empty() => {}
                Ok(frame) => {
                    tracing::trace!("Frame {} ({} bytes)", block.sequence, frame.len());
                    sink(frame);
                    sent += 1;
                }
                Err(e) => {
                    self.blocks_dropped += 1;
                    tracing::warn!("Dropping capture block {}: {}", block.sequence, e);
                }
            }
        }
        self.frames_sent += sent as u64;
        sent
    }

    /// Throw away queued blocks so they are never sent late
    pub fn discard(&self) -> usize {
        self.ring.clear()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Blocks lost to ring overflow or encode failures
    pub fn blocks_dropped(&self) -> u64 {
        self.blocks_dropped + self.ring.overflow_count() as u64
    }
}
