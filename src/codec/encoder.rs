//! Capture frame encoder
//!
//! Turns raw capture blocks into transmission-ready frames: mono, resampled
//! to the remote endpoint's rate, little-endian PCM16. The resampler runs as
//! one stream across blocks, so frame boundaries carry no seam.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::resampler::StreamResampler;
use crate::error::CodecError;

/// Stateful per-stream PCM16 encoder
pub struct FrameEncoder {
    input_channels: u16,
    output_rate: u32,
    /// `None` when the capture rate already matches
    resampler: Option<StreamResampler>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl FrameEncoder {
    pub fn new(input_rate: u32, input_channels: u16, output_rate: u32) -> Result<Self, CodecError> {
        if input_rate == 0 {
            return Err(CodecError::InvalidSampleRate(input_rate));
        }
        if output_rate == 0 {
            return Err(CodecError::InvalidSampleRate(output_rate));
        }
        let resampler = if input_rate == output_rate {
            None
        } else {
            Some(StreamResampler::new(input_rate, output_rate, 1)?)
        };
        Ok(Self {
            input_channels: input_channels.max(1),
            output_rate,
            resampler,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Encode one interleaved block. A block too short to yield a single
    /// output sample encodes to an empty frame; its audio is carried into
    /// the next one.
    pub fn encode(&mut self, samples: &[f32]) -> Result<Bytes, CodecError> {
        let channels = self.input_channels as usize;
        if samples.is_empty() || samples.len() % channels != 0 {
            return Err(CodecError::InvalidFrameSize(samples.len()));
        }

        let mono = downmix(samples, channels);
        let resampled = match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&mono)?,
            None => mono,
        };

        let mut out = BytesMut::with_capacity(resampled.len() * 2);
        for sample in resampled {
            out.put_i16_le(quantize(sample));
        }
        if out.is_empty() {
            return Ok(out.freeze());
        }

        self.frames_encoded += 1;
        self.bytes_produced += out.len() as u64;
        Ok(out.freeze())
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}

fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Full-scale float to PCM16: negative values use the 32768 range,
/// positive values 32767.
pub fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0).round() as i16
    } else {
        (s * 32767.0).round() as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(frame: &[u8]) -> Vec<i16> {
        frame
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect()
    }

    #[test]
    fn test_block_is_downsampled() {
        let mut encoder = FrameEncoder::new(48000, 1, 16000).unwrap();
        let frame = encoder.encode(&vec![0.25; 4096]).unwrap();
        // 4096 samples at 48kHz -> 1365 samples at 16kHz, 2 bytes each
        assert_eq!(frame.len(), 1365 * 2);

        // Past the filter start-up the level is preserved
        let level = samples(&frame)[1000];
        assert!((level - quantize(0.25)).abs() < 1000, "level {level}");
    }

    #[test]
    fn test_frame_sizes_do_not_drift() {
        let mut encoder = FrameEncoder::new(44100, 1, 16000).unwrap();
        let total: usize = (0..10)
            .map(|_| encoder.encode(&[0.1; 441]).unwrap().len() / 2)
            .sum();
        // 4410 samples at 44.1kHz are exactly 1600 at 16kHz
        assert_eq!(total, 1600);
    }

    #[test]
    fn test_stereo_is_downmixed() {
        let mut encoder = FrameEncoder::new(16000, 2, 16000).unwrap();
        let frame = encoder.encode(&[1.0, 0.0, -1.0, 0.0]).unwrap();
        assert_eq!(frame.len(), 4);
        assert_eq!(samples(&frame), vec![quantize(0.5), quantize(-0.5)]);
    }

    #[test]
    fn test_quantize_limits() {
        assert_eq!(quantize(1.0), i16::MAX);
        assert_eq!(quantize(-1.0), i16::MIN);
        assert_eq!(quantize(3.0), i16::MAX);
        assert_eq!(quantize(-7.5), i16::MIN);
        assert_eq!(quantize(0.0), 0);
    }

    #[test]
    fn test_invalid_blocks() {
        let mut encoder = FrameEncoder::new(48000, 2, 16000).unwrap();
        assert_eq!(encoder.encode(&[]), Err(CodecError::InvalidFrameSize(0)));
        assert_eq!(encoder.encode(&[0.0; 3]), Err(CodecError::InvalidFrameSize(3)));
        assert!(FrameEncoder::new(0, 1, 16000).is_err());
    }

    #[test]
    fn test_short_block_carries_over() {
        let mut encoder = FrameEncoder::new(48000, 2, 16000).unwrap();
        // One stereo frame is a third of an output sample
        assert!(encoder.encode(&[0.0; 2]).unwrap().is_empty());
        assert_eq!(encoder.encode(&[0.0; 4]).unwrap().len(), 2);
        assert_eq!(encoder.stats().frames_encoded, 1);
    }

    #[test]
    fn test_stats() {
        let mut encoder = FrameEncoder::new(16000, 1, 16000).unwrap();
        encoder.encode(&[0.0; 100]).unwrap();
        encoder.encode(&[0.0; 50]).unwrap();
        let stats = encoder.stats();
        assert_eq!(stats.frames_encoded, 2);
        assert_eq!(stats.bytes_produced, 300);
        assert!((stats.average_frame_size - 150.0).abs() < f32::EPSILON);
    }
}
