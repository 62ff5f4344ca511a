//! Sample containers
//!
//! [`RingBuffer`] is a lock-free single-producer single-consumer queue of
//! captured blocks; the device thread pushes and the capture pipeline pops.
//! [`PcmBuffer`] is a fully decoded, playable buffer.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Captured block containing interleaved samples
#[derive(Clone, Debug)]
pub struct AudioFrame {
    /// Interleaved audio samples (f32)
    pub samples: Vec<f32>,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in microseconds since capture start
    pub timestamp: u64,
    /// Block sequence number
    pub sequence: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, channels: u16, timestamp: u64, sequence: u32) -> Self {
        Self {
            samples,
            channels,
            timestamp,
            sequence,
        }
    }

    /// Get number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Get block duration in microseconds
    pub fn duration_us(&self, sample_rate: u32) -> u64 {
        (self.samples_per_channel() as u64 * 1_000_000) / sample_rate.max(1) as u64
    }
}

/// Lock-free ring buffer for captured blocks
pub struct RingBuffer {
    queue: ArrayQueue<AudioFrame>,
    overflow_count: AtomicUsize,
}

impl RingBuffer {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Push a block into the buffer.
    /// Returns false if the buffer is full; the block is dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        match self.queue.push(frame) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<AudioFrame> {
        self.queue.pop()
    }

    /// Drop everything currently queued, returning how many blocks went
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Get overflow count
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer
pub fn create_shared_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}

/// Decoded interleaved audio ready to be scheduled on an output
#[derive(Clone, Debug, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    /// Silent buffer of the given length, mostly useful for tests
    pub fn silence(seconds: f64, sample_rate: u32, channels: u16) -> Self {
        let frames = (seconds * sample_rate as f64).round() as usize;
        Self::new(vec![0.0; frames * channels.max(1) as usize], sample_rate, channels)
    }

    /// Frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Change the channel layout. Down-mixing to mono averages, any other
    /// layout change maps output channel `c` to input channel `c % channels`.
    pub fn remix(&self, channels: u16) -> PcmBuffer {
        let channels = channels.max(1);
        if channels == self.channels {
            return self.clone();
        }
        let src = self.channels as usize;
        let dst = channels as usize;
        let mut samples = Vec::with_capacity(self.frames() * dst);
        for frame in self.samples.chunks_exact(src) {
            if dst == 1 {
                samples.push(frame.iter().sum::<f32>() / src as f32);
            } else {
                samples.extend((0..dst).map(|c| frame[c % src]));
            }
        }
        PcmBuffer::new(samples, self.sample_rate, channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_basic() {
        let buffer = RingBuffer::new(4);

        let frame1 = AudioFrame::new(vec![0.0; 480], 2, 0, 0);
        let frame2 = AudioFrame::new(vec![1.0; 480], 2, 10000, 1);

        assert!(buffer.push(frame1));
        assert!(buffer.push(frame2));
        assert_eq!(buffer.len(), 2);

        let popped = buffer.pop().unwrap();
        assert_eq!(popped.sequence, 0);

        let popped = buffer.pop().unwrap();
        assert_eq!(popped.sequence, 1);

        assert!(buffer.is_empty());
    }

    #[test]
    fn test_ring_buffer_drops_on_overflow() {
        let buffer = RingBuffer::new(2);
        for seq in 0..5 {
            buffer.push(AudioFrame::new(vec![0.0; 8], 1, 0, seq));
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.overflow_count(), 3);
        // Oldest blocks survive, newest are the ones dropped
        assert_eq!(buffer.pop().unwrap().sequence, 0);
        assert_eq!(buffer.clear(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 960], 2, 0, 0);
        assert_eq!(frame.samples_per_channel(), 480);
        assert_eq!(frame.duration_us(48000), 10_000);
    }

    #[test]
    fn test_pcm_duration() {
        let pcm = PcmBuffer::silence(1.5, 24000, 1);
        assert_eq!(pcm.frames(), 36000);
        assert!((pcm.duration() - 1.5).abs() < 1e-9);
        assert!(PcmBuffer::new(vec![], 24000, 1).is_empty());
    }

    #[test]
    fn test_remix() {
        let stereo = PcmBuffer::new(vec![1.0, 0.0, 0.5, 0.5], 48000, 2);
        let mono = stereo.remix(1);
        assert_eq!(mono.samples, vec![0.5, 0.5]);

        let back = mono.remix(2);
        assert_eq!(back.samples, vec![0.5, 0.5, 0.5, 0.5]);
    }
}
