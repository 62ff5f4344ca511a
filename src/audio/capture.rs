//! Microphone capture through cpal
//!
//! The cpal stream is not `Send`, so it lives on a dedicated thread for as
//! long as the capture is running. The data callback assembles fixed-size
//! blocks and pushes them into the shared ring; when the ring is full the
//! block is dropped.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamConfig};
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::backend::{AudioInput, DeviceEvent, DeviceEventSender};
use crate::audio::buffer::{create_shared_buffer, AudioFrame, SharedRingBuffer};
use crate::error::AudioError;

/// Running capture on one input device
pub struct CpalInput {
    running: Arc<AtomicBool>,
    ring: SharedRingBuffer,
    thread_handle: Option<JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl CpalInput {
    /// Open `device` and start capturing blocks of `frame_size` frames
    pub fn open(
        device: cpal::Device,
        frame_size: usize,
        ring_capacity: usize,
        events: DeviceEventSender,
    ) -> Result<Self, AudioError> {
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.config();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        let ring = create_shared_buffer(ring_capacity);
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let thread_running = running.clone();
        let thread_ring = ring.clone();
        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let block = BlockAssembler::new(frame_size, channels, thread_ring);
                let stream = match sample_format {
                    cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, block, events),
                    cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, block, events),
                    cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, block, events),
                    other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
                };

                let stream = match stream.and_then(|s| {
                    s.play().map_err(|e| AudioError::StreamError(e.to_string()))?;
                    Ok(s)
                }) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        tracing::error!("Failed to start capture stream: {}", e);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Keep thread alive while running
                while thread_running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Stream is dropped here, stopping capture
                drop(stream);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                return Err(AudioError::StreamError("capture stream did not start".into()));
            }
        }

        tracing::info!(
            "Capture started: {}Hz, {} channels, {} frames/block",
            sample_rate,
            channels,
            frame_size
        );

        Ok(Self {
            running,
            ring,
            thread_handle: Some(handle),
            sample_rate,
            channels,
        })
    }
}

impl AudioInput for CpalInput {
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
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cuts the callback's arbitrary-sized slices into fixed blocks
struct BlockAssembler {
    block_len: usize,
    channels: u16,
    pending: Vec<f32>,
    ring: SharedRingBuffer,
    sequence: u32,
    start_time: Instant,
}

impl BlockAssembler {
    fn new(frame_size: usize, channels: u16, ring: SharedRingBuffer) -> Self {
        let block_len = frame_size.max(1) * channels.max(1) as usize;
        Self {
            block_len,
            channels,
            pending: Vec::with_capacity(block_len),
            ring,
            sequence: 0,
            start_time: Instant::now(),
        }
    }

    fn push(&mut self, data: impl Iterator<Item = f32>) {
        for sample in data {
            self.pending.push(sample);
            if self.pending.len() == self.block_len {
                let samples =
                    std::mem::replace(&mut self.pending, Vec::with_capacity(self.block_len));
                let timestamp = self.start_time.elapsed().as_micros() as u64;
                let seq = self.sequence;
                self.sequence = self.sequence.wrapping_add(1);
                // Push to ring buffer (dropped on overflow)
                let _ = self.ring.push(AudioFrame::new(samples, self.channels, timestamp, seq));
            }
        }
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut block: BlockAssembler,
    events: DeviceEventSender,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                block.push(data.iter().map(|s| s.to_sample::<f32>()));
            },
            move |err| {
                let _ = events.send(DeviceEvent::CaptureFailed(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}
