//! cpal device backend
//!
//! Devices are looked up by name (`None` means the host default). The
//! output stream runs a [`VoiceRenderer`] inside the cpal callback on a
//! dedicated thread. Buffers are converted by a [`VoiceConverter`] before
//! the renderer mutex is taken, so the callback never waits on a resample.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample, StreamConfig};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::backend::{
    AudioBackend, AudioInput, AudioOutput, DeviceEvent, DeviceEventSender, VoiceId,
};
use crate::audio::buffer::PcmBuffer;
use crate::audio::capture::CpalInput;
use crate::audio::output::{VoiceConverter, VoiceRenderer};
use crate::error::AudioError;

/// Backend for the platform's default audio host
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    /// Input device name, default device when `None`
    pub input_device: Option<String>,
    /// Output device name, default device when `None`
    pub output_device: Option<String>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBackend for CpalBackend {
    fn open_output(&self, events: DeviceEventSender) -> Result<Box<dyn AudioOutput>, AudioError> {
        let device = match &self.output_device {
            Some(name) => find_device(name, false)?,
            None => get_default_output_device()?,
        };
        Ok(Box::new(CpalOutput::open(device, events)?))
    }

    fn open_input(
        &self,
        frame_size: usize,
        ring_capacity: usize,
        events: DeviceEventSender,
    ) -> Result<Box<dyn AudioInput>, AudioError> {
        let device = match &self.input_device {
            Some(name) => find_device(name, true)?,
            None => get_default_input_device()?,
        };
        Ok(Box::new(CpalInput::open(device, frame_size, ring_capacity, events)?))
    }
}

/// Find a device by its name
pub fn find_device(name: &str, is_input: bool) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let devices = if is_input {
        host.input_devices()
    } else {
        host.output_devices()
    };
    let devices = devices.map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name == name {
                return Ok(device);
            }
        }
    }

    Err(AudioError::DeviceNotFound(name.to_string()))
}

/// Get default input device
pub fn get_default_input_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

/// Get default output device
pub fn get_default_output_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

/// Running output stream
pub struct CpalOutput {
    renderer: Arc<Mutex<VoiceRenderer>>,
    converter: VoiceConverter,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl CpalOutput {
    pub fn open(device: cpal::Device, events: DeviceEventSender) -> Result<Self, AudioError> {
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.config();
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;

        let renderer = Arc::new(Mutex::new(VoiceRenderer::new(sample_rate, channels)));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let thread_renderer = renderer.clone();
        let thread_running = running.clone();
        let handle = thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let stream = match sample_format {
                    cpal::SampleFormat::F32 => {
                        build_stream::<f32>(&device, &config, thread_renderer, events)
                    }
                    cpal::SampleFormat::I16 => {
                        build_stream::<i16>(&device, &config, thread_renderer, events)
                    }
                    cpal::SampleFormat::U16 => {
                        build_stream::<u16>(&device, &config, thread_renderer, events)
                    }
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
                        tracing::error!("Failed to start output stream: {}", e);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while thread_running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
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
                return Err(AudioError::StreamError("output stream did not start".into()));
            }
        }

        tracing::info!("Output started: {}Hz", sample_rate);

        Ok(Self {
            renderer,
            converter: VoiceConverter::new(sample_rate, channels),
            running,
            thread_handle: Some(handle),
            sample_rate,
        })
    }
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.renderer.lock().current_time()
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
        if !self.running.load(Ordering::SeqCst) {
            return Err(AudioError::OutputClosed);
        }
        let voice = self
            .converter
            .prepare(&buffer, start_at, offset)
            .map_err(|e| AudioError::UnsupportedFormat(e.to_string()))?;
        let id = VoiceId::next();
        self.renderer.lock().add(id, voice);
        Ok(id)
    }

    fn stop_voice(&mut self, voice: VoiceId) {
        self.renderer.lock().remove(voice);
    }

    fn close(&mut self) {
        self.renderer.lock().clear();
        self.converter.reset();
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    renderer: Arc<Mutex<VoiceRenderer>>,
    events: DeviceEventSender,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32>,
{
    let error_events = events.clone();
    let mut scratch: Vec<f32> = Vec::new();
    let mut finished = Vec::with_capacity(16);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                renderer.lock().render(&mut scratch, &mut finished);
                for (out, sample) in data.iter_mut().zip(&scratch) {
                    *out = T::from_sample(*sample);
                }
                for voice in finished.drain(..) {
                    let _ = events.send(DeviceEvent::VoiceEnded(voice));
                }
            },
            move |err| {
                let _ = error_events.send(DeviceEvent::OutputFailed(err.to_string()));
            },
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}
