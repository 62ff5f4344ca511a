//! Chunk and track decoding
//!
//! Streamed chunks arrive as base64 PCM16; full tracks are container files
//! detected and decoded with Symphonia. Either way the result is a
//! [`PcmBuffer`] ready to be scheduled.

use base64::Engine as _;
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::audio::buffer::PcmBuffer;
use crate::config::StreamConfig;
use crate::error::CodecError;
use crate::protocol::{InlineAudio, Track, TrackEncoding};

/// Decoder for the remote endpoint's audio chunks
pub struct ChunkDecoder {
    sample_rate: u32,
    channels: u16,
    /// Chunks decoded
    chunks_decoded: u64,
    /// Chunks rejected as malformed
    chunks_dropped: u64,
}

impl ChunkDecoder {
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels.max(1),
            chunks_decoded: 0,
            chunks_dropped: 0,
        }
    }

    /// Decode a base64 PCM16 chunk at the configured stream rate
    pub fn decode_base64(&mut self, data: &str) -> Result<PcmBuffer, CodecError> {
        let result = decode_base64_pcm(data, self.sample_rate, self.channels);
        self.count(result)
    }

    /// Decode an inline blob, taking the rate from its mime type
    pub fn decode_inline(&mut self, blob: &InlineAudio) -> Result<PcmBuffer, CodecError> {
        let result = if blob.is_pcm() {
            decode_base64_pcm(&blob.data, blob.sample_rate(), self.channels)
        } else {
            Err(CodecError::DecodeFailed(format!(
                "unsupported mime type {}",
                blob.mime_type
            )))
        };
        self.count(result)
    }

    fn count(&mut self, result: Result<PcmBuffer, CodecError>) -> Result<PcmBuffer, CodecError> {
        match &result {
            Ok(_) => self.chunks_decoded += 1,
            Err(_) => self.chunks_dropped += 1,
        }
        result
    }

    pub fn chunks_decoded(&self) -> u64 {
        self.chunks_decoded
    }

    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped
    }
}

/// Base64 text to PCM16 little-endian samples
pub fn decode_base64_pcm(
    data: &str,
    sample_rate: u32,
    channels: u16,
) -> Result<PcmBuffer, CodecError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| CodecError::DecodeFailed(format!("invalid base64: {}", e)))?;
    decode_pcm16(&bytes, sample_rate, channels)
}

/// Raw PCM16 little-endian bytes to a buffer
pub fn decode_pcm16(
    bytes: &[u8],
    sample_rate: u32,
    channels: u16,
) -> Result<PcmBuffer, CodecError> {
    if sample_rate == 0 {
        return Err(CodecError::InvalidSampleRate(sample_rate));
    }
    let channels = channels.max(1);
    let frame_bytes = 2 * channels as usize;
    if bytes.is_empty() {
        return Err(CodecError::DecodeFailed("empty chunk".into()));
    }
    if bytes.len() % frame_bytes != 0 {
        return Err(CodecError::DecodeFailed(format!(
            "{} bytes is not a whole number of {}-channel PCM16 frames",
            bytes.len(),
            channels
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect();
    Ok(PcmBuffer::new(samples, sample_rate, channels))
}

/// Detect the format of a container file held in memory and fully decode it
pub fn decode_container(bytes: Vec<u8>, extension: Option<&str>) -> Result<PcmBuffer, CodecError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let detected = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| CodecError::DecodeFailed(format!("failed to detect format: {}", e)))?;
    let mut format = detected.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| CodecError::DecodeFailed("no audio track found".into()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track.codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| CodecError::DecodeFailed(format!("failed to create decoder: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(CodecError::DecodeFailed(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("Skipping corrupt packet: {}", e);
            }
            Err(e) => return Err(CodecError::DecodeFailed(e.to_string())),
        }
    }

    if samples.is_empty() || sample_rate == 0 || channels == 0 {
        return Err(CodecError::DecodeFailed("no audio decoded".into()));
    }
    Ok(PcmBuffer::new(samples, sample_rate, channels))
}

/// Decode the bytes behind a track according to its encoding
pub fn decode_track(
    track: &Track,
    bytes: Vec<u8>,
    stream: &StreamConfig,
) -> Result<PcmBuffer, CodecError> {
    match track.encoding {
        TrackEncoding::ContainerFile => decode_container(bytes, track.extension()),
        TrackEncoding::RawPcmBase64 => {
            let text = std::str::from_utf8(&bytes).map_err(|e| {
                CodecError::DecodeFailed(format!("base64 payload is not text: {}", e))
            })?;
            decode_base64_pcm(text, stream.sample_rate, stream.channels)
        }
    }
}
