//! Codecs
//!
//! Outbound capture blocks are encoded to PCM16 frames; inbound chunks and
//! tracks are decoded to playable buffers. Rate conversion in both
//! directions goes through [`StreamResampler`].

pub mod decoder;
pub mod encoder;
pub mod resampler;

pub use decoder::{decode_container, decode_track, ChunkDecoder};
pub use encoder::FrameEncoder;
pub use resampler::StreamResampler;
