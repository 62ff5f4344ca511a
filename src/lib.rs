//! # Live Audio Core
//!
//! Audio engine for an interactive content application: single-track
//! playback, self-advancing autoplay queues and bidirectional real-time
//! voice sessions.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                       EngineHandle / SessionHandle                        │
//! │        play · pause · seek · queue · start_session · server_audio         │
//! └──────────────────────────────────┬───────────────────────────────────────┘
//!                                    │ commands (mpsc)
//!                                    ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                        AudioEngine actor (engine)                         │
//! │                                                                          │
//! │  ┌─────────────────┐   ┌────────────────────┐   ┌──────────────────────┐ │
//! │  │ QueueOrchestr.  │──▶│ PlaybackController │   │  StreamingSession    │ │
//! │  │ (single-flight) │   │ (PlaybackState)    │   │  (state machine)     │ │
//! │  └─────────────────┘   └─────────┬──────────┘   │  ┌────────────────┐  │ │
//! │                                  │              │  │CapturePipeline │──┼─┼─▶ on_frame
//! │                                  │              │  ├────────────────┤  │ │
//! │                                  │              │  │GaplessScheduler│◀─┼─┼── chunks
//! │                                  │              │  └───────┬────────┘  │ │
//! │                                  ▼              └──────────┼───────────┘ │
//! │                     ┌───────────────────────────────────────▼─────────┐  │
//! │                     │        ResourceGuard → ResourceBundle           │  │
//! │                     └───────────────────────┬─────────────────────────┘  │
//! └─────────────────────────────────────────────┼────────────────────────────┘
//!                                               ▼
//!              AudioBackend: VirtualBackend | CpalBackend (feature "device")
//!                                               │
//!                                   DeviceEvent (voice ended, failures)
//!                                               └──────▶ back to the actor
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod playback;
pub mod protocol;
pub mod session;

pub use engine::{AudioEngine, EngineHandle, SessionHandle};
pub use error::{Error, ErrorKind, Result};
pub use protocol::{
    PlaybackState, QueueSnapshot, SessionSnapshot, SessionState, Track, TrackEncoding,
};

/// Application-wide constants
pub mod constants {
    /// Samples per captured block handed to the encoder
    pub const DEFAULT_CAPTURE_FRAME_SIZE: usize = 4096;

    /// Rate of the PCM16 frames sent to the remote endpoint
    pub const DEFAULT_CAPTURE_SAMPLE_RATE: u32 = 16_000;

    /// Rate of synthesized chunks coming back from the remote endpoint
    pub const DEFAULT_STREAM_SAMPLE_RATE: u32 = 24_000;

    /// Channel count of synthesized chunks
    pub const DEFAULT_STREAM_CHANNELS: u16 = 1;

    /// Position update cadence while a track is playing
    pub const DEFAULT_POSITION_INTERVAL_MS: u64 = 250;

    /// How often captured blocks are drained and transmitted
    pub const DEFAULT_CAPTURE_POLL_MS: u64 = 20;

    /// Capture ring capacity (in blocks)
    pub const CAPTURE_RING_CAPACITY: usize = 8;

    /// Output rate of the virtual backend
    pub const VIRTUAL_OUTPUT_SAMPLE_RATE: u32 = 48_000;
}
