//! Live voice sessions
//!
//! Microphone capture going out, synthesized audio coming back, and the
//! state machine tying both to the remote endpoint's lifecycle.

pub mod capture;
pub mod machine;
pub mod scheduler;

pub use capture::{CapturePipeline, FrameSink};
pub use machine::{StreamingSession, TurnSink};
pub use scheduler::{next_start, GaplessScheduler, ScheduledChunk, VoiceOutcome};
