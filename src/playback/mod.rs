//! Track playback: the controller owning [`PlaybackState`], the autoplay
//! queue driving it, and the loaders feeding it.
//!
//! [`PlaybackState`]: crate::protocol::PlaybackState

pub mod controller;
pub mod loader;
pub mod queue;

pub use controller::{LoadRequest, PlaybackController, TrackEnded};
pub use loader::{load_track, FileLoader, MemoryLoader, TrackLoader};
pub use queue::{QueueOrchestrator, QueueTransition, SingleFlight};
