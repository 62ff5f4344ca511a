//! Audio subsystem module

pub mod backend;
pub mod buffer;
pub mod guard;
pub mod output;
pub mod virtual_device;

#[cfg(feature = "device")]
pub mod capture;
#[cfg(feature = "device")]
pub mod device;

pub use backend::{AudioBackend, AudioInput, AudioOutput, DeviceEvent, DeviceEventSender, VoiceId};
pub use buffer::{AudioFrame, PcmBuffer, RingBuffer, SharedRingBuffer};
pub use guard::{ResourceBundle, ResourceGuard, ResourceRequest};
pub use output::{PreparedVoice, VoiceConverter, VoiceRenderer};
pub use virtual_device::VirtualBackend;

#[cfg(feature = "device")]
pub use device::CpalBackend;
