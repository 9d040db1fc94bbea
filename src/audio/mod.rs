//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod memory;
pub mod playback;

pub use buffer::{ChunkAssembler, SampleRing};
pub use capture::CaptureSource;
pub use device::{find_by_name, preferred_capture, AudioBackend, SharedVolume};
pub use memory::{CaptureScript, MemoryBackend};
pub use playback::PlaybackSink;

#[cfg(feature = "audio")]
pub use device::{get_device_by_id, list_devices, CpalBackend};
