//! Audio device capability interface and enumeration helpers
//!
//! Platform audio is reached through `AudioBackend`, chosen when the engine
//! is composed: the cpal backend for real hardware, the in-memory backend for
//! headless runs and tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::audio::capture::CaptureSource;
use crate::audio::playback::PlaybackSink;
use crate::error::AudioError;
use crate::protocol::AudioDeviceInfo;

/// Enumerate devices and open capture/playback endpoints
pub trait AudioBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    fn list_devices(&self) -> Vec<AudioDeviceInfo>;

    /// Open a capture endpoint producing 44.1 kHz stereo s16le
    ///
    /// `None` lets the backend pick, preferring system-output capture.
    fn open_capture(
        &self,
        device: Option<&AudioDeviceInfo>,
    ) -> Result<Box<dyn CaptureSource>, AudioError>;

    /// Open the playback endpoint; `volume` is read on every buffer
    fn open_playback(&self, volume: SharedVolume) -> Result<Box<dyn PlaybackSink>, AudioError>;
}

/// Playback gain shared between the control thread and the audio path
#[derive(Clone, Debug)]
pub struct SharedVolume(Arc<AtomicU32>);

impl SharedVolume {
    pub fn new(level: f32) -> Self {
        Self(Arc::new(AtomicU32::new(clamp_volume(level).to_bits())))
    }

    /// Clamp to [0, 1] and publish
    pub fn set(&self, level: f32) -> f32 {
        let level = clamp_volume(level);
        self.0.store(level.to_bits(), Ordering::Relaxed);
        level
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

impl Default for SharedVolume {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn clamp_volume(level: f32) -> f32 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}

/// Whether a device name looks like a monitor/loopback of system output
pub fn is_monitor_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    const PATTERNS: [&str; 7] = [
        ".monitor",
        "monitor of",
        "loopback",
        "stereo mix",
        "what u hear",
        "blackhole",
        "sink monitor",
    ];
    PATTERNS.iter().any(|p| lower.contains(p))
        || (lower.contains("sink") && lower.contains("monitor"))
}

/// Raw ALSA aliases that duplicate the useful pipewire/pulse entries
pub fn is_low_level_alsa(name: &str) -> bool {
    ["hw:", "plughw:", "sysdefault:", "front:"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

/// Find a device by name: exact, then substring, then any name token
pub fn find_by_name<'a>(
    devices: &'a [AudioDeviceInfo],
    wanted: &str,
) -> Option<&'a AudioDeviceInfo> {
    if let Some(device) = devices.iter().find(|d| d.name == wanted || d.id == wanted) {
        return Some(device);
    }

    let needle = wanted.to_lowercase();
    if needle.is_empty() {
        return None;
    }
    if let Some(device) = devices
        .iter()
        .find(|d| d.name.to_lowercase().contains(&needle))
    {
        return Some(device);
    }

    let tokens: Vec<String> = wanted
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect();
    devices.iter().find(|d| {
        let name = d.name.to_lowercase();
        tokens.iter().any(|t| name.contains(t))
    })
}

/// Preferred capture input: a monitor, then the default input, then any
pub fn preferred_capture(devices: &[AudioDeviceInfo]) -> Option<&AudioDeviceInfo> {
    let inputs = || devices.iter().filter(|d| d.is_input);
    inputs()
        .find(|d| d.is_monitor)
        .or_else(|| inputs().find(|d| d.is_default))
        .or_else(|| inputs().next())
}

#[cfg(feature = "audio")]
pub use host::{get_device_by_id, list_devices, CpalBackend};

#[cfg(feature = "audio")]
mod host {
    use cpal::traits::{DeviceTrait, HostTrait};

    use super::*;
    use crate::audio::capture::CpalCapture;
    use crate::audio::playback::CpalPlayback;

    /// Hardware backend over the cpal default host
    #[derive(Default)]
    pub struct CpalBackend;

    impl AudioBackend for CpalBackend {
        fn name(&self) -> &str {
            "cpal"
        }

        fn list_devices(&self) -> Vec<AudioDeviceInfo> {
            list_devices()
        }

        fn open_capture(
            &self,
            device: Option<&AudioDeviceInfo>,
        ) -> Result<Box<dyn CaptureSource>, AudioError> {
            let info = match device {
                Some(info) => info.clone(),
                None => {
                    let devices = list_devices();
                    preferred_capture(&devices)
                        .cloned()
                        .ok_or_else(|| AudioError::DeviceNotFound("no input device".into()))?
                }
            };
            tracing::info!(device = %info.name, monitor = info.is_monitor, "Opening capture");
            let device = get_device_by_id(&info.id)?;
            Ok(Box::new(CpalCapture::open(device)?))
        }

        fn open_playback(
            &self,
            volume: SharedVolume,
        ) -> Result<Box<dyn PlaybackSink>, AudioError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or_else(|| AudioError::DeviceNotFound("No default output device".into()))?;
            Ok(Box::new(CpalPlayback::open(device, volume)?))
        }
    }

    /// List usable audio devices, skipping raw ALSA aliases
    pub fn list_devices() -> Vec<AudioDeviceInfo> {
        let host = cpal::default_host();
        let mut devices: Vec<AudioDeviceInfo> = Vec::new();

        let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
        let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

        if let Ok(input_devices) = host.input_devices() {
            for device in input_devices {
                let Ok(name) = device.name() else { continue };
                if is_low_level_alsa(&name) {
                    tracing::debug!(%name, "Skipping low-level ALSA device");
                    continue;
                }
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    is_monitor: is_monitor_device(&name),
                    name,
                    is_input: true,
                    is_output: false,
                });
            }
        }

        if let Ok(output_devices) = host.output_devices() {
            for device in output_devices {
                let Ok(name) = device.name() else { continue };
                if is_low_level_alsa(&name) {
                    continue;
                }
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    continue;
                }
                devices.push(AudioDeviceInfo {
                    id: format!("output:{}", name),
                    name,
                    is_input: false,
                    is_output: true,
                    is_default,
                    is_monitor: false,
                });
            }
        }

        devices
    }

    /// Get a device by its ID (`input:<name>` / `output:<name>`)
    pub fn get_device_by_id(id: &str) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();

        let (is_input, name) = if let Some(name) = id.strip_prefix("input:") {
            (true, name)
        } else if let Some(name) = id.strip_prefix("output:") {
            (false, name)
        } else {
            (true, id)
        };

        let devices = if is_input {
            host.input_devices()
        } else {
            host.output_devices()
        }
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        for device in devices {
            if device.name().map(|n| n == name).unwrap_or(false) {
                return Ok(device);
            }
        }

        Err(AudioError::DeviceNotFound(id.to_string()))
    }
}
