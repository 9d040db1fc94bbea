//! Application configuration
//!
//! Stored as TOML under the platform config directory. A missing file yields
//! the defaults; a malformed one is reported as `Error::Config`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::protocol::TransportMode;

const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Name advertised in discovery responses and connect requests
    pub device_name: String,
    pub network: NetworkConfig,
    pub audio: AudioConfig,
    pub meter: MeterConfig,
    pub approval: ApprovalConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            network: NetworkConfig::default(),
            audio: AudioConfig::default(),
            meter: MeterConfig::default(),
            approval: ApprovalConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port for discovery and control datagrams
    pub discovery_port: u16,
    /// TCP port for the audio data channel
    pub audio_port: u16,
    pub transport_mode: TransportMode,
    /// Length of one discovery round
    pub discovery_timeout_ms: u64,
    /// Pause between periodic discovery rounds
    pub discovery_interval_ms: u64,
    /// Wait for ACCEPT/REJECT after CONNECT
    pub connect_timeout_secs: u64,
    /// Receiver ends a session when no audio arrives for this long
    pub idle_timeout_secs: Option<u64>,
    /// Interface to bind listeners on
    pub bind_address: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            audio_port: DEFAULT_AUDIO_PORT,
            transport_mode: TransportMode::TcpOnly,
            discovery_timeout_ms: DEFAULT_DISCOVERY_TIMEOUT.as_millis() as u64,
            discovery_interval_ms: 5000,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: None,
            bind_address: "0.0.0.0".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per capture read and per socket write
    pub chunk_size: usize,
    /// Capture device name; the backend picks one when unset
    pub capture_device: Option<String>,
    /// Initial playback volume in [0, 1]
    pub volume: f32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            chunk_size: CHUNK_SIZE,
            capture_device: None,
            volume: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    pub bands: usize,
    /// One level vector every `cadence` chunks
    pub cadence: u32,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            bands: DEFAULT_LEVEL_BANDS,
            cadence: DEFAULT_METER_CADENCE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Ask before accepting a CONNECT from an unpaired address
    pub require_confirmation: bool,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            require_confirmation: true,
        }
    }
}

impl AppConfig {
    /// Directory holding config and paired-device files
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "lan-audio-relay")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::warn!("No config directory available, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Check the values that form the wire contract
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate != SAMPLE_RATE || self.audio.channels != CHANNELS {
            return Err(Error::Config(format!(
                "audio format must be {} Hz / {} channels, got {} Hz / {} channels",
                SAMPLE_RATE, CHANNELS, self.audio.sample_rate, self.audio.channels
            )));
        }
        if self.audio.chunk_size == 0 || self.audio.chunk_size % BYTES_PER_FRAME != 0 {
            return Err(Error::Config(format!(
                "chunk_size must be a non-zero multiple of {} bytes, got {}",
                BYTES_PER_FRAME, self.audio.chunk_size
            )));
        }
        if self.meter.bands == 0 || self.meter.cadence == 0 {
            return Err(Error::Config("meter bands and cadence must be non-zero".into()));
        }
        if self.device_name.trim().is_empty() {
            return Err(Error::Config("device_name must not be empty".into()));
        }
        Ok(())
    }
}

fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "Audio Relay".to_string())
        .replace(';', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network.discovery_port, 5002);
        assert_eq!(config.network.audio_port, 5000);
        assert_eq!(config.audio.chunk_size, 4096);
        assert_eq!(config.meter.bands, 24);
        assert!(config.approval.require_confirmation);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            device_name = "Desk"
            [network]
            transport_mode = "tls_udp_auth"
            [meter]
            cadence = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.device_name, "Desk");
        assert_eq!(config.network.transport_mode, TransportMode::TlsUdpAuth);
        assert_eq!(config.network.audio_port, 5000);
        assert_eq!(config.meter.cadence, 3);
        assert_eq!(config.meter.bands, 24);
    }

    #[test]
    fn test_rejects_format_mismatch() {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 48000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = AppConfig::default();
        config.audio.chunk_size = 4098;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        assert_eq!(AppConfig::load_from(&path).unwrap(), AppConfig::default());

        let mut config = AppConfig::default();
        config.device_name = "Kitchen".into();
        config.network.idle_timeout_secs = Some(15);
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);

        std::fs::write(&path, "network = 5").unwrap();
        assert!(matches!(AppConfig::load_from(&path), Err(Error::Config(_))));
    }
}
