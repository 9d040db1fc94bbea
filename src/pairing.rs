//! Trusted-device policy
//!
//! The engine only asks two questions: is this address paired, and must an
//! unpaired request be confirmed. The paired list itself belongs to the host
//! application; `PairedDeviceStore` is a JSON-file implementation for the
//! command-line binaries. The engine never writes to it; a "remember this
//! device" decision surfaces as `EngineEvent::RememberDevice`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Connection-approval policy consulted on every CONNECT
pub trait PairingPolicy: Send + Sync {
    fn is_paired(&self, address: IpAddr) -> bool;

    fn require_confirmation(&self) -> bool;
}

/// Persisted trust record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairedDevice {
    pub name: String,
    pub ip: String,
    pub port: u16,
}

/// Fixed policy, mostly for tests and headless receivers
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    pub paired: Vec<IpAddr>,
    pub require_confirmation: bool,
}

impl PairingPolicy for StaticPolicy {
    fn is_paired(&self, address: IpAddr) -> bool {
        self.paired.contains(&address)
    }

    fn require_confirmation(&self) -> bool {
        self.require_confirmation
    }
}

/// Paired devices kept as a JSON array on disk
pub struct PairedDeviceStore {
    path: Option<PathBuf>,
    devices: RwLock<Vec<PairedDevice>>,
    require_confirmation: bool,
}

impl PairedDeviceStore {
    pub fn in_memory(require_confirmation: bool) -> Self {
        Self {
            path: None,
            devices: RwLock::new(Vec::new()),
            require_confirmation,
        }
    }

    /// Open the store at `path`; a missing file is an empty list
    pub fn open(path: impl Into<PathBuf>, require_confirmation: bool) -> Result<Self> {
        let path = path.into();
        let devices = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
        } else {
            Vec::new()
        };
        Ok(Self {
            path: Some(path),
            devices: RwLock::new(devices),
            require_confirmation,
        })
    }

    pub fn devices(&self) -> Vec<PairedDevice> {
        self.devices.read().clone()
    }

    /// Add or replace the record for `device.ip`, then persist
    pub fn remember(&self, device: PairedDevice) -> Result<()> {
        {
            let mut devices = self.devices.write();
            devices.retain(|d| d.ip != device.ip);
            devices.push(device);
        }
        self.persist()
    }

    pub fn forget(&self, ip: &str) -> Result<bool> {
        let removed = {
            let mut devices = self.devices.write();
            let before = devices.len();
            devices.retain(|d| d.ip != ip);
            devices.len() != before
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_json(path, &*self.devices.read())
    }
}

impl PairingPolicy for PairedDeviceStore {
    fn is_paired(&self, address: IpAddr) -> bool {
        let address = address.to_string();
        self.devices.read().iter().any(|d| d.ip == address)
    }

    fn require_confirmation(&self) -> bool {
        self.require_confirmation
    }
}

fn write_json(path: &Path, devices: &[PairedDevice]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(devices).map_err(|e| Error::Config(e.to_string()))?;
    std::fs::write(path, text)?;
    Ok(())
}
