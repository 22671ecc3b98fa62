// Local identity - persistent UUID for this device.
//
// Every device gets a stable UUID written to ~/.devicemesh/device.json on
// first run. Peers key heartbeats, tasks and messages by this id, so it must
// survive restarts.

use super::{CapabilitySet, Device, DeviceClass};
use crate::config::constants::DATA_DIR_NAME;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const IDENTITY_FILE: &str = "device.json";

/// This device's stable identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIdentity {
    /// Stable UUID - never changes after first run
    pub id: Uuid,
    /// Human-readable name (defaults to hostname)
    pub name: String,
    pub class: DeviceClass,
    /// Operating system
    pub platform: String,
    /// Version that created this identity
    pub version: String,
}

impl LocalIdentity {
    /// Load the identity from `~/.devicemesh`, creating it on first run.
    pub fn load_or_create(class: DeviceClass) -> Result<Self> {
        Self::load_or_create_in(&default_dir()?, class)
    }

    /// Load the identity from `dir`, creating it on first run.
    pub fn load_or_create_in(dir: &Path, class: DeviceClass) -> Result<Self> {
        let path = dir.join(IDENTITY_FILE);

        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read device identity from {}", path.display()))?;
            let identity: Self = serde_json::from_str(&raw)
                .with_context(|| "Failed to parse device identity JSON")?;
            return Ok(identity);
        }

        let identity = Self::generate(class);
        identity.save_in(dir)?;
        tracing::info!(device_id = %identity.id, class = %class, "Generated new device identity");
        Ok(identity)
    }

    fn generate(class: DeviceClass) -> Self {
        let id = Uuid::new_v4();
        let name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| format!("device-{}", &id.to_string()[..8]));
        Self {
            id,
            name,
            class,
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn save_in(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(IDENTITY_FILE);
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize device identity")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write device identity to {}", path.display()))?;
        Ok(())
    }

    /// The registry entry for this device.
    pub fn to_device(&self, capabilities: CapabilitySet, priority: Option<u32>) -> Device {
        let mut device = Device::new(
            self.id,
            self.name.clone(),
            self.class,
            self.platform.clone(),
            capabilities,
        )
        .with_last_seen(Utc::now())
        .as_local();
        if let Some(p) = priority {
            device.priority = p;
        }
        device
    }

    /// Short display prefix (first 8 chars of UUID)
    pub fn short_id(&self) -> String {
        self.id.to_string()[..8].to_string()
    }
}

/// `~/.devicemesh`
pub fn default_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Cannot determine home directory")?;
    Ok(home.join(DATA_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::capability_set;
    use tempfile::TempDir;

    #[test]
    fn test_identity_created_then_reused() {
        let dir = TempDir::new().unwrap();
        let first = LocalIdentity::load_or_create_in(dir.path(), DeviceClass::Desktop).unwrap();
        let second = LocalIdentity::load_or_create_in(dir.path(), DeviceClass::Mobile).unwrap();
        assert_eq!(first.id, second.id);
        // Class comes from the persisted file, not the later argument
        assert_eq!(second.class, DeviceClass::Desktop);
        assert!(dir.path().join(IDENTITY_FILE).exists());
    }

    #[test]
    fn test_short_id() {
        let identity = LocalIdentity {
            id: Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
            name: "test".to_string(),
            class: DeviceClass::Cli,
            platform: "linux".to_string(),
            version: "0.1.0".to_string(),
        };
        assert_eq!(identity.short_id(), "550e8400");
    }

    #[test]
    fn test_to_device_is_local_with_override() {
        let identity = LocalIdentity::generate(DeviceClass::Mobile);
        let device = identity.to_device(capability_set(["tts"]), Some(7));
        assert!(device.is_local);
        assert_eq!(device.priority, 7);
        assert_eq!(device.id, identity.id);

        let default = identity.to_device(capability_set(["tts"]), None);
        assert_eq!(default.priority, DeviceClass::Mobile.default_priority());
    }
}
