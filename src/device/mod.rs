// Device module - who the peers are and what they can do.
//
// Every running instance is a device. Devices have:
//   - A stable UUID (persisted under ~/.devicemesh on first run)
//   - A class (desktop / mobile / cli) which sets its default priority
//   - A set of opaque capability tags ("llm", "tts", "tools", ...)
//   - A last-seen timestamp refreshed by heartbeats
//
// The registry holds the local view of all known devices; TaskQueue,
// PeerMessageRouter and the responder policy read it but never own it.

pub mod identity;
pub mod registry;

pub use identity::LocalIdentity;
pub use registry::DeviceRegistry;

use crate::config::constants::ONLINE_THRESHOLD_SECS;
use crate::errors::CoordError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque capability tags. Ordered so that logs and snapshots are stable.
pub type CapabilitySet = BTreeSet<String>;

/// Build a capability set from anything string-like.
pub fn capability_set<I, S>(tags: I) -> CapabilitySet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    tags.into_iter().map(Into::into).collect()
}

/// Broad hardware class of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Cli,
}

impl DeviceClass {
    /// Priority used when none is configured. Lower = preferred.
    pub fn default_priority(self) -> u32 {
        match self {
            DeviceClass::Desktop => 1,
            DeviceClass::Mobile => 2,
            DeviceClass::Cli => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Cli => "cli",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceClass {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceClass::Desktop),
            "mobile" => Ok(DeviceClass::Mobile),
            "cli" => Ok(DeviceClass::Cli),
            _ => Err(CoordError::UnknownVariant {
                field: "device class",
                value: s.to_string(),
                expected: "desktop, mobile, cli",
            }),
        }
    }
}

/// A known peer (or this device itself)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub class: DeviceClass,
    pub platform: String,
    pub capabilities: CapabilitySet,
    /// Lower = preferred when electing a responder
    pub priority: u32,
    pub last_seen: DateTime<Utc>,
    /// True only for the device this process runs on
    #[serde(default)]
    pub is_local: bool,
}

impl Device {
    /// A remote device first seen now, with its class default priority.
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        class: DeviceClass,
        platform: impl Into<String>,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            class,
            platform: platform.into(),
            capabilities,
            priority: class.default_priority(),
            last_seen: Utc::now(),
            is_local: false,
        }
    }

    /// Override the class default priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn as_local(mut self) -> Self {
        self.is_local = true;
        self
    }

    /// The local device is always online to itself; everyone else must have
    /// been heard from within the threshold.
    pub fn is_online_at(&self, now: DateTime<Utc>) -> bool {
        self.is_local || now - self.last_seen < Duration::seconds(ONLINE_THRESHOLD_SECS)
    }

    /// True when every required tag is present.
    pub fn can_run(&self, required: &[String]) -> bool {
        has_capabilities(&self.capabilities, required)
    }
}

/// `required ⊆ available`
pub fn has_capabilities(available: &CapabilitySet, required: &[String]) -> bool {
    required.iter().all(|c| available.contains(c))
}
