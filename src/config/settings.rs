// Configuration structs

use super::constants::*;
use crate::device::{capability_set, CapabilitySet, DeviceClass};
use crate::errors::{parse_id, CoordError};
use crate::responder::{ConcurrentVoicePolicy, DeviceResponderPolicy, ResponderMode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub workspace: WorkspaceConfig,
    pub responder: ResponderConfig,
    pub relay: RelayConfig,
    pub messages: MessagesConfig,
    pub tasks: TasksConfig,
}

/// What this device is and can do
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Display name override (defaults to the hostname)
    pub name: Option<String>,
    /// "desktop", "mobile" or "cli"
    pub class: String,
    /// Capability tags advertised to peers
    pub capabilities: Vec<String>,
    /// Priority override; lower = preferred
    pub priority: Option<u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: None,
            class: "desktop".to_string(),
            capabilities: vec!["llm".to_string(), "tools".to_string()],
            priority: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Shared workspace UUID
    pub id: Option<String>,
    /// Owning user account on the relay
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// "priority", "last_active" or "manual"
    pub mode: String,
    /// Device UUID for manual mode
    pub pinned_device: Option<String>,
    /// Whether several devices may run voice sessions at once
    pub voice_sessions: ConcurrentVoicePolicy,
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            mode: "priority".to_string(),
            pinned_device: None,
            voice_sessions: ConcurrentVoicePolicy::ElectOne,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub enabled: bool,
    pub url: String,
    /// Bearer token for the relay (optional)
    pub token: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub lock_lease_secs: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled: false, // Standalone until a relay is configured
            url: "https://relay.devicemesh.dev".to_string(),
            token: None,
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            lock_lease_secs: LOCK_LEASE_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagesConfig {
    pub default_ttl_secs: i64,
    pub retention_hours: i64,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_MESSAGE_TTL_SECS,
            retention_hours: DEFAULT_RETENTION_HOURS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    pub retention_hours: i64,
    /// Idle sleep between worker polls
    pub worker_poll_ms: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            retention_hours: DEFAULT_RETENTION_HOURS,
            worker_poll_ms: 1000,
        }
    }
}

impl Config {
    pub fn device_class(&self) -> Result<DeviceClass, CoordError> {
        self.device.class.parse()
    }

    pub fn capabilities(&self) -> CapabilitySet {
        capability_set(self.device.capabilities.iter().map(|c| c.trim().to_string()))
    }

    /// The configured workspace, if any.
    pub fn workspace_id(&self) -> Result<Option<Uuid>, CoordError> {
        self.workspace
            .id
            .as_deref()
            .map(|id| parse_id("workspace", id))
            .transpose()
    }

    pub fn responder_policy(&self) -> Result<DeviceResponderPolicy, CoordError> {
        let pinned = self
            .responder
            .pinned_device
            .as_deref()
            .map(|id| parse_id("device", id))
            .transpose()?;
        let mode = ResponderMode::parse(&self.responder.mode, pinned)?;
        Ok(DeviceResponderPolicy::new(mode).with_voice_policy(self.responder.voice_sessions))
    }

    pub fn message_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.messages.default_ttl_secs)
    }

    pub fn lock_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.relay.lock_lease_secs)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.relay.heartbeat_interval_secs)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), CoordError> {
        self.device_class()?;
        self.workspace_id()?;
        self.responder_policy()?;

        if self.relay.heartbeat_interval_secs == 0 {
            return Err(CoordError::InvalidConfig(
                "relay.heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.relay.heartbeat_interval_secs as i64 >= ONLINE_THRESHOLD_SECS {
            return Err(CoordError::InvalidConfig(format!(
                "relay.heartbeat_interval_secs ({}) must be below the {}s online threshold",
                self.relay.heartbeat_interval_secs, ONLINE_THRESHOLD_SECS
            )));
        }
        if self.relay.lock_lease_secs <= 0 {
            return Err(CoordError::InvalidConfig(
                "relay.lock_lease_secs must be greater than 0".to_string(),
            ));
        }
        if self.messages.default_ttl_secs <= 0 {
            return Err(CoordError::InvalidConfig(
                "messages.default_ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.messages.retention_hours <= 0 || self.tasks.retention_hours <= 0 {
            return Err(CoordError::InvalidConfig(
                "retention_hours must be greater than 0".to_string(),
            ));
        }
        if self.relay.enabled && !self.relay.url.starts_with("http") {
            return Err(CoordError::InvalidConfig(format!(
                "relay.url '{}' is not an http(s) URL",
                self.relay.url
            )));
        }
        Ok(())
    }
}
