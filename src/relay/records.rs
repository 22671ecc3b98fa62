// Records stored by the cloud relay

use crate::device::DeviceClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One device's presence, upserted every heartbeat interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub id: Uuid,
    /// Owning user account
    pub user_id: String,
    pub name: String,
    pub platform: String,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub workspace_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<DeviceClass>,
    /// Absent means "unchanged"; an empty list withdraws every capability
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

/// A short-lived leader lock on `resource` within a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource: String,
    pub workspace_id: Uuid,
    pub holder_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
