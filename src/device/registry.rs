// Device Registry - local view of every known device
//
// Written mainly by the heartbeat path, read by the queue, router and
// responder policy. Readers take a snapshot per decision; the registry may
// change between calls and nobody holds a lock across a multi-step decision.

use super::{CapabilitySet, Device, DeviceClass};
use crate::relay::HeartbeatRecord;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Thread-safe registry of known devices. Clone freely (it's an Arc inside).
#[derive(Clone)]
pub struct DeviceRegistry {
    local_id: Uuid,
    devices: Arc<RwLock<HashMap<Uuid, Device>>>,
}

impl DeviceRegistry {
    /// Create a registry seeded with the local device.
    pub fn new(local: Device) -> Self {
        let local = local.as_local();
        let local_id = local.id;
        let mut devices = HashMap::new();
        devices.insert(local_id, local);
        Self {
            local_id,
            devices: Arc::new(RwLock::new(devices)),
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    /// The local device entry.
    pub async fn local(&self) -> Device {
        let devices = self.devices.read().await;
        // Seeded in new() and remove() refuses to drop it
        devices[&self.local_id].clone()
    }

    /// Insert or replace a device. The local flag is owned by the registry.
    pub async fn upsert(&self, device: Device) {
        let mut device = device;
        device.is_local = device.id == self.local_id;
        let mut devices = self.devices.write().await;
        devices.insert(device.id, device);
    }

    /// Fold a relay heartbeat into the registry. Returns true when the device
    /// was seen for the first time.
    ///
    /// Our own record echoed back by the relay is ignored: the local entry
    /// is authoritative for itself.
    pub async fn observe_heartbeat(&self, record: &HeartbeatRecord) -> bool {
        if record.id == self.local_id {
            return false;
        }

        let mut devices = self.devices.write().await;
        match devices.get_mut(&record.id) {
            Some(existing) => {
                if record.last_heartbeat > existing.last_seen {
                    existing.last_seen = record.last_heartbeat;
                }
                existing.name = record.name.clone();
                existing.platform = record.platform.clone();
                if let Some(class) = record.class {
                    existing.class = class;
                }
                if let Some(capabilities) = &record.capabilities {
                    existing.capabilities = capabilities.iter().cloned().collect();
                }
                if let Some(priority) = record.priority {
                    existing.priority = priority;
                }
                false
            }
            None => {
                let class = record.class.unwrap_or(DeviceClass::Desktop);
                let mut device = Device::new(
                    record.id,
                    record.name.clone(),
                    class,
                    record.platform.clone(),
                    record.capabilities.iter().flatten().cloned().collect(),
                )
                .with_last_seen(record.last_heartbeat);
                if let Some(priority) = record.priority {
                    device.priority = priority;
                }
                tracing::info!(
                    device_id = %record.id,
                    name = %record.name,
                    class = %class,
                    "Discovered new peer device"
                );
                devices.insert(record.id, device);
                true
            }
        }
    }

    /// Mark a device as seen at `at`. Returns false for unknown devices.
    pub async fn touch_at(&self, id: Uuid, at: DateTime<Utc>) -> bool {
        let mut devices = self.devices.write().await;
        match devices.get_mut(&id) {
            Some(device) => {
                if at > device.last_seen {
                    device.last_seen = at;
                }
                true
            }
            None => false,
        }
    }

    pub async fn touch(&self, id: Uuid) -> bool {
        self.touch_at(id, Utc::now()).await
    }

    /// Explicit user removal. The local device cannot be removed.
    pub async fn remove(&self, id: Uuid) -> bool {
        if id == self.local_id {
            return false;
        }
        let mut devices = self.devices.write().await;
        let removed = devices.remove(&id).is_some();
        if removed {
            tracing::info!(device_id = %id, "Removed device from registry");
        }
        removed
    }

    pub async fn get(&self, id: Uuid) -> Option<Device> {
        let devices = self.devices.read().await;
        devices.get(&id).cloned()
    }

    pub async fn capabilities_of(&self, id: Uuid) -> Option<CapabilitySet> {
        let devices = self.devices.read().await;
        devices.get(&id).map(|d| d.capabilities.clone())
    }

    /// All devices, ordered by id.
    pub async fn snapshot(&self) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut all: Vec<Device> = devices.values().cloned().collect();
        all.sort_by_key(|d| d.id);
        all
    }

    /// Devices online at `now`, ordered by id.
    pub async fn online_at(&self, now: DateTime<Utc>) -> Vec<Device> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|d| d.is_online_at(now))
            .collect()
    }

    pub async fn online(&self) -> Vec<Device> {
        self.online_at(Utc::now()).await
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }
}
