// In-process relay - same contract as the hosted one, held in memory.
//
// Used by the `demo` command to run several devices in one process, and by
// tests. `set_available(false)` simulates an outage.

use super::{HeartbeatRecord, LockRecord, Relay};
use crate::messaging::PeerMessage;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct RelayState {
    heartbeats: HashMap<Uuid, HeartbeatRecord>,
    locks: HashMap<(Uuid, String), LockRecord>,
    messages: Vec<PeerMessage>,
}

pub struct MemoryRelay {
    state: Mutex<RelayState>,
    available: AtomicBool,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            anyhow::bail!("relay unavailable");
        }
        Ok(())
    }

    /// Current lock record, if any (expired records included).
    pub async fn lock_record(&self, resource: &str, workspace_id: Uuid) -> Option<LockRecord> {
        let state = self.state.lock().await;
        state.locks.get(&(workspace_id, resource.to_string())).cloned()
    }

    /// Messages not yet pulled.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.messages.len()
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn upsert_heartbeat(&self, record: &HeartbeatRecord) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.heartbeats.insert(record.id, record.clone());
        Ok(())
    }

    async fn list_heartbeats(&self, workspace_id: Uuid) -> Result<Vec<HeartbeatRecord>> {
        self.check()?;
        let state = self.state.lock().await;
        let mut records: Vec<HeartbeatRecord> = state
            .heartbeats
            .values()
            .filter(|r| r.workspace_ids.contains(&workspace_id))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn acquire_lock(
        &self,
        resource: &str,
        workspace_id: Uuid,
        holder_id: Uuid,
        lease: Duration,
    ) -> Result<bool> {
        self.check()?;
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let key = (workspace_id, resource.to_string());
        let free = match state.locks.get(&key) {
            None => true,
            Some(lock) => lock.is_expired_at(now) || lock.holder_id == holder_id,
        };
        if free {
            state.locks.insert(
                key,
                LockRecord {
                    resource: resource.to_string(),
                    workspace_id,
                    holder_id,
                    expires_at: now + lease,
                },
            );
        }
        Ok(free)
    }

    async fn refresh_lock(
        &self,
        resource: &str,
        workspace_id: Uuid,
        holder_id: Uuid,
        lease: Duration,
    ) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        match state.locks.get_mut(&(workspace_id, resource.to_string())) {
            Some(lock) if lock.holder_id == holder_id => {
                lock.expires_at = Utc::now() + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, resource: &str, workspace_id: Uuid, holder_id: Uuid) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        let key = (workspace_id, resource.to_string());
        match state.locks.get(&key) {
            Some(lock) if lock.holder_id == holder_id => {
                state.locks.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn push_message(&self, message: &PeerMessage) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        state.messages.push(message.clone());
        Ok(())
    }

    async fn pull_messages(&self, workspace_id: Uuid, device_id: Uuid) -> Result<Vec<PeerMessage>> {
        self.check()?;
        let mut state = self.state.lock().await;
        let (mine, rest): (Vec<PeerMessage>, Vec<PeerMessage>) = std::mem::take(&mut state.messages)
            .into_iter()
            .partition(|m| m.workspace_id == workspace_id && m.receiver_id == device_id);
        state.messages = rest;
        Ok(mine)
    }
}
