// Cloud relay - durability beyond one process lifetime
//
// The relay is a dumb backend: it stores heartbeats, hands out short-lived
// leader locks and optionally carries peer messages. Nothing local depends
// on it being reachable; callers fail open.

pub mod client;
pub mod lock;
pub mod memory;
pub mod records;
pub mod retry;

pub use client::HttpRelay;
pub use lock::{LeaderGate, LockOutcome};
pub use memory::MemoryRelay;
pub use records::{HeartbeatRecord, LockRecord};
pub use retry::{with_retry, RetryPolicy};

use crate::messaging::PeerMessage;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

#[async_trait]
pub trait Relay: Send + Sync {
    async fn upsert_heartbeat(&self, record: &HeartbeatRecord) -> Result<()>;

    /// Every heartbeat listing `workspace_id`, including stale ones.
    async fn list_heartbeats(&self, workspace_id: Uuid) -> Result<Vec<HeartbeatRecord>>;

    /// Insert if absent; overwrite if expired or already ours; else false.
    async fn acquire_lock(
        &self,
        resource: &str,
        workspace_id: Uuid,
        holder_id: Uuid,
        lease: Duration,
    ) -> Result<bool>;

    /// Extend the lease; only the current holder may.
    async fn refresh_lock(
        &self,
        resource: &str,
        workspace_id: Uuid,
        holder_id: Uuid,
        lease: Duration,
    ) -> Result<bool>;

    /// Delete the lock if `holder_id` holds it.
    async fn release_lock(&self, resource: &str, workspace_id: Uuid, holder_id: Uuid) -> Result<bool>;

    async fn push_message(&self, message: &PeerMessage) -> Result<()>;

    /// Messages waiting for `device_id`. Delivery is at-least-once.
    async fn pull_messages(&self, workspace_id: Uuid, device_id: Uuid) -> Result<Vec<PeerMessage>>;
}
