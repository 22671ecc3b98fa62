// Leader gate - relay-held locks with fail-open semantics
//
// Used when several online devices may all decide to act on the same event
// (a remote chat message fanned out to every device). The relay arbitrates;
// if it cannot be reached we log and behave as the holder, so local function
// never depends on the relay.

use super::Relay;
use crate::metrics;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    HeldElsewhere,
    /// Relay unreachable; proceeding as if we held the lock
    FailOpen,
}

impl LockOutcome {
    pub fn may_proceed(self) -> bool {
        !matches!(self, LockOutcome::HeldElsewhere)
    }
}

#[derive(Clone)]
pub struct LeaderGate {
    relay: Arc<dyn Relay>,
    workspace_id: Uuid,
    holder_id: Uuid,
    lease: Duration,
}

impl LeaderGate {
    pub fn new(relay: Arc<dyn Relay>, workspace_id: Uuid, holder_id: Uuid, lease: Duration) -> Self {
        Self {
            relay,
            workspace_id,
            holder_id,
            lease,
        }
    }

    pub async fn acquire(&self, resource: &str) -> LockOutcome {
        match self
            .relay
            .acquire_lock(resource, self.workspace_id, self.holder_id, self.lease)
            .await
        {
            Ok(true) => {
                debug!(resource, "Acquired leader lock");
                LockOutcome::Acquired
            }
            Ok(false) => {
                debug!(resource, "Leader lock held by another device");
                LockOutcome::HeldElsewhere
            }
            Err(e) => {
                warn!(resource, "Lock service unreachable, proceeding as holder: {}", e);
                metrics::record_fail_open("lock");
                LockOutcome::FailOpen
            }
        }
    }

    /// Extend our lease. False if someone else took it over.
    pub async fn refresh(&self, resource: &str) -> bool {
        match self
            .relay
            .refresh_lock(resource, self.workspace_id, self.holder_id, self.lease)
            .await
        {
            Ok(held) => held,
            Err(e) => {
                warn!(resource, "Lock refresh failed, keeping local lease: {}", e);
                metrics::record_fail_open("lock");
                true
            }
        }
    }

    pub async fn release(&self, resource: &str) {
        if let Err(e) = self
            .relay
            .release_lock(resource, self.workspace_id, self.holder_id)
            .await
        {
            // The lease expires on its own
            warn!(resource, "Lock release failed: {}", e);
        }
    }
}
