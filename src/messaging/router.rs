// Peer message router - TTL-bound exchange with type-keyed dispatch
//
// One router per (workspace, local device). The router records intent and
// outcomes; moving bytes between devices is the transport's job, driven by
// whoever drains `pending_outbox()`.
//
// Inbound guarantees:
//   - a message past its expiry is marked `expired` and never reaches a handler
//   - a message id already in the inbox is a transport duplicate and is not
//     dispatched again
//   - handler errors and panics are recorded on the message, never propagated

use super::message::{MessageStatus, MessageType, PeerMessage};
use crate::metrics;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Processes inbound messages of one type
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &PeerMessage) -> Result<()>;
}

/// Adapter for plain synchronous closures.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&PeerMessage) -> Result<()> + Send + Sync,
{
    async fn handle(&self, message: &PeerMessage) -> Result<()> {
        (self.0)(message)
    }
}

/// Wrap a closure as a handler.
pub fn handler_fn<F>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(&PeerMessage) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

pub struct PeerMessageRouter {
    workspace_id: Uuid,
    local_device_id: Uuid,
    default_ttl: Duration,
    inbox: RwLock<HashMap<Uuid, PeerMessage>>,
    outbox: RwLock<HashMap<Uuid, PeerMessage>>,
    handlers: DashMap<MessageType, Arc<dyn MessageHandler>>,
}

impl PeerMessageRouter {
    pub fn new(workspace_id: Uuid, local_device_id: Uuid, default_ttl: Duration) -> Self {
        Self {
            workspace_id,
            local_device_id,
            default_ttl,
            inbox: RwLock::new(HashMap::new()),
            outbox: RwLock::new(HashMap::new()),
            handlers: DashMap::new(),
        }
    }

    pub fn workspace_id(&self) -> Uuid {
        self.workspace_id
    }

    pub fn local_device_id(&self) -> Uuid {
        self.local_device_id
    }

    /// One handler per type; the latest registration wins.
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        if self.handlers.insert(message_type, handler).is_some() {
            debug!(message_type = %message_type, "Replaced message handler");
        }
    }

    pub fn has_handler(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Record an outgoing message as `queued`. Nothing is transmitted here.
    pub async fn send(
        &self,
        to_device_id: Uuid,
        message_type: MessageType,
        payload: Value,
        ttl: Option<Duration>,
    ) -> PeerMessage {
        let now = Utc::now();
        let expires_at = now + ttl.unwrap_or(self.default_ttl);
        let message = PeerMessage::new(
            self.workspace_id,
            self.local_device_id,
            to_device_id,
            message_type,
            payload,
            Some(expires_at),
        );
        self.outbox.write().await.insert(message.id, message.clone());
        metrics::record_message(MessageStatus::Queued);
        debug!(
            message_id = %message.id,
            to = %to_device_id,
            message_type = %message_type,
            "Queued outgoing message"
        );
        message
    }

    /// Accept one inbound message and dispatch it.
    ///
    /// Returns the message's resulting status, or None when the message is
    /// addressed to another device or workspace and was ignored.
    pub async fn receive(&self, message: PeerMessage) -> Option<MessageStatus> {
        if message.receiver_id != self.local_device_id || message.workspace_id != self.workspace_id {
            warn!(
                message_id = %message.id,
                receiver = %message.receiver_id,
                workspace = %message.workspace_id,
                "Ignoring message not addressed to this device"
            );
            return None;
        }

        let now = Utc::now();
        let mut message = message;
        {
            let mut inbox = self.inbox.write().await;
            if let Some(existing) = inbox.get(&message.id) {
                debug!(message_id = %message.id, status = existing.status.as_str(), "Duplicate delivery ignored");
                return Some(existing.status);
            }

            if message.is_expired_at(now) {
                message.expire();
                info!(message_id = %message.id, message_type = %message.message_type, "Dropped expired message");
                inbox.insert(message.id, message);
                metrics::record_message(MessageStatus::Expired);
                return Some(MessageStatus::Expired);
            }

            message.status = MessageStatus::Delivered;
            message.delivered_at = Some(now);
            message.error = None;
            inbox.insert(message.id, message.clone());
        }

        // Clone the Arc out so no map guard is held across the handler await
        let handler = self
            .handlers
            .get(&message.message_type)
            .map(|h| Arc::clone(h.value()));

        let (status, error) = match handler {
            None => (
                MessageStatus::Failed,
                Some(format!("no handler registered for '{}'", message.message_type)),
            ),
            Some(handler) => match AssertUnwindSafe(handler.handle(&message)).catch_unwind().await {
                Ok(Ok(())) => (MessageStatus::Processed, None),
                Ok(Err(e)) => (MessageStatus::Failed, Some(format!("handler failed: {}", e))),
                Err(_) => (MessageStatus::Failed, Some("handler panicked".to_string())),
            },
        };

        if let Some(ref error) = error {
            warn!(message_id = %message.id, message_type = %message.message_type, error = %error, "Message processing failed");
        }

        // A sweep may have moved the entry on while the handler ran; a
        // terminal status is never overwritten.
        let mut inbox = self.inbox.write().await;
        let Some(entry) = inbox.get_mut(&message.id) else {
            return Some(status);
        };
        if entry.status != MessageStatus::Delivered {
            debug!(
                message_id = %message.id,
                status = entry.status.as_str(),
                "Message settled while its handler ran, outcome dropped"
            );
            return Some(entry.status);
        }
        entry.status = status;
        entry.error = error;
        if status == MessageStatus::Processed {
            entry.processed_at = Some(Utc::now());
        }
        metrics::record_message(status);
        Some(status)
    }

    /// Feed a batch from the transport through `receive`, keeping only the
    /// `queued` messages addressed here, strictly in creation order.
    pub async fn deliver_queued(&self, messages: Vec<PeerMessage>) -> Vec<(Uuid, MessageStatus)> {
        let mut batch: Vec<PeerMessage> = messages
            .into_iter()
            .filter(|m| {
                m.receiver_id == self.local_device_id
                    && m.workspace_id == self.workspace_id
                    && m.status == MessageStatus::Queued
            })
            .collect();
        // Stable: equal timestamps keep transport order
        batch.sort_by_key(|m| m.created_at);

        let mut outcomes = Vec::with_capacity(batch.len());
        for message in batch {
            let id = message.id;
            if let Some(status) = self.receive(message).await {
                outcomes.push((id, status));
            }
        }
        outcomes
    }

    /// Outbox entries still waiting for the transport, oldest first.
    /// Entries already past expiry are left for `cleanup_expired`.
    pub async fn pending_outbox(&self) -> Vec<PeerMessage> {
        let now = Utc::now();
        let outbox = self.outbox.read().await;
        let mut pending: Vec<PeerMessage> = outbox
            .values()
            .filter(|m| m.status == MessageStatus::Queued && !m.is_expired_at(now))
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.created_at);
        pending
    }

    /// Transport ack: a queued message was handed off. A message that
    /// expired while waiting is reclassified instead.
    pub async fn mark_sent(&self, message_id: Uuid) -> bool {
        let now = Utc::now();
        let mut outbox = self.outbox.write().await;
        let Some(message) = outbox.get_mut(&message_id) else {
            return false;
        };
        if message.status != MessageStatus::Queued {
            return false;
        }
        if message.is_expired_at(now) {
            message.expire();
            metrics::record_message(MessageStatus::Expired);
            return false;
        }
        message.status = MessageStatus::Delivered;
        message.delivered_at = Some(now);
        metrics::record_message(MessageStatus::Delivered);
        true
    }

    /// Sweep both boxes: `queued`/`delivered` entries past expiry → `expired`.
    pub async fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut expired = 0;
        for store in [&self.inbox, &self.outbox] {
            let mut map = store.write().await;
            for message in map.values_mut() {
                if matches!(message.status, MessageStatus::Queued | MessageStatus::Delivered)
                    && message.is_expired_at(now)
                {
                    message.expire();
                    expired += 1;
                }
            }
        }
        if expired > 0 {
            info!(expired, "Expired stale messages");
            for _ in 0..expired {
                metrics::record_message(MessageStatus::Expired);
            }
        }
        expired
    }

    pub async fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now()).await
    }

    /// Remove terminal entries whose last activity is older than `older_than`.
    /// Queued and delivered entries are never removed.
    pub async fn purge_at(&self, older_than: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - older_than;
        let mut removed = 0;
        for store in [&self.inbox, &self.outbox] {
            let mut map = store.write().await;
            let before = map.len();
            map.retain(|_, m| !(m.status.is_terminal() && m.last_activity() < cutoff));
            removed += before - map.len();
        }
        if removed > 0 {
            debug!(removed, "Purged terminal messages");
        }
        removed
    }

    pub async fn purge(&self, older_than: Duration) -> usize {
        self.purge_at(older_than, Utc::now()).await
    }

    pub async fn inbox_message(&self, id: Uuid) -> Option<PeerMessage> {
        self.inbox.read().await.get(&id).cloned()
    }

    pub async fn outbox_message(&self, id: Uuid) -> Option<PeerMessage> {
        self.outbox.read().await.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Fixture {
        workspace: Uuid,
        local: Uuid,
        peer: Uuid,
        router: PeerMessageRouter,
    }

    fn fixture() -> Fixture {
        let workspace = Uuid::new_v4();
        let local = Uuid::new_v4();
        Fixture {
            workspace,
            local,
            peer: Uuid::new_v4(),
            router: PeerMessageRouter::new(workspace, local, Duration::seconds(300)),
        }
    }

    impl Fixture {
        fn inbound(&self, message_type: MessageType, expires_in: Option<Duration>) -> PeerMessage {
            PeerMessage::new(
                self.workspace,
                self.peer,
                self.local,
                message_type,
                json!({}),
                expires_in.map(|d| Utc::now() + d),
            )
        }
    }

    fn counting_handler(count: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        handler_fn(move |_m| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_receive_processes_with_handler() {
        let f = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        f.router.register_handler(MessageType::Text, counting_handler(count.clone()));

        let message = f.inbound(MessageType::Text, Some(Duration::seconds(60)));
        let id = message.id;
        assert_eq!(f.router.receive(message).await, Some(MessageStatus::Processed));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let stored = f.router.inbox_message(id).await.unwrap();
        assert!(stored.delivered_at.is_some());
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_expired_message_never_reaches_handler() {
        let f = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        f.router.register_handler(MessageType::Command, counting_handler(count.clone()));

        let message = f.inbound(MessageType::Command, Some(Duration::seconds(-1)));
        let id = message.id;
        assert_eq!(f.router.receive(message).await, Some(MessageStatus::Expired));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(f.router.inbox_message(id).await.unwrap().status, MessageStatus::Expired);
    }

    #[tokio::test]
    async fn test_handler_error_recorded() {
        let f = fixture();
        f.router.register_handler(
            MessageType::TtsRequest,
            handler_fn(|_m| anyhow::bail!("speaker busy")),
        );
        let message = f.inbound(MessageType::TtsRequest, None);
        let id = message.id;
        assert_eq!(f.router.receive(message).await, Some(MessageStatus::Failed));
        let stored = f.router.inbox_message(id).await.unwrap();
        assert!(stored.error.unwrap().contains("speaker busy"));
    }

    #[tokio::test]
    async fn test_handler_panic_recorded() {
        let f = fixture();
        f.router.register_handler(
            MessageType::Notification,
            handler_fn(|_m| panic!("handler bug")),
        );
        let message = f.inbound(MessageType::Notification, None);
        let id = message.id;
        assert_eq!(f.router.receive(message).await, Some(MessageStatus::Failed));
        assert_eq!(
            f.router.inbox_message(id).await.unwrap().error.as_deref(),
            Some("handler panicked")
        );
    }

    #[tokio::test]
    async fn test_missing_handler_fails() {
        let f = fixture();
        let message = f.inbound(MessageType::TaskResult, None);
        let id = message.id;
        assert_eq!(f.router.receive(message).await, Some(MessageStatus::Failed));
        assert!(f
            .router
            .inbox_message(id)
            .await
            .unwrap()
            .error
            .unwrap()
            .contains("no handler"));
    }

    #[tokio::test]
    async fn test_latest_handler_registration_wins() {
        let f = fixture();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        f.router.register_handler(MessageType::Text, counting_handler(first.clone()));
        f.router.register_handler(MessageType::Text, counting_handler(second.clone()));

        f.router.receive(f.inbound(MessageType::Text, None)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_processed_once() {
        let f = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        f.router.register_handler(MessageType::Text, counting_handler(count.clone()));

        let message = f.inbound(MessageType::Text, None);
        assert_eq!(f.router.receive(message.clone()).await, Some(MessageStatus::Processed));
        assert_eq!(f.router.receive(message).await, Some(MessageStatus::Processed));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_misaddressed_message_ignored() {
        let f = fixture();
        let mut message = f.inbound(MessageType::Text, None);
        message.receiver_id = Uuid::new_v4();
        let id = message.id;
        assert_eq!(f.router.receive(message).await, None);
        assert!(f.router.inbox_message(id).await.is_none());
    }

    #[tokio::test]
    async fn test_deliver_queued_in_creation_order() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.router.register_handler(
            MessageType::Command,
            handler_fn(move |m| {
                sink.lock().unwrap().push(m.payload["n"].as_i64().unwrap());
                Ok(())
            }),
        );

        let base = Utc::now();
        let mut batch = Vec::new();
        for n in [3i64, 1, 2] {
            let mut m = f.inbound(MessageType::Command, None);
            m.payload = json!({ "n": n });
            m.created_at = base + Duration::milliseconds(n);
            batch.push(m);
        }
        // Not for us, or not queued: filtered out
        let mut foreign = f.inbound(MessageType::Command, None);
        foreign.receiver_id = Uuid::new_v4();
        foreign.payload = json!({ "n": 99 });
        batch.push(foreign);
        let mut stale = f.inbound(MessageType::Command, None);
        stale.status = MessageStatus::Processed;
        stale.payload = json!({ "n": 98 });
        batch.push(stale);

        let outcomes = f.router.deliver_queued(batch).await;
        assert_eq!(outcomes.len(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_send_applies_default_ttl() {
        let f = fixture();
        let before = Utc::now();
        let m = f.router.send(f.peer, MessageType::Text, json!({"t": "hi"}), None).await;
        assert_eq!(m.status, MessageStatus::Queued);
        assert_eq!(m.sender_id, f.local);
        let expires = m.expires_at.unwrap();
        assert!(expires >= before + Duration::seconds(300));

        let custom = f
            .router
            .send(f.peer, MessageType::Text, json!({}), Some(Duration::seconds(5)))
            .await;
        assert!(custom.expires_at.unwrap() < expires);
    }

    #[tokio::test]
    async fn test_pending_outbox_and_mark_sent() {
        let f = fixture();
        let first = f.router.send(f.peer, MessageType::Text, json!(1), None).await;
        let second = f.router.send(f.peer, MessageType::Text, json!(2), None).await;

        let pending: Vec<Uuid> = f.router.pending_outbox().await.iter().map(|m| m.id).collect();
        assert_eq!(pending, vec![first.id, second.id]);

        assert!(f.router.mark_sent(first.id).await);
        assert!(!f.router.mark_sent(first.id).await);
        assert!(!f.router.mark_sent(Uuid::new_v4()).await);
        let pending: Vec<Uuid> = f.router.pending_outbox().await.iter().map(|m| m.id).collect();
        assert_eq!(pending, vec![second.id]);
        assert_eq!(
            f.router.outbox_message(first.id).await.unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[tokio::test]
    async fn test_mark_sent_after_expiry_expires() {
        let f = fixture();
        let m = f
            .router
            .send(f.peer, MessageType::Text, json!({}), Some(Duration::seconds(-1)))
            .await;
        assert!(f.router.pending_outbox().await.is_empty());
        assert!(!f.router.mark_sent(m.id).await);
        assert_eq!(f.router.outbox_message(m.id).await.unwrap().status, MessageStatus::Expired);
    }

    #[tokio::test]
    async fn test_cleanup_expired_sweeps_both_boxes() {
        let f = fixture();
        let out = f.router.send(f.peer, MessageType::Text, json!({}), Some(Duration::seconds(10))).await;
        let delivered = f.router.send(f.peer, MessageType::Text, json!({}), Some(Duration::seconds(10))).await;
        f.router.mark_sent(delivered.id).await;
        let fresh = f.router.send(f.peer, MessageType::Text, json!({}), Some(Duration::hours(1))).await;

        let later = Utc::now() + Duration::seconds(60);
        assert_eq!(f.router.cleanup_expired_at(later).await, 2);
        assert_eq!(f.router.outbox_message(out.id).await.unwrap().status, MessageStatus::Expired);
        assert_eq!(f.router.outbox_message(delivered.id).await.unwrap().status, MessageStatus::Expired);
        assert_eq!(f.router.outbox_message(fresh.id).await.unwrap().status, MessageStatus::Queued);
    }

    #[tokio::test]
    async fn test_purge_never_removes_non_terminal() {
        let f = fixture();
        f.router.register_handler(MessageType::Text, handler_fn(|_m| Ok(())));
        let queued = f.router.send(f.peer, MessageType::Text, json!({}), Some(Duration::days(365))).await;
        let inbound = f.inbound(MessageType::Text, None);
        let inbound_id = inbound.id;
        f.router.receive(inbound).await;

        let far_future = Utc::now() + Duration::days(30);
        assert_eq!(f.router.purge_at(Duration::hours(1), far_future).await, 1);
        assert!(f.router.outbox_message(queued.id).await.is_some());
        assert!(f.router.inbox_message(inbound_id).await.is_none());
    }

    struct GatedHandler {
        started: Arc<tokio::sync::Notify>,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl MessageHandler for GatedHandler {
        async fn handle(&self, _message: &PeerMessage) -> Result<()> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sweep_during_handler_keeps_expired() {
        let f = fixture();
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        f.router.register_handler(
            MessageType::Command,
            Arc::new(GatedHandler {
                started: started.clone(),
                release: release.clone(),
            }),
        );

        let message = f.inbound(MessageType::Command, Some(Duration::seconds(30)));
        let id = message.id;
        let (status, swept) = tokio::join!(f.router.receive(message), async {
            started.notified().await;
            let swept = f.router.cleanup_expired_at(Utc::now() + Duration::seconds(60)).await;
            release.notify_one();
            swept
        });

        assert_eq!(swept, 1);
        assert_eq!(status, Some(MessageStatus::Expired));
        let stored = f.router.inbox_message(id).await.unwrap();
        assert_eq!(stored.status, MessageStatus::Expired);
        assert!(stored.processed_at.is_none());
    }
}
