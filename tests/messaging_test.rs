// Integration tests for the peer message router: expiry, ordering,
// failure capture and retention.

use chrono::{Duration, Utc};
use devicemesh::messaging::{handler_fn, MessageStatus, MessageType, PeerMessage, PeerMessageRouter};
use serde_json::json;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

struct Pair {
    workspace_id: Uuid,
    local: Uuid,
    peer: Uuid,
    router: PeerMessageRouter,
}

fn pair() -> Pair {
    let workspace_id = Uuid::new_v4();
    let local = Uuid::new_v4();
    Pair {
        workspace_id,
        local,
        peer: Uuid::new_v4(),
        router: PeerMessageRouter::new(workspace_id, local, Duration::seconds(300)),
    }
}

impl Pair {
    fn inbound(&self, message_type: MessageType, expires_in: Duration) -> PeerMessage {
        PeerMessage::new(
            self.workspace_id,
            self.peer,
            self.local,
            message_type,
            json!({}),
            Some(Utc::now() + expires_in),
        )
    }
}

#[tokio::test]
async fn test_expired_message_never_reaches_handler() {
    let p = pair();
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    p.router.register_handler(
        MessageType::Text,
        handler_fn(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        }),
    );

    let stale = p.inbound(MessageType::Text, Duration::seconds(-1));
    let id = stale.id;
    assert_eq!(p.router.receive(stale).await, Some(MessageStatus::Expired));
    assert_eq!(*calls.lock().unwrap(), 0);
    assert_eq!(p.router.inbox_message(id).await.unwrap().status, MessageStatus::Expired);
}

#[tokio::test]
async fn test_deliver_queued_in_creation_order() {
    let p = pair();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    p.router.register_handler(
        MessageType::Notification,
        handler_fn(move |m| {
            sink.lock().unwrap().push(m.id);
            Ok(())
        }),
    );

    let base = Utc::now();
    let mut batch = Vec::new();
    for offset in [3, 1, 4, 2, 0] {
        let mut m = p.inbound(MessageType::Notification, Duration::minutes(5));
        m.created_at = base + Duration::milliseconds(offset);
        batch.push(m);
    }
    let mut expected = batch.clone();
    expected.sort_by_key(|m| m.created_at);
    let expected: Vec<Uuid> = expected.iter().map(|m| m.id).collect();

    let outcomes = p.router.deliver_queued(batch).await;
    assert!(outcomes.iter().all(|(_, s)| *s == MessageStatus::Processed));
    assert_eq!(*seen.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_handler_failure_recorded_not_propagated() {
    let p = pair();
    p.router.register_handler(
        MessageType::Command,
        handler_fn(|_| Err(anyhow::anyhow!("device busy"))),
    );

    let m = p.inbound(MessageType::Command, Duration::minutes(5));
    let id = m.id;
    assert_eq!(p.router.receive(m).await, Some(MessageStatus::Failed));
    let stored = p.router.inbox_message(id).await.unwrap();
    assert!(stored.error.unwrap().contains("device busy"));

    // Missing handler is a failure too, not a crash
    let orphan = p.inbound(MessageType::TtsRequest, Duration::minutes(5));
    assert_eq!(p.router.receive(orphan).await, Some(MessageStatus::Failed));
}

#[tokio::test]
async fn test_duplicate_delivery_processed_once() {
    let p = pair();
    let calls = Arc::new(Mutex::new(0));
    let counter = calls.clone();
    p.router.register_handler(
        MessageType::Text,
        handler_fn(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        }),
    );

    let m = p.inbound(MessageType::Text, Duration::minutes(5));
    assert_eq!(p.router.receive(m.clone()).await, Some(MessageStatus::Processed));
    assert_eq!(p.router.receive(m).await, Some(MessageStatus::Processed));
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_purge_never_removes_live_messages() {
    let p = pair();
    let queued = p.router.send(p.peer, MessageType::Text, json!({}), Some(Duration::days(30))).await;
    let delivered = p.router.send(p.peer, MessageType::Text, json!({}), Some(Duration::days(30))).await;
    assert!(p.router.mark_sent(delivered.id).await);
    let lapsed = p.router.send(p.peer, MessageType::Text, json!({}), Some(Duration::seconds(1))).await;

    let later = Utc::now() + Duration::days(2);
    assert_eq!(p.router.cleanup_expired_at(later).await, 1);
    assert_eq!(p.router.purge_at(Duration::hours(1), later).await, 1);

    assert!(p.router.outbox_message(queued.id).await.is_some());
    assert!(p.router.outbox_message(delivered.id).await.is_some());
    assert!(p.router.outbox_message(lapsed.id).await.is_none());
}
