// Peer message model - the unit exchanged between two devices

use crate::errors::CoordError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Message type tag; selects the handler on receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Text,
    TtsRequest,
    Command,
    Notification,
    TaskResult,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::TtsRequest => "tts-request",
            MessageType::Command => "command",
            MessageType::Notification => "notification",
            MessageType::TaskResult => "task-result",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = CoordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "tts-request" => Ok(MessageType::TtsRequest),
            "command" => Ok(MessageType::Command),
            "notification" => Ok(MessageType::Notification),
            "task-result" => Ok(MessageType::TaskResult),
            _ => Err(CoordError::UnknownVariant {
                field: "message type",
                value: s.to_string(),
                expected: "text, tts-request, command, notification, task-result",
            }),
        }
    }
}

/// Delivery status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Queued,
    Delivered,
    Processed,
    Failed,
    Expired,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Processed | MessageStatus::Failed | MessageStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Queued => "queued",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Processed => "processed",
            MessageStatus::Failed => "failed",
            MessageStatus::Expired => "expired",
        }
    }
}

/// A typed, TTL-bound message between two devices of one workspace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Opaque; interpreted only by the handler for `message_type`
    pub payload: Value,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PeerMessage {
    /// A fresh `queued` message.
    pub fn new(
        workspace_id: Uuid,
        sender_id: Uuid,
        receiver_id: Uuid,
        message_type: MessageType,
        payload: Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            sender_id,
            receiver_id,
            message_type,
            payload,
            status: MessageStatus::Queued,
            created_at: Utc::now(),
            delivered_at: None,
            processed_at: None,
            expires_at,
            error: None,
        }
    }

    /// Past expiry and not yet processed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status != MessageStatus::Processed
            && self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    /// Timestamp that retention is measured from.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.processed_at
            .or(self.delivered_at)
            .unwrap_or(self.created_at)
    }

    pub(crate) fn expire(&mut self) {
        self.status = MessageStatus::Expired;
        self.error = Some("expired before processing".to_string());
    }
}
