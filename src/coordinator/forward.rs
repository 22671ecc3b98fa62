// Cross-device task forwarding
//
// A task the local device cannot run is assigned to a capable peer in the
// local queue and shipped to it as a `command` message. The peer enqueues
// it in its own queue, runs it, and answers with a `task-result` message
// that settles the original task. There is never a shared queue.

use crate::messaging::{MessageHandler, PeerMessage};
use crate::scheduling::{Task, TaskPriority, TaskQueue, TaskStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Payload of a `command` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandPayload {
    Task(ForwardedTask),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardedTask {
    /// Task id in the sender's queue
    pub request_id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub payload: Value,
    pub required_capabilities: Vec<String>,
    pub priority: TaskPriority,
    pub deadline: Option<DateTime<Utc>>,
}

impl ForwardedTask {
    pub fn from_task(task: &Task) -> Self {
        Self {
            request_id: task.id,
            task_type: task.task_type.clone(),
            payload: task.payload.clone(),
            required_capabilities: task.required_capabilities.clone(),
            priority: task.priority,
            deadline: task.deadline,
        }
    }
}

/// Payload of a `task-result` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub request_id: Uuid,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Where a task accepted from a peer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    pub device_id: Uuid,
    pub request_id: Uuid,
}

/// Local task id → origin, for tasks accepted from peers.
pub type InboundLedger = Arc<DashMap<Uuid, Origin>>;

/// Enqueues tasks forwarded by peers
pub struct ForwardedTaskHandler {
    queue: Arc<TaskQueue>,
    inbound: InboundLedger,
}

impl ForwardedTaskHandler {
    pub fn new(queue: Arc<TaskQueue>, inbound: InboundLedger) -> Self {
        Self { queue, inbound }
    }
}

#[async_trait]
impl MessageHandler for ForwardedTaskHandler {
    async fn handle(&self, message: &PeerMessage) -> Result<()> {
        let command: CommandPayload = serde_json::from_value(message.payload.clone())
            .context("unsupported command payload")?;
        let CommandPayload::Task(forwarded) = command;

        let task = self
            .queue
            .enqueue(
                forwarded.task_type,
                forwarded.payload,
                forwarded.required_capabilities,
                forwarded.priority,
                forwarded.deadline,
            )
            .await;
        self.inbound.insert(
            task.id,
            Origin {
                device_id: message.sender_id,
                request_id: forwarded.request_id,
            },
        );
        info!(
            task_id = %task.id,
            from = %message.sender_id,
            request_id = %forwarded.request_id,
            "Accepted forwarded task"
        );
        Ok(())
    }
}

/// Settles forwarded tasks when the peer reports back
pub struct TaskResultHandler {
    queue: Arc<TaskQueue>,
    /// Task id → forwarding message id, shared with the coordinator
    outbound: Arc<DashMap<Uuid, Uuid>>,
}

impl TaskResultHandler {
    pub fn new(queue: Arc<TaskQueue>, outbound: Arc<DashMap<Uuid, Uuid>>) -> Self {
        Self { queue, outbound }
    }
}

#[async_trait]
impl MessageHandler for TaskResultHandler {
    async fn handle(&self, message: &PeerMessage) -> Result<()> {
        let report: TaskResultPayload = serde_json::from_value(message.payload.clone())
            .context("malformed task-result payload")?;

        let task = self
            .queue
            .get(report.request_id)
            .await
            .with_context(|| format!("unknown task {}", report.request_id))?;
        if task.assigned_device != Some(message.sender_id) {
            anyhow::bail!(
                "task {} is not assigned to {}",
                report.request_id,
                message.sender_id
            );
        }
        self.outbound.remove(&report.request_id);

        match report.status {
            TaskStatus::Completed => {
                self.queue
                    .mark_completed(report.request_id, report.result.unwrap_or(Value::Null))
                    .await;
            }
            TaskStatus::Failed | TaskStatus::Cancelled => {
                let error = report
                    .error
                    .unwrap_or_else(|| format!("peer reported {}", report.status.as_str()));
                self.queue.mark_failed(report.request_id, &error).await;
            }
            other => anyhow::bail!("non-terminal status '{}' in task result", other.as_str()),
        }
        Ok(())
    }
}
