// Task queue - pending and in-flight work matched to capable devices
//
// Each device owns exactly one TaskQueue. Work crosses devices only as
// forwarded PeerMessages, so the only race to guard against is two local
// pollers claiming the same task; `assign` is a check-and-set under the
// queue lock.

use crate::config::constants::MAX_TASK_RETRIES;
use crate::device::{has_capabilities, CapabilitySet};
use crate::metrics;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Task status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Task priority. Declared low → urgent so that `Ord` ranks urgent highest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// A unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Type tag selecting the executor, e.g. "summarize" or "speak"
    #[serde(rename = "type")]
    pub task_type: String,
    /// Opaque to the queue
    pub payload: Value,
    pub required_capabilities: Vec<String>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_device: Option<Uuid>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Enqueue order, breaks ties between equal timestamps
    #[serde(default)]
    pub sequence: u64,
}

impl Task {
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now > d).unwrap_or(false)
    }
}

/// Per-status counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Default)]
struct QueueState {
    tasks: HashMap<Uuid, Task>,
    next_sequence: u64,
}

impl QueueState {
    fn pending_sorted(&self) -> Vec<&Task> {
        let mut pending: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        // Urgent first, then creation order
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.sequence.cmp(&b.sequence))
        });
        pending
    }

    /// Check-and-set; the caller holds the queue lock.
    fn assign(&mut self, task_id: Uuid, device_id: Uuid, caps: &CapabilitySet) -> bool {
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return false;
        };
        if task.status != TaskStatus::Pending {
            return false;
        }
        if !has_capabilities(caps, &task.required_capabilities) {
            return false;
        }
        task.status = TaskStatus::Assigned;
        task.assigned_device = Some(device_id);
        task.updated_at = Utc::now();
        metrics::record_task(TaskStatus::Assigned);
        true
    }

    fn fail(&mut self, task_id: Uuid, error: &str, now: DateTime<Utc>) -> Option<TaskStatus> {
        let task = self.tasks.get_mut(&task_id)?;
        if task.status.is_terminal() {
            return None;
        }

        task.retry_count += 1;
        task.error = Some(error.to_string());
        task.updated_at = now;

        if task.retry_count < MAX_TASK_RETRIES {
            // Back into the shared pool, not pinned to the device that failed
            task.status = TaskStatus::Pending;
            task.assigned_device = None;
            task.started_at = None;
            warn!(
                task_id = %task_id,
                retry = task.retry_count,
                error,
                "Task failed, returning to pending pool"
            );
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            warn!(
                task_id = %task_id,
                retries = task.retry_count,
                error,
                "Task permanently failed"
            );
        }
        metrics::record_task(task.status);
        Some(task.status)
    }
}

/// In-memory task queue for one device
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add work to the pool. Always succeeds; the task starts `pending`.
    pub async fn enqueue(
        &self,
        task_type: impl Into<String>,
        payload: Value,
        required_capabilities: Vec<String>,
        priority: TaskPriority,
        deadline: Option<DateTime<Utc>>,
    ) -> Task {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let task = Task {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            payload,
            required_capabilities,
            priority,
            status: TaskStatus::Pending,
            assigned_device: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            deadline,
            retry_count: 0,
            sequence,
        };
        state.tasks.insert(task.id, task.clone());
        metrics::record_task(TaskStatus::Pending);
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = ?task.priority,
            "Enqueued task"
        );
        task
    }

    /// Pending tasks, urgent first, ties by creation order.
    pub async fn pending_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        state.pending_sorted().into_iter().cloned().collect()
    }

    /// Hand a pending task to `device_id` if it has every required capability.
    /// Returns false without mutation otherwise.
    pub async fn assign(&self, task_id: Uuid, device_id: Uuid, device_capabilities: &CapabilitySet) -> bool {
        let mut state = self.state.lock().await;
        state.assign(task_id, device_id, device_capabilities)
    }

    /// Claim the highest-priority pending task this device can run.
    ///
    /// The scan and the assignment happen under one lock, so two pollers on
    /// the same device never receive the same task.
    pub async fn claim_next(&self, local_device_id: Uuid, local_capabilities: &CapabilitySet) -> Option<Task> {
        let mut state = self.state.lock().await;
        let candidates: Vec<Uuid> = state.pending_sorted().iter().map(|t| t.id).collect();
        for task_id in candidates {
            if state.assign(task_id, local_device_id, local_capabilities) {
                debug!(task_id = %task_id, device_id = %local_device_id, "Claimed task");
                return state.tasks.get(&task_id).cloned();
            }
        }
        None
    }

    /// `assigned` → `running`. No-op otherwise.
    pub async fn mark_running(&self, task_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Assigned => {
                let now = Utc::now();
                task.status = TaskStatus::Running;
                task.started_at = Some(now);
                task.updated_at = now;
                metrics::record_task(TaskStatus::Running);
                true
            }
            _ => false,
        }
    }

    /// `running` | `assigned` → `completed`. Returns false for pending,
    /// terminal or unknown tasks.
    pub async fn mark_completed(&self, task_id: Uuid, result: Value) -> bool {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&task_id) {
            Some(task) if matches!(task.status, TaskStatus::Running | TaskStatus::Assigned) => {
                let now = Utc::now();
                task.status = TaskStatus::Completed;
                task.result = Some(result);
                task.completed_at = Some(now);
                task.updated_at = now;
                metrics::record_task(TaskStatus::Completed);
                info!(task_id = %task_id, "Task completed");
                true
            }
            _ => false,
        }
    }

    /// Record a failure. Below the retry ceiling the task goes back to
    /// `pending` with its assignment cleared; at the ceiling it is terminally
    /// `failed`. Returns the new status, or None for unknown/terminal tasks.
    pub async fn mark_failed(&self, task_id: Uuid, error: &str) -> Option<TaskStatus> {
        let mut state = self.state.lock().await;
        state.fail(task_id, error, Utc::now())
    }

    /// Any non-terminal task → `cancelled`. Advisory: a running executor is
    /// not preempted, it just finds its completion rejected.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&task_id) {
            Some(task) if !task.status.is_terminal() => {
                let now = Utc::now();
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(now);
                task.updated_at = now;
                metrics::record_task(TaskStatus::Cancelled);
                info!(task_id = %task_id, "Task cancelled");
                true
            }
            _ => false,
        }
    }

    /// Fail every non-terminal task whose deadline has passed. Each one
    /// consumes a retry like any other failure. Returns the affected ids.
    pub async fn check_deadlines_at(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut state = self.state.lock().await;
        let overdue: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal() && t.is_past_deadline(now))
            .map(|t| t.id)
            .collect();
        for task_id in &overdue {
            state.fail(*task_id, "deadline exceeded", now);
        }
        overdue
    }

    pub async fn check_deadlines(&self) -> Vec<Uuid> {
        self.check_deadlines_at(Utc::now()).await
    }

    /// Drop terminal tasks that finished more than `older_than` ago.
    /// Non-terminal tasks are never removed.
    pub async fn cleanup_at(&self, older_than: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - older_than;
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, t| {
            !(t.status.is_terminal() && t.completed_at.unwrap_or(t.updated_at) < cutoff)
        });
        let removed = before - state.tasks.len();
        if removed > 0 {
            debug!(removed, "Purged terminal tasks");
        }
        removed
    }

    pub async fn cleanup(&self, older_than: Duration) -> usize {
        self.cleanup_at(older_than, Utc::now()).await
    }

    pub async fn get(&self, task_id: Uuid) -> Option<Task> {
        let state = self.state.lock().await;
        state.tasks.get(&task_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}
