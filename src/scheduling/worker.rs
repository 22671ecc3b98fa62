// Worker loop - drains the local queue through a TaskExecutor
//
// Execution is an explicit request/response call: the executor returns the
// task result (or an error) and the worker records it. A deadline becomes a
// timeout around that call.

use crate::device::DeviceRegistry;
use crate::scheduling::queue::{Task, TaskQueue, TaskStatus};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Runs one task to completion
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<Value>;
}

/// What happened to the task a worker picked up
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    Completed(Uuid),
    /// Execution failed; carries the status the queue moved the task to
    Failed { task_id: Uuid, status: Option<TaskStatus> },
    /// Finished, but the task was cancelled meanwhile so the result was dropped
    Discarded(Uuid),
}

/// Pulls work matching the local device's capabilities
pub struct Worker {
    queue: Arc<TaskQueue>,
    registry: DeviceRegistry,
    executor: Arc<dyn TaskExecutor>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(queue: Arc<TaskQueue>, registry: DeviceRegistry, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            queue,
            registry,
            executor,
            running: Arc::new(AtomicBool::new(false)),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Claim and execute at most one task.
    pub async fn run_once(&self) -> Option<WorkOutcome> {
        let local = self.registry.local().await;
        let task = self.queue.claim_next(local.id, &local.capabilities).await?;
        self.queue.mark_running(task.id).await;
        info!(task_id = %task.id, task_type = %task.task_type, "Executing task");

        let outcome = match self.execute_bounded(&task).await {
            Ok(result) => {
                if self.queue.mark_completed(task.id, result).await {
                    WorkOutcome::Completed(task.id)
                } else {
                    warn!(task_id = %task.id, "Task finished after cancellation, result dropped");
                    WorkOutcome::Discarded(task.id)
                }
            }
            Err(e) => {
                error!(task_id = %task.id, "Task execution failed: {}", e);
                let status = self.queue.mark_failed(task.id, &e.to_string()).await;
                WorkOutcome::Failed {
                    task_id: task.id,
                    status,
                }
            }
        };
        Some(outcome)
    }

    async fn execute_bounded(&self, task: &Task) -> Result<Value> {
        let Some(deadline) = task.deadline else {
            return self.executor.execute(task).await;
        };
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        match tokio::time::timeout(remaining, self.executor.execute(task)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("deadline exceeded after {:?}", remaining),
        }
    }

    /// Poll until `stop()` is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("Task worker started");

        while self.running.load(Ordering::SeqCst) {
            if self.run_once().await.is_none() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        info!("Task worker stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
