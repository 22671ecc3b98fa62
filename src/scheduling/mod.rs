// Capability-aware task scheduling
//
// Each device keeps its own queue of work items and a worker that pulls the
// ones it is able to run.

pub mod queue;
pub mod worker;

pub use queue::{QueueStats, Task, TaskPriority, TaskQueue, TaskStatus};
pub use worker::{TaskExecutor, WorkOutcome, Worker};
