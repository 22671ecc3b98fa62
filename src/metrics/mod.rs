// Process-wide counters for task and message outcomes
//
// Counters are registered once in a private registry and rendered in the
// Prometheus text format on demand.

use crate::messaging::MessageStatus;
use crate::scheduling::TaskStatus;
use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

struct Counters {
    registry: Registry,
    tasks: IntCounterVec,
    messages: IntCounterVec,
    fail_open: IntCounterVec,
}

static COUNTERS: Lazy<Option<Counters>> = Lazy::new(|| match build() {
    Ok(counters) => Some(counters),
    Err(e) => {
        tracing::warn!("Metrics disabled: {}", e);
        None
    }
});

fn build() -> Result<Counters> {
    let registry = Registry::new_custom(Some("devicemesh".to_string()), None)
        .context("Failed to create metrics registry")?;

    let tasks = IntCounterVec::new(
        Opts::new("task_transitions_total", "Task status transitions"),
        &["status"],
    )?;
    let messages = IntCounterVec::new(
        Opts::new("message_outcomes_total", "Peer message status changes"),
        &["status"],
    )?;
    let fail_open = IntCounterVec::new(
        Opts::new("relay_fail_open_total", "Relay calls that failed open"),
        &["operation"],
    )?;

    registry.register(Box::new(tasks.clone()))?;
    registry.register(Box::new(messages.clone()))?;
    registry.register(Box::new(fail_open.clone()))?;

    Ok(Counters {
        registry,
        tasks,
        messages,
        fail_open,
    })
}

pub fn record_task(status: TaskStatus) {
    if let Some(c) = COUNTERS.as_ref() {
        c.tasks.with_label_values(&[status.as_str()]).inc();
    }
}

pub fn record_message(status: MessageStatus) {
    if let Some(c) = COUNTERS.as_ref() {
        c.messages.with_label_values(&[status.as_str()]).inc();
    }
}

pub fn record_fail_open(operation: &str) {
    if let Some(c) = COUNTERS.as_ref() {
        c.fail_open.with_label_values(&[operation]).inc();
    }
}

/// Current counters in the Prometheus text exposition format.
pub fn render() -> Result<String> {
    let Some(c) = COUNTERS.as_ref() else {
        return Ok(String::new());
    };
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&c.registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output was not UTF-8")
}
