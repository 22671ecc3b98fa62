// Coordinator - one device's view of the mesh
//
// Owns the registry, task queue and message router for a single device and
// drives them against the relay. Every relay call fails open: an unreachable
// relay costs peer visibility and cross-device delivery, never local work.

pub mod forward;

pub use forward::{
    CommandPayload, ForwardedTask, ForwardedTaskHandler, InboundLedger, Origin, TaskResultHandler,
    TaskResultPayload,
};

use crate::config::Config;
use crate::device::{Device, DeviceRegistry};
use crate::errors::CoordError;
use crate::messaging::{MessageStatus, MessageType, PeerMessage, PeerMessageRouter};
use crate::metrics;
use crate::relay::{HeartbeatRecord, LeaderGate, Relay};
use crate::responder::{DeviceResponderPolicy, InteractionKind};
use crate::scheduling::{Task, TaskPriority, TaskQueue, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tunables that do not belong to any single component
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub user_id: String,
    pub tick_interval: std::time::Duration,
    pub lock_lease: Duration,
    pub task_retention: Duration,
    pub message_retention: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            user_id: config.workspace.user_id.clone(),
            tick_interval: config.heartbeat_interval(),
            lock_lease: config.lock_lease(),
            task_retention: Duration::hours(config.tasks.retention_hours),
            message_retention: Duration::hours(config.messages.retention_hours),
        }
    }
}

/// Where submitted work ended up
#[derive(Debug, Clone)]
pub enum Submission {
    /// Queued for the local worker
    Local(Task),
    /// Assigned to a peer and shipped as a `command` message
    Forwarded { task: Task, device: Device, message: PeerMessage },
    /// Nobody online can run it yet; it waits in the local queue
    Pending(Task),
}

impl Submission {
    pub fn task_id(&self) -> Uuid {
        match self {
            Submission::Local(task) | Submission::Pending(task) => task.id,
            Submission::Forwarded { task, .. } => task.id,
        }
    }
}

/// Counters from one maintenance round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub peers_discovered: usize,
    pub messages_received: usize,
    pub results_reported: usize,
    pub tasks_forwarded: usize,
    pub messages_sent: usize,
    pub deadlines_missed: usize,
    pub messages_expired: usize,
    pub forwards_lapsed: usize,
    pub tasks_purged: usize,
    pub messages_purged: usize,
}

pub struct Coordinator {
    registry: DeviceRegistry,
    queue: Arc<TaskQueue>,
    router: Arc<PeerMessageRouter>,
    policy: DeviceResponderPolicy,
    relay: Option<Arc<dyn Relay>>,
    gate: Option<LeaderGate>,
    options: CoordinatorOptions,
    /// Tasks this device accepted from peers
    inbound: InboundLedger,
    /// Tasks this device forwarded: task id → command message id
    outbound: Arc<DashMap<Uuid, Uuid>>,
}

impl Coordinator {
    /// Wire the components together and install the `command` and
    /// `task-result` handlers on the router.
    pub fn new(
        registry: DeviceRegistry,
        queue: Arc<TaskQueue>,
        router: Arc<PeerMessageRouter>,
        policy: DeviceResponderPolicy,
        options: CoordinatorOptions,
    ) -> Self {
        let inbound: InboundLedger = Arc::new(DashMap::new());
        let outbound = Arc::new(DashMap::new());
        router.register_handler(
            MessageType::Command,
            Arc::new(ForwardedTaskHandler::new(queue.clone(), inbound.clone())),
        );
        router.register_handler(
            MessageType::TaskResult,
            Arc::new(TaskResultHandler::new(queue.clone(), outbound.clone())),
        );

        Self {
            registry,
            queue,
            router,
            policy,
            relay: None,
            gate: None,
            options,
            inbound,
            outbound,
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.gate = Some(LeaderGate::new(
            relay.clone(),
            self.router.workspace_id(),
            self.registry.local_id(),
            self.options.lock_lease,
        ));
        self.relay = Some(relay);
        self
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn router(&self) -> &Arc<PeerMessageRouter> {
        &self.router
    }

    pub fn local_id(&self) -> Uuid {
        self.registry.local_id()
    }

    /// Route new work: locally when this device is capable, otherwise to the
    /// preferred online peer that is, otherwise leave it pending.
    pub async fn submit(
        &self,
        task_type: impl Into<String>,
        payload: Value,
        required_capabilities: Vec<String>,
        priority: TaskPriority,
        deadline: Option<DateTime<Utc>>,
    ) -> Submission {
        let task = self
            .queue
            .enqueue(task_type, payload, required_capabilities, priority, deadline)
            .await;

        let local = self.registry.local().await;
        if local.can_run(&task.required_capabilities) {
            return Submission::Local(task);
        }

        match self.forward(&task).await {
            Some((task, device, message)) => Submission::Forwarded {
                task,
                device,
                message,
            },
            None => {
                info!(
                    task_id = %task.id,
                    required = ?task.required_capabilities,
                    "No online device can run task, leaving it pending"
                );
                Submission::Pending(task)
            }
        }
    }

    /// Best online peer for `required`: lowest priority number, then id.
    pub async fn best_peer_for(&self, required: &[String]) -> Option<Device> {
        self.registry
            .online()
            .await
            .into_iter()
            .filter(|d| !d.is_local && d.can_run(required))
            .min_by_key(|d| (d.priority, d.id))
    }

    async fn forward(&self, task: &Task) -> Option<(Task, Device, PeerMessage)> {
        let device = self.best_peer_for(&task.required_capabilities).await?;
        if !self.queue.assign(task.id, device.id, &device.capabilities).await {
            return None;
        }

        let payload = match serde_json::to_value(CommandPayload::Task(ForwardedTask::from_task(task))) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(task_id = %task.id, "Cannot encode forwarded task: {}", e);
                self.queue.mark_failed(task.id, &e.to_string()).await;
                return None;
            }
        };
        let message = self
            .router
            .send(device.id, MessageType::Command, payload, None)
            .await;
        self.outbound.insert(task.id, message.id);
        info!(
            task_id = %task.id,
            device_id = %device.id,
            device = %device.name,
            "Forwarded task to peer"
        );

        let task = self.queue.get(task.id).await?;
        Some((task, device, message))
    }

    /// Decide whether this device answers an interaction. When `resource` is
    /// given and a relay is configured, the elected device must also win the
    /// leader lock on it.
    pub async fn should_respond(&self, kind: InteractionKind, resource: Option<&str>) -> bool {
        let decision = self.policy.evaluate_registry(kind, &self.registry).await;
        if !decision.is_this_device(self.local_id()) {
            debug!(?decision, "Another device responds");
            return false;
        }
        match (resource, &self.gate) {
            (Some(resource), Some(gate)) => gate.acquire(resource).await.may_proceed(),
            _ => true,
        }
    }

    /// Release a lock taken by `should_respond`.
    pub async fn finish_response(&self, resource: &str) {
        if let Some(gate) = &self.gate {
            gate.release(resource).await;
        }
    }

    pub async fn heartbeat_record(&self) -> HeartbeatRecord {
        let local = self.registry.local().await;
        HeartbeatRecord {
            id: local.id,
            user_id: self.options.user_id.clone(),
            name: local.name,
            platform: local.platform,
            last_heartbeat: Utc::now(),
            workspace_ids: vec![self.router.workspace_id()],
            class: Some(local.class),
            capabilities: Some(local.capabilities.into_iter().collect()),
            priority: Some(local.priority),
        }
    }

    /// One maintenance round.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        let now = Utc::now();

        if let Some(relay) = &self.relay {
            report.peers_discovered = self.exchange_heartbeats(relay.as_ref()).await;
            report.messages_received = self.pull_inbound(relay.as_ref()).await;
        }

        report.results_reported = self.report_results().await;
        report.tasks_forwarded = self.forward_stranded().await;

        if let Some(relay) = &self.relay {
            report.messages_sent = self.push_outbound(relay.as_ref()).await;
        }

        report.deadlines_missed = self.queue.check_deadlines_at(now).await.len();
        report.messages_expired = self.router.cleanup_expired_at(now).await;
        report.forwards_lapsed = self.settle_lapsed_forwards().await;
        report.tasks_purged = self.queue.cleanup_at(self.options.task_retention, now).await;
        report.messages_purged = self.router.purge_at(self.options.message_retention, now).await;

        debug!(?report, "Coordinator tick");
        report
    }

    /// Tick every interval until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.options.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            device_id = %self.local_id(),
            workspace_id = %self.router.workspace_id(),
            "Coordinator started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        info!("Coordinator stopped");
    }

    async fn exchange_heartbeats(&self, relay: &dyn Relay) -> usize {
        self.registry.touch(self.local_id()).await;
        let record = self.heartbeat_record().await;
        if let Err(e) = relay.upsert_heartbeat(&record).await {
            warn!("Heartbeat upsert failed, continuing without relay: {}", e);
            metrics::record_fail_open("heartbeat");
        }

        let records = match relay.list_heartbeats(self.router.workspace_id()).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Cannot list peer heartbeats: {}", e);
                metrics::record_fail_open("heartbeat");
                return 0;
            }
        };
        let mut discovered = 0;
        for record in &records {
            if self.registry.observe_heartbeat(record).await {
                discovered += 1;
            }
        }
        discovered
    }

    async fn pull_inbound(&self, relay: &dyn Relay) -> usize {
        let workspace_id = self.router.workspace_id();
        match relay.pull_messages(workspace_id, self.local_id()).await {
            Ok(messages) => {
                for message in &messages {
                    self.registry.touch(message.sender_id).await;
                }
                self.router.deliver_queued(messages).await.len()
            }
            Err(e) => {
                warn!("Cannot pull messages from relay: {}", e);
                metrics::record_fail_open("pull");
                0
            }
        }
    }

    async fn push_outbound(&self, relay: &dyn Relay) -> usize {
        let mut sent = 0;
        for message in self.router.pending_outbox().await {
            if let Err(e) = relay.push_message(&message).await {
                warn!(message_id = %message.id, "Cannot push message, will retry: {}", e);
                metrics::record_fail_open("push");
                break;
            }
            if self.router.mark_sent(message.id).await {
                sent += 1;
            }
        }
        sent
    }

    /// Answer peers whose forwarded tasks reached a terminal state here.
    async fn report_results(&self) -> usize {
        let entries: Vec<(Uuid, Origin)> = self
            .inbound
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let mut reported = 0;
        for (task_id, origin) in entries {
            let Some(task) = self.queue.get(task_id).await else {
                self.inbound.remove(&task_id);
                continue;
            };
            if !task.status.is_terminal() {
                continue;
            }

            let report = TaskResultPayload {
                request_id: origin.request_id,
                status: task.status,
                result: task.result.clone(),
                error: task.error.clone(),
            };
            match serde_json::to_value(&report) {
                Ok(payload) => {
                    self.router
                        .send(origin.device_id, MessageType::TaskResult, payload, None)
                        .await;
                    reported += 1;
                }
                Err(e) => warn!(task_id = %task_id, "Cannot encode task result: {}", e),
            }
            self.inbound.remove(&task_id);
        }
        reported
    }

    /// Forward pending tasks this device cannot run once a capable peer shows up.
    async fn forward_stranded(&self) -> usize {
        let local = self.registry.local().await;
        let mut forwarded = 0;
        for task in self.queue.pending_tasks().await {
            if local.can_run(&task.required_capabilities) {
                continue;
            }
            if self.forward(&task).await.is_some() {
                forwarded += 1;
            }
        }
        forwarded
    }

    /// A forwarded task whose command expired before the relay took it
    /// counts as a failure. Once handed off, the peer owns the work and only
    /// the task deadline bounds the wait.
    async fn settle_lapsed_forwards(&self) -> usize {
        let entries: Vec<(Uuid, Uuid)> = self
            .outbound
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let mut lapsed = 0;
        for (task_id, message_id) in entries {
            let never_sent = match self.router.outbox_message(message_id).await {
                Some(message) if message.status == MessageStatus::Expired => message.delivered_at.is_none(),
                Some(_) => continue,
                None => false,
            };
            self.outbound.remove(&task_id);
            if !never_sent {
                continue;
            }
            if let Some(task) = self.queue.get(task_id).await {
                if task.status == TaskStatus::Assigned {
                    self.queue
                        .mark_failed(task_id, "forwarded task expired before hand-off")
                        .await;
                    lapsed += 1;
                }
            }
        }
        lapsed
    }
}

/// Build a coordinator for `local` from configuration.
pub fn from_config(config: &Config, local: Device, workspace_id: Uuid) -> Result<Coordinator, CoordError> {
    let registry = DeviceRegistry::new(local);
    let router = Arc::new(PeerMessageRouter::new(
        workspace_id,
        registry.local_id(),
        config.message_ttl(),
    ));
    Ok(Coordinator::new(
        registry,
        Arc::new(TaskQueue::new()),
        router,
        config.responder_policy()?,
        CoordinatorOptions::from_config(config),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{capability_set, DeviceClass};
    use crate::relay::{LockOutcome, MemoryRelay};
    use crate::responder::ResponderMode;
    use serde_json::json;

    fn device(class: DeviceClass, caps: &[&str]) -> Device {
        Device::new(Uuid::new_v4(), "dev", class, "linux", capability_set(caps.iter().copied()))
    }

    fn coordinator(local: Device, workspace_id: Uuid) -> Coordinator {
        from_config(&Config::default(), local.as_local(), workspace_id).unwrap()
    }

    #[tokio::test]
    async fn test_submit_runs_locally_when_capable() {
        let c = coordinator(device(DeviceClass::Desktop, &["llm"]), Uuid::new_v4());
        let submission = c
            .submit("chat", json!({}), vec!["llm".into()], TaskPriority::Normal, None)
            .await;
        assert!(matches!(submission, Submission::Local(_)));
        assert_eq!(c.queue().pending_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_submit_stays_pending_without_capable_peer() {
        let c = coordinator(device(DeviceClass::Desktop, &["llm"]), Uuid::new_v4());
        let submission = c
            .submit("speak", json!({}), vec!["tts".into()], TaskPriority::Normal, None)
            .await;
        assert!(matches!(submission, Submission::Pending(_)));
        assert!(c.router().pending_outbox().await.is_empty());
    }

    #[tokio::test]
    async fn test_submit_forwards_to_preferred_peer() {
        let c = coordinator(device(DeviceClass::Cli, &[]), Uuid::new_v4());
        let mobile = device(DeviceClass::Mobile, &["tts"]).with_last_seen(Utc::now());
        let desktop = device(DeviceClass::Desktop, &["tts"]).with_last_seen(Utc::now());
        let stale = device(DeviceClass::Desktop, &["tts"])
            .with_priority(0)
            .with_last_seen(Utc::now() - Duration::seconds(600));
        c.registry().upsert(mobile).await;
        c.registry().upsert(desktop.clone()).await;
        c.registry().upsert(stale).await;

        let submission = c
            .submit("speak", json!({"text": "hi"}), vec!["tts".into()], TaskPriority::High, None)
            .await;
        let Submission::Forwarded { task, device, message } = submission else {
            panic!("expected forwarding");
        };
        assert_eq!(device.id, desktop.id);
        assert_eq!(task.status, TaskStatus::Assigned);
        assert_eq!(task.assigned_device, Some(desktop.id));
        assert_eq!(message.message_type, MessageType::Command);
        assert_eq!(message.payload["kind"], "task");
        assert_eq!(message.payload["request_id"], json!(task.id));
    }

    #[tokio::test]
    async fn test_tick_forwards_stranded_task_once_peer_appears() {
        let c = coordinator(device(DeviceClass::Cli, &[]), Uuid::new_v4());
        let submission = c
            .submit("speak", json!({}), vec!["tts".into()], TaskPriority::Normal, None)
            .await;
        assert!(matches!(submission, Submission::Pending(_)));

        c.registry()
            .upsert(device(DeviceClass::Mobile, &["tts"]).with_last_seen(Utc::now()))
            .await;
        let report = c.tick().await;
        assert_eq!(report.tasks_forwarded, 1);
        let task = c.queue().get(submission.task_id()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_tick_without_relay_keeps_outbox_queued() {
        let c = coordinator(device(DeviceClass::Cli, &[]), Uuid::new_v4());
        c.router()
            .send(Uuid::new_v4(), MessageType::Text, json!({}), None)
            .await;
        let report = c.tick().await;
        assert_eq!(report.messages_sent, 0);
        assert_eq!(c.router().pending_outbox().await.len(), 1);
    }

    #[tokio::test]
    async fn test_command_expiring_before_hand_off_is_a_failure() {
        let mut config = Config::default();
        config.messages.default_ttl_secs = 1;
        let c = from_config(&config, device(DeviceClass::Cli, &[]).as_local(), Uuid::new_v4()).unwrap();
        c.registry()
            .upsert(device(DeviceClass::Mobile, &["tts"]).with_last_seen(Utc::now()))
            .await;

        let submission = c
            .submit("speak", json!({}), vec!["tts".into()], TaskPriority::Normal, None)
            .await;
        assert!(matches!(submission, Submission::Forwarded { .. }));

        // No relay: the command never leaves the outbox
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let report = c.tick().await;
        assert_eq!(report.forwards_lapsed, 1);
        let task = c.queue().get(submission.task_id()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
    }

    #[tokio::test]
    async fn test_tick_fails_open_when_relay_down() {
        let relay = Arc::new(MemoryRelay::new());
        relay.set_available(false);
        let c = coordinator(device(DeviceClass::Desktop, &["llm"]), Uuid::new_v4())
            .with_relay(relay.clone());
        c.submit("chat", json!({}), vec!["llm".into()], TaskPriority::Normal, None)
            .await;

        let report = c.tick().await;
        assert_eq!(report.peers_discovered, 0);
        assert_eq!(c.queue().pending_tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn test_should_respond_uses_policy_and_lock() {
        let workspace_id = Uuid::new_v4();
        let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());
        let local = device(DeviceClass::Desktop, &["llm"]);
        let c = coordinator(local.clone(), workspace_id).with_relay(relay.clone());

        assert!(c.should_respond(InteractionKind::Chat, Some("chat:1")).await);

        // A peer holding the lock wins even though policy elects us
        let peer_gate = LeaderGate::new(relay, workspace_id, Uuid::new_v4(), Duration::seconds(60));
        assert_eq!(peer_gate.acquire("chat:2").await, LockOutcome::Acquired);
        assert!(!c.should_respond(InteractionKind::Chat, Some("chat:2")).await);
    }

    #[tokio::test]
    async fn test_new_installs_forwarding_handlers() {
        let c = coordinator(device(DeviceClass::Desktop, &[]), Uuid::new_v4());
        assert!(c.router().has_handler(MessageType::Command));
        assert!(c.router().has_handler(MessageType::TaskResult));
        assert!(!c.router().has_handler(MessageType::Text));
    }

    #[tokio::test]
    async fn test_finish_response_releases_lock() {
        let workspace_id = Uuid::new_v4();
        let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());
        let c = coordinator(device(DeviceClass::Desktop, &[]), workspace_id).with_relay(relay.clone());
        let peer_gate = LeaderGate::new(relay, workspace_id, Uuid::new_v4(), Duration::seconds(60));

        assert!(c.should_respond(InteractionKind::Chat, Some("chat:9")).await);
        assert_eq!(peer_gate.acquire("chat:9").await, LockOutcome::HeldElsewhere);

        c.finish_response("chat:9").await;
        assert_eq!(peer_gate.acquire("chat:9").await, LockOutcome::Acquired);
    }

    #[tokio::test]
    async fn test_should_respond_defers_to_preferred_peer() {
        let c = coordinator(device(DeviceClass::Mobile, &[]), Uuid::new_v4());
        c.registry()
            .upsert(device(DeviceClass::Desktop, &[]).with_last_seen(Utc::now()))
            .await;
        assert!(!c.should_respond(InteractionKind::Chat, None).await);
    }

    #[tokio::test]
    async fn test_manual_mode_from_policy() {
        let local = device(DeviceClass::Mobile, &[]).as_local();
        let local_id = local.id;
        let registry = DeviceRegistry::new(local);
        let router = Arc::new(PeerMessageRouter::new(Uuid::new_v4(), local_id, Duration::seconds(300)));
        let c = Coordinator::new(
            registry,
            Arc::new(TaskQueue::new()),
            router,
            DeviceResponderPolicy::new(ResponderMode::Manual { device_id: local_id }),
            CoordinatorOptions::default(),
        );
        c.registry()
            .upsert(device(DeviceClass::Desktop, &[]).with_last_seen(Utc::now()))
            .await;
        assert!(c.should_respond(InteractionKind::Chat, None).await);
    }

    #[tokio::test]
    async fn test_heartbeat_record_describes_local_device() {
        let workspace_id = Uuid::new_v4();
        let local = device(DeviceClass::Mobile, &["tts", "mic"]);
        let c = coordinator(local.clone(), workspace_id);
        let record = c.heartbeat_record().await;
        assert_eq!(record.id, local.id);
        assert_eq!(record.workspace_ids, vec![workspace_id]);
        assert_eq!(record.class, Some(DeviceClass::Mobile));
        assert_eq!(record.capabilities, Some(vec!["mic".to_string(), "tts".to_string()]));
        assert_eq!(record.priority, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let c = coordinator(device(DeviceClass::Desktop, &[]), Uuid::new_v4());
        c.run(tokio::time::sleep(std::time::Duration::from_secs(95))).await;
    }
}
