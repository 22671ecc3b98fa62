// Devicemesh - peer coordination for a multi-device assistant
// Main entry point

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use devicemesh::config::{load_config, Config};
use devicemesh::coordinator::{self, Coordinator, Submission};
use devicemesh::device::{capability_set, Device, DeviceClass, LocalIdentity};
use devicemesh::messaging::{handler_fn, MessageType};
use devicemesh::metrics;
use devicemesh::relay::{HttpRelay, MemoryRelay, Relay};
use devicemesh::responder::InteractionKind;
use devicemesh::scheduling::{Task, TaskExecutor, TaskPriority, Worker};

#[derive(Parser)]
#[command(name = "devicemesh")]
#[command(about = "Coordinate assistant devices sharing a workspace", long_about = None)]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print this device's identity, creating it on first run
    Identity,
    /// Print the effective configuration
    Config,
    /// Run two in-process devices against an in-memory relay
    Demo,
    /// Join the configured workspace and coordinate until Ctrl-C
    Run,
}

/// Echoes the task payload back as its result
struct EchoExecutor {
    device_name: String,
}

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, task: &Task) -> Result<Value> {
        Ok(json!({
            "handled_by": self.device_name,
            "type": task.task_type,
            "payload": task.payload,
        }))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "devicemesh=debug" } else { "devicemesh=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Command::Identity => {
            let config = load_config()?;
            let identity = LocalIdentity::load_or_create(config.device_class()?)?;
            println!("{}", serde_json::to_string_pretty(&identity)?);
        }
        Command::Config => {
            let config = load_config()?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Command::Demo => run_demo().await?,
        Command::Run => run_node(load_config()?).await?,
    }

    Ok(())
}

async fn run_node(config: Config) -> Result<()> {
    let workspace_id = config
        .workspace_id()?
        .context("workspace.id must be set to join a workspace")?;
    let identity = LocalIdentity::load_or_create(config.device_class()?)?;
    let mut local = identity.to_device(config.capabilities(), config.device.priority);
    if let Some(name) = &config.device.name {
        local.name = name.clone();
    }
    info!(device_id = %local.id, name = %local.name, class = %local.class, "Starting device");

    let mut node = coordinator::from_config(&config, local.clone(), workspace_id)?;
    if config.relay.enabled {
        let mut relay = HttpRelay::new(config.relay.url.clone())?;
        if let Some(token) = &config.relay.token {
            relay = relay.with_token(token.clone());
        }
        node = node.with_relay(Arc::new(relay));
    } else {
        info!("Relay disabled, running standalone");
    }

    let worker = Worker::new(
        node.queue().clone(),
        node.registry().clone(),
        Arc::new(EchoExecutor { device_name: local.name }),
    )
    .with_poll_interval(std::time::Duration::from_millis(config.tasks.worker_poll_ms));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for Ctrl-C: {}", e);
        }
    };
    tokio::select! {
        _ = node.run(shutdown) => {}
        _ = worker.run() => {}
    }
    worker.stop();

    match metrics::render() {
        Ok(snapshot) => tracing::debug!("Final counters:\n{}", snapshot),
        Err(e) => tracing::warn!("Cannot render metrics: {}", e),
    }
    Ok(())
}

fn demo_device(name: &str, class: DeviceClass, caps: &[&str]) -> Device {
    Device::new(Uuid::new_v4(), name, class, std::env::consts::OS, capability_set(caps.iter().copied()))
        .as_local()
}

async fn run_demo() -> Result<()> {
    let config = Config::default();
    let workspace_id = Uuid::new_v4();
    let relay: Arc<dyn Relay> = Arc::new(MemoryRelay::new());

    let desktop = coordinator::from_config(
        &config,
        demo_device("desktop", DeviceClass::Desktop, &["llm", "tools"]),
        workspace_id,
    )?
    .with_relay(relay.clone());
    let phone = coordinator::from_config(
        &config,
        demo_device("phone", DeviceClass::Mobile, &["tts", "mic"]),
        workspace_id,
    )?
    .with_relay(relay.clone());

    phone.router().register_handler(
        MessageType::Notification,
        handler_fn(|message| {
            info!(from = %message.sender_id, payload = %message.payload, "Phone shows notification");
            Ok(())
        }),
    );

    // Two rounds so each device sees the other's heartbeat
    for _ in 0..2 {
        desktop.tick().await;
        phone.tick().await;
    }
    info!(
        desktop_peers = desktop.registry().online().await.len(),
        phone_peers = phone.registry().online().await.len(),
        "Devices discovered each other"
    );

    let submission = desktop
        .submit(
            "speak",
            json!({"text": "Your build finished"}),
            vec!["tts".to_string()],
            TaskPriority::High,
            None,
        )
        .await;
    if let Submission::Forwarded { device, .. } = &submission {
        info!(task_id = %submission.task_id(), to = %device.name, "Desktop forwarded speech task");
    }
    desktop
        .router()
        .send(phone.local_id(), MessageType::Notification, json!({"title": "Build done"}), None)
        .await;

    desktop.tick().await;
    phone.tick().await;

    let phone_worker = Worker::new(
        phone.queue().clone(),
        phone.registry().clone(),
        Arc::new(EchoExecutor { device_name: "phone".to_string() }),
    );
    let outcome = phone_worker.run_once().await;
    info!(?outcome, "Phone worker ran");

    // Result travels back to the desktop
    phone.tick().await;
    desktop.tick().await;

    let task = desktop
        .queue()
        .get(submission.task_id())
        .await
        .context("submitted task disappeared")?;
    info!(status = task.status.as_str(), result = ?task.result, "Desktop sees task outcome");

    for (name, device) in [("desktop", &desktop), ("phone", &phone)] {
        report_responder(name, device).await;
    }

    Ok(())
}

async fn report_responder(name: &str, coordinator: &Coordinator) {
    let chat = coordinator.should_respond(InteractionKind::Chat, Some("chat:demo")).await;
    let voice = coordinator.should_respond(InteractionKind::Voice, None).await;
    info!(device = name, chat, voice, "Responder election");
    if chat {
        coordinator.finish_response("chat:demo").await;
    }
}
