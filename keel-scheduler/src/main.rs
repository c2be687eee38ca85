mod args_parse;

use std::{fs::read_to_string, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use keel_core::{DispatchPayload, DispatchSink, MemoryCatalog, PartitionTransition};
use keel_scheduler::{
    json_lines, scheduler_metrics::init_metrics, spawn_ingestion, spawn_scheduler,
    HeartbeatTable, LoadConfiguration, OperatorCommands, RolloutCoordinator, ServiceConfiguration,
};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::args_parse::Args;

// Standalone sink: every decision ends up in the log.
struct LogSink;

#[async_trait]
impl DispatchSink for LogSink {
    async fn dispatch(&self, payload: DispatchPayload) -> keel_core::Result<()> {
        let tasks: Vec<String> = payload
            .tasks
            .iter()
            .map(|t| format!("{}#{}", t.topic, t.partition))
            .collect();
        info!(
            address = %payload.broker_address,
            session = %payload.session_id,
            tasks = ?tasks,
            "dispatch"
        );
        Ok(())
    }

    async fn publish_transitions(
        &self,
        transitions: Vec<PartitionTransition>,
    ) -> keel_core::Result<()> {
        for t in transitions {
            info!(
                topic = %t.topic,
                partition = t.partition,
                status = %t.status,
                target = ?t.target_broker,
                "partition transition"
            );
        }
        Ok(())
    }

    async fn persist_rollout(&self, role: &str, version: &str) -> keel_core::Result<()> {
        info!(role = %role, version = %version, "rollout persisted");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))
        .with_context(|| format!("unable to read config file {}", args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;

    // Attempt to transform LoadConfiguration into ServiceConfiguration
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    // If `prom_exporter` is provided via command-line args, override the value from the config file
    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_exporter
        ))?;
        service_config.prom_exporter = Some(prom_address);
    }

    init_metrics(service_config.prom_exporter)?;

    let catalog = Arc::new(MemoryCatalog::with_topics(service_config.topics.clone()));
    let heartbeats = HeartbeatTable::new();

    if let Some(path) = &args.heartbeat_file {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("unable to open heartbeat file {}", path))?;
        let reader = tokio::io::BufReader::new(file);
        spawn_ingestion(heartbeats.clone(), json_lines(reader));
        info!(path = %path, "ingesting heartbeats from file");
    }

    info!(
        strategy = ?service_config.strategy,
        topics = service_config.topics.len(),
        roles = service_config.roles.len(),
        "starting keel scheduler"
    );

    let interval = service_config.tick_interval;
    let coordinator = RolloutCoordinator::new(
        service_config,
        catalog,
        Arc::new(LogSink),
        heartbeats,
        OperatorCommands::new(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = spawn_scheduler(coordinator, interval, shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("unable to listen for the shutdown signal")?;
    info!("shutdown requested");
    shutdown_tx.send(true).ok();
    scheduler.await.context("scheduling loop panicked")?;

    Ok(())
}
