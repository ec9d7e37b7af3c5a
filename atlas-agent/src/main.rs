//! atlas-agent - Node agent resolving network addresses to workloads
//!
//! The agent runs on each Kubernetes node and:
//! - Watches nodes, ReplicaSets, services and pods
//! - Indexes containers by id, pod ip:port and host ip:port
//! - Shares port-forwarding rules with the other agents through the config
//!   server, when enabled

use anyhow::{Context, Result};
use atlas_agent::{Agent, AgentConfig};
use kube::Client;
use log::info;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("atlas-agent starting...");

    let config = AgentConfig::from_env().context("Failed to load agent configuration")?;
    info!(
        "Node {} ({}), grace delete period {:?}, distributed rules {}",
        config.node_name,
        config.host_ip,
        config.grace_delete_period,
        if config.dsf.is_some() { "enabled" } else { "disabled" }
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let agent = Agent::new(config);
    agent.watch(client).await;

    info!("atlas-agent running. Press Ctrl+C to exit.");

    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    agent.shutdown().await;

    info!("atlas-agent stopped");
    Ok(())
}
