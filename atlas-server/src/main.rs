//! atlas-server - central rule authority for atlas agents

use anyhow::{Context, Result};
use atlas_server::http::{serve, Endpoints};
use atlas_server::{RuleCenter, DEFAULT_RETENTION};
use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

const DEFAULT_ADDR: &str = "0.0.0.0:9504";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("atlas-server starting...");

    let addr = std::env::var("ATLAS_SERVER_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let mut endpoints = Endpoints::default();
    if let Ok(path) = std::env::var("ATLAS_DSF_INIT_ENDPOINT") {
        endpoints.init = path;
    }
    if let Ok(path) = std::env::var("ATLAS_DSF_UPDATE_ENDPOINT") {
        endpoints.update = path;
    }

    let retention = match std::env::var("ATLAS_HISTORY_RETENTION_SECS") {
        Ok(secs) => Duration::from_secs(
            secs.parse()
                .with_context(|| format!("Invalid ATLAS_HISTORY_RETENTION_SECS {:?}", secs))?,
        ),
        Err(_) => DEFAULT_RETENTION,
    };
    info!("Keeping rule deltas for at most {:?}", retention);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let center = Arc::new(RuleCenter::with_retention(retention));

    tokio::select! {
        res = serve(listener, center, &endpoints) => res?,
        _ = signal::ctrl_c() => info!("Shutdown signal received"),
    }

    info!("atlas-server stopped");
    Ok(())
}
