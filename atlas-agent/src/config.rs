//! Agent configuration assembled from the process environment

use crate::error::{AgentError, Result};
use log::warn;
use std::time::Duration;

/// Placeholder for host identity that could not be determined
pub const UNKNOWN: &str = "unknown";

const DEFAULT_GRACE_DELETE_PERIOD_SECS: u64 = 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
const DEFAULT_DSF_SYNC_INTERVAL_SECS: u64 = 5;
pub const DOCKER: &str = "docker";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub host_ip: String,
    pub node_name: String,
    /// Zero removes stale entries synchronously
    pub grace_delete_period: Duration,
    pub sweep_interval: Duration,
    pub track_host_ports: bool,
    /// `None` when distributed rules are disabled
    pub dsf: Option<DsfConfig>,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DsfConfig {
    pub server_addr: String,
    pub init_endpoint: String,
    pub update_endpoint: String,
    pub sync_interval: Duration,
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub kind: String,
    /// Engine API endpoint, e.g. `tcp://127.0.0.1:2375`; the default
    /// socket when unset
    pub docker_host: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kind: DOCKER.to_string(),
            docker_host: None,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host_ip: UNKNOWN.to_string(),
            node_name: UNKNOWN.to_string(),
            grace_delete_period: Duration::from_secs(DEFAULT_GRACE_DELETE_PERIOD_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            track_host_ports: true,
            dsf: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host_ip = lookup("MY_NODE_IP").unwrap_or_else(|| {
            warn!("MY_NODE_IP is not set, using \"{}\"", UNKNOWN);
            UNKNOWN.to_string()
        });

        let node_name = match lookup("MY_NODE_NAME") {
            Some(name) => name,
            None => {
                let name = hostname::get()
                    .ok()
                    .and_then(|h| h.into_string().ok())
                    .unwrap_or_else(|| UNKNOWN.to_string());
                warn!("MY_NODE_NAME is not set, using \"{}\"", name);
                name
            }
        };

        let grace_delete_period = secs(
            &lookup,
            "ATLAS_GRACE_DELETE_PERIOD_SECS",
            DEFAULT_GRACE_DELETE_PERIOD_SECS,
        )?;
        let sweep_interval = secs(&lookup, "ATLAS_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?;
        if sweep_interval.is_zero() {
            return Err(AgentError::Config(
                "ATLAS_SWEEP_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        let track_host_ports = flag(&lookup, "ATLAS_TRACK_HOST_PORTS", true)?;

        let dsf = if flag(&lookup, "ATLAS_DSF_ENABLE", false)? {
            match lookup("ATLAS_CONFIG_SERVER_ADDR").filter(|addr| !addr.is_empty()) {
                Some(server_addr) => {
                    let sync_interval = secs(
                        &lookup,
                        "ATLAS_DSF_SYNC_INTERVAL_SECS",
                        DEFAULT_DSF_SYNC_INTERVAL_SECS,
                    )?;
                    if sync_interval.is_zero() {
                        return Err(AgentError::Config(
                            "ATLAS_DSF_SYNC_INTERVAL_SECS must be greater than zero".to_string(),
                        ));
                    }
                    Some(DsfConfig {
                        server_addr,
                        init_endpoint: lookup("ATLAS_DSF_INIT_ENDPOINT")
                            .unwrap_or_else(|| atlas_common::endpoints::INIT.to_string()),
                        update_endpoint: lookup("ATLAS_DSF_UPDATE_ENDPOINT")
                            .unwrap_or_else(|| atlas_common::endpoints::UPDATE.to_string()),
                        sync_interval,
                        debug: flag(&lookup, "ATLAS_DSF_DEBUG", false)?,
                    })
                }
                None => {
                    warn!("ATLAS_DSF_ENABLE is set but ATLAS_CONFIG_SERVER_ADDR is missing, distributed rules disabled");
                    None
                }
            }
        } else {
            None
        };

        let runtime = RuntimeConfig {
            kind: lookup("RUNTIME").unwrap_or_else(|| DOCKER.to_string()),
            docker_host: lookup("DOCKER_HOST").filter(|host| !host.is_empty()),
        };

        Ok(Self {
            host_ip,
            node_name,
            grace_delete_period,
            sweep_interval,
            track_host_ports,
            dsf,
            runtime,
        })
    }

    pub fn grace_enabled(&self) -> bool {
        !self.grace_delete_period.is_zero()
    }
}

fn secs<F>(lookup: &F, name: &str, default: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| AgentError::Config(format!("{}={:?}: {}", name, value, e))),
        None => Ok(Duration::from_secs(default)),
    }
}

fn flag<F>(lookup: &F, name: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AgentError::Config(format!(
            "{}={:?}: expected a boolean",
            name, value
        ))),
    }
}
