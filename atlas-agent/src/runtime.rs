//! Container runtime inspection for published host ports
//!
//! Only the Docker Engine API is supported, over its unix socket or TCP.
//! Kubernetes pods publish their ports on the sandbox (pause) container, so a
//! container without bindings of its own is resolved through the
//! `container:<id>` network mode.

use crate::config::{RuntimeConfig, DOCKER};
use crate::error::{AgentError, Result};
use async_trait::async_trait;
use hyper::body::Bytes;
use hyper::StatusCode;
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Private port -> public ports published for it
pub type PortMap = HashMap<u32, Vec<u32>>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;
const NETWORK_MODE_CONTAINER: &str = "container:";

/// Where the engine listens when `DOCKER_HOST` is not set
pub const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";

#[async_trait]
pub trait RuntimeService: Send + Sync {
    /// Published ports of a container, keyed by the port inside it
    async fn port_mapping(&self, container_id: &str) -> Result<PortMap>;
}

/// Pick the runtime client described by `config`, or `None` when port
/// discovery is unavailable on this node
pub fn from_config(config: &RuntimeConfig) -> Option<Arc<dyn RuntimeService>> {
    if config.kind != DOCKER {
        warn!(
            "Runtime {:?} is not supported, distributed rules will not be created",
            config.kind
        );
        return None;
    }
    let host = config.docker_host.as_deref().unwrap_or(DEFAULT_DOCKER_HOST);
    match DockerClient::new(host) {
        Ok(client) => {
            info!("Inspecting containers through {}", client.endpoint);
            Some(Arc::new(client))
        }
        Err(e) => {
            warn!("Failed to set up docker client, distributed rules will not be created: {}", e);
            None
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    #[serde(default)]
    host_config: HostConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    #[serde(default)]
    port_bindings: Option<HashMap<String, Option<Vec<PortBinding>>>>,
    #[serde(default)]
    network_mode: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_port: String,
}

type PortBindings = HashMap<String, Option<Vec<PortBinding>>>;

enum Transport {
    Http { client: reqwest::Client, base_url: String },
    Unix { socket: PathBuf },
}

/// Docker Engine API client
pub struct DockerClient {
    transport: Transport,
    /// Normalized `DOCKER_HOST`, for logging
    endpoint: String,
}

impl DockerClient {
    /// `host` is a `DOCKER_HOST` value such as `unix:///var/run/docker.sock`
    /// or `tcp://127.0.0.1:2375`
    pub fn new(host: &str) -> Result<Self> {
        if let Some(socket) = host.strip_prefix("unix://") {
            if socket.is_empty() {
                return Err(AgentError::Runtime(format!("docker host {:?} names no socket", host)));
            }
            return Ok(Self {
                transport: Transport::Unix {
                    socket: PathBuf::from(socket),
                },
                endpoint: host.to_string(),
            });
        }

        let base_url = if let Some(rest) = host.strip_prefix("tcp://") {
            format!("http://{}", rest)
        } else if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            return Err(AgentError::Runtime(format!(
                "unsupported docker host {:?}, expected a unix:// or tcp:// endpoint",
                host
            )));
        };
        let base_url = base_url.trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| AgentError::Runtime(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            endpoint: base_url.clone(),
            transport: Transport::Http { client, base_url },
        })
    }

    async fn inspect(&self, container_id: &str) -> Result<HostConfig> {
        let path = format!("/containers/{}/json", container_id);
        let failed = |e: String| AgentError::Runtime(format!("inspect {}: {}", container_id, e));

        let (status, body) = match &self.transport {
            Transport::Http { client, base_url } => {
                let response = client
                    .get(format!("{}{}", base_url, path))
                    .send()
                    .await
                    .map_err(|e| failed(e.to_string()))?;
                let status = response.status();
                let body = response.bytes().await.map_err(|e| failed(e.to_string()))?;
                (status, body)
            }
            Transport::Unix { socket } => {
                tokio::time::timeout(REQUEST_TIMEOUT, unix_get(socket, &path))
                    .await
                    .map_err(|_| failed(format!("no answer within {:?}", REQUEST_TIMEOUT)))??
            }
        };

        if !status.is_success() {
            return Err(failed(format!(
                "{} - {}",
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }
        let inspect: ContainerInspect =
            serde_json::from_slice(&body).map_err(|e| failed(e.to_string()))?;
        Ok(inspect.host_config)
    }
}

/// One GET over a fresh connection to the engine's unix socket
#[cfg(unix)]
async fn unix_get(socket: &Path, path: &str) -> Result<(StatusCode, Bytes)> {
    use http_body_util::{BodyExt, Empty};
    use hyper::{header, Request};
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;

    let failed = |e: String| AgentError::Runtime(format!("GET {} via {}: {}", path, socket.display(), e));

    let stream = UnixStream::connect(socket).await?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| failed(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            log::debug!("Docker socket connection closed: {}", e);
        }
    });

    let request = Request::get(path)
        .header(header::HOST, "docker")
        .body(Empty::<Bytes>::new())
        .map_err(|e| failed(e.to_string()))?;
    let response = sender
        .send_request(request)
        .await
        .map_err(|e| failed(e.to_string()))?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| failed(e.to_string()))?
        .to_bytes();
    Ok((status, body))
}

#[cfg(not(unix))]
async fn unix_get(socket: &Path, _path: &str) -> Result<(StatusCode, Bytes)> {
    Err(AgentError::Runtime(format!(
        "unix socket {} is not supported on this platform",
        socket.display()
    )))
}
