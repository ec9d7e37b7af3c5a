use crate::error::{AgentError, Result};
use async_trait::async_trait;
use atlas_common::{Response, SyncRequest, SyncResponse};
use std::sync::Arc;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 100;

/// The two exchanges offered by the central config server
#[async_trait]
pub trait ConfigServer: Send + Sync {
    /// Replace everything the server knows about the caller's node
    async fn init(&self, request: &SyncRequest) -> Result<SyncResponse>;

    /// Publish a delta and collect what other nodes published since
    /// `request.last_update_timestamp`
    async fn update(&self, request: &SyncRequest) -> Result<SyncResponse>;
}

#[async_trait]
impl<S: ConfigServer + ?Sized> ConfigServer for Arc<S> {
    async fn init(&self, request: &SyncRequest) -> Result<SyncResponse> {
        (**self).init(request).await
    }

    async fn update(&self, request: &SyncRequest) -> Result<SyncResponse> {
        (**self).update(request).await
    }
}

/// JSON over HTTP client of the config server
pub struct HttpConfigServer {
    http: reqwest::Client,
    init_url: String,
    update_url: String,
}

impl HttpConfigServer {
    /// `addr` may omit the scheme, in which case plain HTTP is used
    pub fn new(addr: &str, init_endpoint: &str, update_endpoint: &str) -> Result<Self> {
        let base = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("http://{}", addr)
        };
        let base = base.trim_end_matches('/');

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|e| AgentError::ConfigServer(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            init_url: format!("{}{}", base, init_endpoint),
            update_url: format!("{}{}", base, update_endpoint),
        })
    }

    pub fn init_url(&self) -> &str {
        &self.init_url
    }

    pub fn update_url(&self) -> &str {
        &self.update_url
    }

    async fn post(&self, url: &str, request: &SyncRequest) -> Result<SyncResponse> {
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|e| AgentError::ConfigServer(format!("POST {}: {}", url, e)))?;

        let status = response.status();
        let envelope: Response<SyncResponse> = response.json().await.map_err(|e| {
            AgentError::ConfigServer(format!("POST {}: {} with unreadable body: {}", url, status, e))
        })?;

        if !envelope.is_ok() {
            return Err(AgentError::ConfigServer(format!(
                "POST {}: code {}: {}",
                url, envelope.code, envelope.msg
            )));
        }
        Ok(envelope.data)
    }
}

#[async_trait]
impl ConfigServer for HttpConfigServer {
    async fn init(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.post(&self.init_url, request).await
    }

    async fn update(&self, request: &SyncRequest) -> Result<SyncResponse> {
        self.post(&self.update_url, request).await
    }
}
