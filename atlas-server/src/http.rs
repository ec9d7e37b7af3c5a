//! HTTP surface of the config server
//!
//! Both exchanges are `POST` with a JSON `SyncRequest` body and answer with a
//! `Response<SyncResponse>` envelope.

use crate::{RuleCenter, ServerError};
use atlas_common::{Response, SyncRequest, SyncResponse};
use axum::{extract::State, routing::post, Json, Router};
use log::{info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Paths the two exchanges are served on
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub init: String,
    pub update: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            init: atlas_common::endpoints::INIT.to_string(),
            update: atlas_common::endpoints::UPDATE.to_string(),
        }
    }
}

pub fn router(center: Arc<RuleCenter>, endpoints: &Endpoints) -> Router {
    Router::new()
        .route(&endpoints.init, post(init_handler))
        .route(&endpoints.update, post(update_handler))
        .with_state(center)
}

/// Serve until the listener fails
pub async fn serve(
    listener: TcpListener,
    center: Arc<RuleCenter>,
    endpoints: &Endpoints,
) -> anyhow::Result<()> {
    info!(
        "Serving rule sync on {} (init: {}, update: {})",
        listener.local_addr()?,
        endpoints.init,
        endpoints.update
    );
    axum::serve(listener, router(center, endpoints)).await?;
    Ok(())
}

async fn init_handler(
    State(center): State<Arc<RuleCenter>>,
    Json(req): Json<SyncRequest>,
) -> Json<Response<SyncResponse>> {
    Json(wrap(center.init(&req)))
}

async fn update_handler(
    State(center): State<Arc<RuleCenter>>,
    Json(req): Json<SyncRequest>,
) -> Json<Response<SyncResponse>> {
    Json(wrap(center.update(&req)))
}

fn wrap(result: Result<SyncResponse, ServerError>) -> Response<SyncResponse> {
    match result {
        Ok(data) => Response::ok(data),
        Err(e) => {
            warn!("Rejected sync request: {}", e);
            Response {
                msg: e.to_string(),
                code: 400,
                data: SyncResponse::default(),
            }
        }
    }
}
