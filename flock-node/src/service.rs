//! Adoption RPC endpoint
//!
//! Every node serves this, whatever its role:
//! - POST /flock/v1/adopt      push a role and join credential
//! - POST /flock/v1/heartbeat  liveness + reconfigure flag
//! - GET  /health              local status, for operators

use crate::agent::NodeAgent;
use crate::error::{FlockError, Result};
use crate::model::{AdoptRequest, AdoptResponse, HeartbeatRequest, HeartbeatResponse, Role};
use crate::pusher::{ADOPT_PATH, HEARTBEAT_PATH};
use crate::shutdown;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Serialize)]
struct HealthView {
    status: &'static str,
    node_id: String,
    role: Role,
    adopted_by: Option<String>,
    controller: Option<String>,
    reconfigure: bool,
}

async fn adopt(State(agent): State<Arc<NodeAgent>>, Json(request): Json<AdoptRequest>) -> Json<AdoptResponse> {
    Json(agent.adopt(request))
}

async fn heartbeat(
    State(agent): State<Arc<NodeAgent>>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    Json(agent.heartbeat(request))
}

async fn health(State(agent): State<Arc<NodeAgent>>) -> Json<HealthView> {
    Json(HealthView {
        status: "ok",
        node_id: agent.identity().id.to_string(),
        role: agent.role(),
        adopted_by: agent.adoption().map(|a| a.controller.to_string()),
        controller: agent.tracked_controller().map(|addr| addr.to_string()),
        reconfigure: agent.reconfigure_requested(),
    })
}

pub fn router(agent: Arc<NodeAgent>) -> Router {
    Router::new()
        .route(ADOPT_PATH, post(adopt))
        .route(HEARTBEAT_PATH, post(heartbeat))
        .route("/health", get(health))
        .with_state(agent)
}

/// Bind the RPC listener; failure here is a startup failure
pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| FlockError::Bind { addr, source })
}

/// Serve until `shutdown` flips to true, then drain in-flight requests
pub async fn serve(listener: TcpListener, agent: Arc<NodeAgent>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let local = listener.local_addr()?;
    info!("Adoption service listening on http://{}", local);

    axum::serve(listener, router(agent))
        .with_graceful_shutdown(async move { shutdown::requested(&mut shutdown).await })
        .await?;
    info!("Adoption service stopped");
    Ok(())
}
