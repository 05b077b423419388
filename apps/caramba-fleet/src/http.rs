use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use caramba_db::models::node::Node;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::failover::FailoverPhase;
use crate::monitor::FleetMonitor;

#[derive(Clone)]
pub struct AppState {
    pub monitor: Arc<FleetMonitor>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub nodes: usize,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub phase: FailoverPhase,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/fleet/nodes", get(list_nodes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        nodes: state.monitor.registry().snapshot().await.len(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn list_nodes(State(state): State<AppState>) -> Json<Vec<NodeView>> {
    let failover = state.monitor.failover();
    let nodes = state
        .monitor
        .registry()
        .snapshot()
        .await
        .into_iter()
        .map(|node| NodeView {
            phase: failover.phase(node.id),
            node,
        })
        .collect();
    Json(nodes)
}

pub async fn serve(addr: &str, state: AppState, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Status API listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
