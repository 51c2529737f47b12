//! # Operator REST API
//!
//! Loopback-only HTTP endpoints for querying server state: connected
//! sessions and live tunnels. Disabled unless `api_addr` is configured.

use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Response item representing one authenticated session.
#[derive(Serialize)]
pub struct SessionListItem {
    pub session_id: String,
    pub client_id: String,
    pub created_at: u64,
    pub tunnels: usize,
}

/// Response item representing one live tunnel.
#[derive(Serialize)]
pub struct TunnelListItem {
    pub tunnel_id: String,
    pub session_id: String,
    pub tunnel_type: String,
    pub name: String,
    pub public_address: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// `GET /api/sessions` — all currently connected sessions.
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionListItem>> {
    let sessions: Vec<SessionListItem> = state
        .sessions
        .iter()
        .map(|entry| SessionListItem {
            session_id: entry.session_id.clone(),
            client_id: entry.client_id.clone(),
            created_at: entry.created_at,
            tunnels: state.registry.session_tunnel_count(&entry.session_id),
        })
        .collect();
    Json(sessions)
}

/// `GET /api/tunnels` — all live tunnels with their byte totals.
async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelListItem>> {
    let tunnels: Vec<TunnelListItem> = state
        .registry
        .all()
        .into_iter()
        .map(|t| TunnelListItem {
            tunnel_id: t.tunnel_id.clone(),
            session_id: t.session_id.clone(),
            tunnel_type: t.tunnel_type.to_string(),
            name: t.name.clone(),
            public_address: t.public_address(),
            bytes_sent: t.bytes_sent.load(Ordering::Relaxed),
            bytes_received: t.bytes_received.load(Ordering::Relaxed),
        })
        .collect();
    Json(tunnels)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/tunnels", get(list_tunnels))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "operator API up");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { state.shutdown.cancelled().await })
        .await?;
    Ok(())
}
