//! HTTP admin surface.
//!
//! Read-only JSON snapshots behind the bearer token from
//! `<conf_dir>/token`: connected points, per-tenant neighbors, the
//! online log, recent log events and the stats roll-up.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::warn;

use crate::server::SwitchCore;
use crate::tenant::neighbor::NeighborSnapshot;

#[derive(Clone)]
pub struct AdminState {
    core: Arc<SwitchCore>,
    token: String,
}

#[derive(Serialize)]
struct TenantNeighbors {
    tenant: String,
    neighbors: Vec<NeighborSnapshot>,
}

pub fn router(core: Arc<SwitchCore>, token: String) -> Router {
    let state = AdminState { core, token };
    Router::new()
        .route("/api/stats", get(get_stats))
        .route("/api/point", get(get_points))
        .route("/api/neighbor", get(get_neighbors))
        .route("/api/online", get(get_online))
        .route("/api/log", get(get_log))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_token,
        ))
        .with_state(state)
}

/// Serve the admin API until shutdown.
pub async fn serve(
    listener: TcpListener,
    core: Arc<SwitchCore>,
    token: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let app = router(core, token);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        warn!(error = %e, "admin surface failed");
    }
}

async fn require_token(
    State(state): State<AdminState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented == state.token);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

async fn get_stats(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.core.stats())
}

async fn get_points(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.core.sessions_snapshot())
}

async fn get_neighbors(State(state): State<AdminState>) -> impl IntoResponse {
    let tenants: Vec<TenantNeighbors> = state
        .core
        .tenants()
        .into_iter()
        .map(|t| TenantNeighbors {
            tenant: t.name().to_string(),
            neighbors: t.neighbor_snapshot(),
        })
        .collect();
    Json(tenants)
}

async fn get_online(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.core.online_snapshot())
}

async fn get_log(State(state): State<AdminState>) -> impl IntoResponse {
    Json(state.core.log_ring().snapshot())
}
