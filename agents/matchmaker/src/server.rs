use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use roomforge_base::{envelope_middleware, ApiError, CoreMetrics, Environment};
use roomforge_core::{ServerAnnouncement, ServerInfo};

use crate::store::{ServerStore, StoreError};

/// Shared state for the matchmaker's request handlers.
#[derive(Debug, Clone)]
pub struct ApiContext {
    /// The server store.
    pub store: Arc<ServerStore>,
    /// Agent metrics.
    pub metrics: Arc<CoreMetrics>,
    /// Deployment environment, surfaced by `/health`.
    pub environment: Environment,
    /// Debug mode flag, surfaced by `/health`.
    pub debug: bool,
    /// Reaper interval in seconds, surfaced by `/health`.
    pub cleanup_interval: u64,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::not_found(err.to_string()),
            StoreError::Stale => ApiError::gone(err.to_string()),
        }
    }
}

/// Build the matchmaker router, with CORS per environment and the error
/// envelope stamped onto every failure.
pub fn router(context: ApiContext, cors: tower_http::cors::CorsLayer) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/register", post(register))
        .route("/heartbeat/:server_id", post(heartbeat))
        .route("/servers", get(list_servers))
        .route("/servers/:server_id", get(get_server))
        .route("/servers/:server_id", delete(unregister))
        .route("/health", get(health))
        .layer(middleware::from_fn(envelope_middleware))
        .layer(cors)
        .with_state(Arc::new(context))
}

async fn root(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    Json(json!({
        "service": "Game Matchmaker",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "active_servers": context.store.active_servers().len(),
    }))
}

async fn register(
    State(context): State<Arc<ApiContext>>,
    Json(announcement): Json<ServerAnnouncement>,
) -> Json<Value> {
    let server_id = context.store.register_or_update(announcement);
    context
        .metrics
        .registered_servers()
        .set(context.store.total() as i64);
    Json(json!({
        "status": "success",
        "server_id": server_id,
        "message": "Server registered successfully",
    }))
}

#[derive(Debug, Deserialize)]
struct HeartbeatParams {
    current_players: Option<u32>,
}

async fn heartbeat(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
    Query(params): Query<HeartbeatParams>,
) -> Result<Json<Value>, ApiError> {
    context
        .store
        .heartbeat(&server_id, params.current_players)?;
    context.metrics.heartbeats().inc();
    Ok(Json(json!({
        "status": "success",
        "message": "Heartbeat received",
    })))
}

async fn list_servers(State(context): State<Arc<ApiContext>>) -> Json<Vec<ServerInfo>> {
    Json(context.store.active_servers())
}

async fn get_server(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
) -> Result<Json<ServerInfo>, ApiError> {
    Ok(Json(context.store.get(&server_id)?))
}

async fn unregister(
    State(context): State<Arc<ApiContext>>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !context.store.remove(&server_id) {
        return Err(StoreError::NotFound.into());
    }
    context
        .metrics
        .registered_servers()
        .set(context.store.total() as i64);
    Ok(Json(json!({
        "status": "success",
        "message": "Server unregistered",
    })))
}

async fn health(State(context): State<Arc<ApiContext>>) -> Json<Value> {
    let stats = context.store.stats();

    let mut status = "healthy";
    let mut issues: Vec<&str> = Vec::new();
    if stats.stale_servers * 2 > stats.active_servers {
        issues.push("High number of stale servers detected");
        status = "degraded";
    }

    let mut body = json!({
        "status": status,
        "timestamp": Utc::now().to_rfc3339(),
        "statistics": {
            "active_servers": stats.active_servers,
            "total_registered_servers": stats.total_registered_servers,
            "stale_servers": stats.stale_servers,
            "total_players": stats.total_players,
            "heartbeat_timeout_seconds": context.store.heartbeat_timeout_seconds(),
        },
        "configuration": {
            "environment": context.environment.to_string(),
            "heartbeat_timeout": context.store.heartbeat_timeout_seconds(),
            "cleanup_interval": context.cleanup_interval,
            "debug_mode": context.debug,
        },
    });
    if !issues.is_empty() {
        body["issues"] = json!(issues);
    }
    Json(body)
}
