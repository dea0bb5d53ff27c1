//! The factory's HTTP edge: upload pipeline, instance operations and the
//! system endpoints, all speaking the standard error envelope.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::middleware;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use roomforge_base::{envelope_middleware, ApiError, CoreMetrics, Environment};
use roomforge_core::{AnalysisResult, ContainerRuntime, GameInstance, InstanceStatus};

use crate::analyze::JsAnalyzer;
use crate::build::ImageBuilder;
use crate::registry::InstanceRegistry;
use crate::supervisor::Supervisor;
use crate::validate::{UploadValidator, ValidatedUpload};

/// Body ceiling for the upload route; bundles may be up to 50 MiB.
const UPLOAD_BODY_LIMIT: usize = 64 * 1024 * 1024;

/// Everything the factory needs when the container runtime is reachable.
#[derive(Debug)]
pub struct DockerStack {
    /// The runtime client.
    pub runtime: Arc<dyn ContainerRuntime>,
    /// The container supervisor.
    pub supervisor: Arc<Supervisor>,
    /// The image builder / launcher.
    pub builder: Arc<ImageBuilder>,
}

/// Factory configuration surfaced by handlers.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Deployment environment.
    pub environment: Environment,
    /// Debug mode.
    pub debug: bool,
    /// Supervisor admission ceiling.
    pub max_containers: usize,
    /// Idle window, seconds.
    pub idle_timeout_seconds: u64,
    /// Matchmaker endpoint.
    pub matchmaker_url: String,
    /// Matchmaker probe timeout.
    pub matchmaker_timeout: Duration,
    /// Stop grace for user-initiated stops.
    pub stop_timeout: Duration,
}

/// Shared state for the factory's request handlers.
#[derive(Debug)]
pub struct FactoryState {
    /// The instance registry.
    pub registry: Arc<InstanceRegistry>,
    /// Runtime-backed components; `None` when Docker is unreachable and
    /// the factory runs in limited mode.
    pub docker: Option<DockerStack>,
    /// Upload validator.
    pub validator: UploadValidator,
    /// JavaScript analyzer.
    pub analyzer: JsAnalyzer,
    /// Agent metrics.
    pub metrics: Arc<CoreMetrics>,
    /// Outbound HTTP client (matchmaker probe).
    pub http: reqwest::Client,
    /// Configuration summary.
    pub config: FactoryConfig,
}

/// Build the factory router.
pub fn router(state: Arc<FactoryState>, cors: tower_http::cors::CorsLayer) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/servers", get(list_servers))
        .route("/servers/:server_id", get(get_server))
        .route("/servers/:server_id", delete(delete_server))
        .route("/servers/:server_id/stop", post(stop_server))
        .route("/servers/:server_id/logs", get(server_logs))
        .route("/servers/:server_id/activity", post(update_activity))
        .route("/upload", post(upload))
        .route("/system/stats", get(system_stats))
        .route("/system/resources", get(resource_stats))
        .route("/system/resources/:server_id", get(resource_details))
        .route("/system/idle-containers", get(idle_containers))
        .route("/system/cleanup/:server_id", post(force_cleanup))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
        .layer(middleware::from_fn(envelope_middleware))
        .layer(cors)
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "Game Server Factory",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "uploads game code and runs supervised game-server containers",
        "health": "/health",
    }))
}

async fn check_matchmaker_health(state: &FactoryState) -> &'static str {
    let url = format!("{}/health", state.config.matchmaker_url.trim_end_matches('/'));
    match state
        .http
        .get(url)
        .timeout(state.config.matchmaker_timeout)
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => "healthy",
        Ok(_) => "error",
        Err(_) => "unavailable",
    }
}

async fn health(State(state): State<Arc<FactoryState>>) -> Result<Json<Value>, ApiError> {
    let (runtime_status, running_containers) = match &state.docker {
        None => ("unavailable", 0),
        Some(docker) => match docker.runtime.system_summary().await {
            Ok(summary) => ("healthy", summary.running_game_containers),
            Err(err) => {
                warn!(%err, "runtime health check failed");
                ("error", 0)
            }
        },
    };
    let supervisor_status = if state.docker.is_some() {
        "healthy"
    } else {
        "unavailable"
    };
    let matchmaker_status = check_matchmaker_health(&state).await;

    let overall = if runtime_status == "error" {
        "degraded"
    } else if runtime_status == "unavailable" && supervisor_status == "unavailable" {
        "limited"
    } else {
        "healthy"
    };

    Ok(Json(json!({
        "status": overall,
        "containers": running_containers,
        "timestamp": Utc::now().to_rfc3339(),
        "components": {
            "container_runtime": runtime_status,
            "supervisor": supervisor_status,
            "matchmaker_service": matchmaker_status,
        },
        "configuration": {
            "environment": state.config.environment.to_string(),
            "max_containers": state.config.max_containers,
            "debug_mode": state.config.debug,
        },
    })))
}

async fn list_servers(State(state): State<Arc<FactoryState>>) -> Json<Vec<GameInstance>> {
    Json(state.registry.list_refreshed().await)
}

async fn get_server(
    State(state): State<Arc<FactoryState>>,
    Path(server_id): Path<String>,
) -> Result<Json<GameInstance>, ApiError> {
    state
        .registry
        .get_refreshed(&server_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found("server does not exist"))
}

async fn upload(
    State(state): State<Arc<FactoryState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut name: Option<String> = None;
    let mut description: Option<String> = None;
    let mut max_players: u32 = 10;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("invalid multipart payload: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload").to_owned();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("failed to read file: {e}")))?;
                file = Some((filename, bytes.to_vec()));
            }
            "name" => {
                name = Some(read_text_field(field, "name").await?);
            }
            "description" => {
                description = Some(read_text_field(field, "description").await?);
            }
            "max_players" => {
                let raw = read_text_field(field, "max_players").await?;
                max_players = raw
                    .trim()
                    .parse()
                    .map_err(|_| ApiError::validation("max_players must be a number"))?;
            }
            _ => {}
        }
    }

    let (filename, content) =
        file.ok_or_else(|| ApiError::validation("missing file field"))?;
    let name = name.ok_or_else(|| ApiError::validation("missing name field"))?;
    let description =
        description.ok_or_else(|| ApiError::validation("missing description field"))?;

    if name.trim().is_empty() || name.len() > 100 {
        return Err(ApiError::validation(
            "name must be between 1 and 100 characters",
        ));
    }
    if description.len() > 500 {
        return Err(ApiError::validation(
            "description must be at most 500 characters",
        ));
    }
    if !(1..=100).contains(&max_players) {
        return Err(ApiError::validation("max_players must be between 1 and 100"));
    }

    // Admission before any expensive work.
    if let Some(docker) = &state.docker {
        let (admitted, reason) = docker.supervisor.can_create();
        if !admitted {
            state.metrics.upload("refused");
            return Err(ApiError::admission_refused(format!(
                "unable to create server: {reason}"
            )));
        }
    }

    let validation = state
        .validator
        .validate(&content, &filename)
        .map_err(|message| {
            state.metrics.upload("rejected");
            ApiError::validation(message)
        })?;

    let mut analysis: Option<AnalysisResult> = None;
    if let ValidatedUpload::Js { source } = &validation.payload {
        let result = state.analyzer.analyze(source);
        if !result.is_valid {
            state.metrics.upload("rejected");
            let details = json!({
                "message": "code analysis failed",
                "syntax_errors": result.syntax_errors,
                "security_issues": result.security_issues,
                "suggestions": result.suggestions,
            });
            return Err(ApiError::security_rejection("code analysis failed", details));
        }
        analysis = Some(result);
    }

    let instance_id = state.registry.next_instance_id(&name, &description);
    let mut instance =
        GameInstance::new(instance_id.clone(), name.clone(), description, max_players);
    instance.push_log(format!("upload accepted: {filename}"));
    if let Some(result) = &analysis {
        instance.push_log(format!(
            "code analysis passed with {} warning(s)",
            result.warnings.len()
        ));
    }
    instance.push_log("starting container build".to_owned());
    state.registry.insert(instance);

    match &state.docker {
        Some(docker) => {
            match docker
                .builder
                .launch(&instance_id, &name, max_players, &validation.payload)
                .await
            {
                Ok(outcome) => {
                    state.registry.update(&instance_id, |i| {
                        i.container_id = Some(outcome.container_id.clone());
                        i.port = Some(outcome.host_port);
                        i.status = InstanceStatus::Running;
                        i.push_log(format!("container started: {}", short_id(&outcome.container_id)));
                        i.push_log(format!("serving on host port {}", outcome.host_port));
                        i.push_log(format!("image: {}", short_id(&outcome.image_id)));
                    });
                    docker.supervisor.register(&instance_id, &outcome.container_id);
                    state.metrics.upload("accepted");
                }
                Err(err) => {
                    // The upload itself succeeded; keep the instance with an
                    // error status instead of dropping it.
                    error!(instance_id, %err, "container launch failed");
                    state.registry.update(&instance_id, |i| {
                        i.status = InstanceStatus::Error;
                        i.push_log(format!("container launch failed: {err}"));
                    });
                    state.metrics.upload("failed");
                }
            }
        }
        None => {
            state.registry.update(&instance_id, |i| {
                i.status = InstanceStatus::Error;
                i.push_log("container runtime unavailable, cannot launch".to_owned());
            });
            state.metrics.upload("failed");
        }
    }

    let server = state
        .registry
        .get(&instance_id)
        .ok_or_else(|| ApiError::internal("instance vanished during upload"))?;
    let message = match server.status {
        InstanceStatus::Running => "upload accepted, game server is running",
        InstanceStatus::Error => "upload accepted, but the container failed to start",
        _ => "upload accepted, game server is being created",
    };

    Ok(Json(json!({
        "server_id": instance_id,
        "message": message,
        "analysis_result": {
            "warnings": analysis.as_ref().map(|a| a.warnings.clone()).unwrap_or_default(),
            "suggestions": analysis.map(|a| a.suggestions).unwrap_or_default(),
        },
        "server": server,
    })))
}

async fn read_text_field(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|_| ApiError::validation(format!("invalid {name} field")))
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

async fn stop_server(
    State(state): State<Arc<FactoryState>>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let instance = state
        .registry
        .get(&server_id)
        .ok_or_else(|| ApiError::not_found("server does not exist"))?;

    match (&state.docker, &instance.container_id) {
        (Some(docker), Some(container_id)) => {
            match docker
                .runtime
                .stop_container(container_id, state.config.stop_timeout)
                .await
            {
                Ok(()) => {
                    state.registry.update(&server_id, |i| {
                        i.status = InstanceStatus::Stopped;
                        i.push_log(format!("container stopped: {}", Utc::now().to_rfc3339()));
                    });
                }
                Err(err) if err.is_not_found() => {
                    state.registry.update(&server_id, |i| {
                        i.status = InstanceStatus::Stopped;
                        i.push_log("container already gone, marked stopped".to_owned());
                    });
                }
                Err(err) => {
                    error!(server_id, %err, "stop failed");
                    state.registry.update(&server_id, |i| {
                        i.status = InstanceStatus::Error;
                        i.push_log(format!("failed to stop container: {err}"));
                    });
                }
            }
        }
        _ => {
            state.registry.update(&server_id, |i| {
                i.status = InstanceStatus::Stopped;
                i.push_log(format!("server marked stopped: {}", Utc::now().to_rfc3339()));
            });
        }
    }

    let status = state
        .registry
        .get(&server_id)
        .map(|i| i.status)
        .unwrap_or(InstanceStatus::Stopped);
    Ok(Json(json!({
        "message": "server stopped",
        "server_id": server_id,
        "status": status,
    })))
}

async fn delete_server(
    State(state): State<Arc<FactoryState>>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.registry.contains(&server_id) {
        return Err(ApiError::not_found("server does not exist"));
    }

    if let Some(docker) = &state.docker {
        if !docker.supervisor.force_cleanup(&server_id).await {
            warn!(server_id, "resource cleanup incomplete during delete");
        }
    }
    state.registry.remove(&server_id);

    Ok(Json(json!({
        "message": "server deleted",
        "server_id": server_id,
    })))
}

#[derive(Debug, Deserialize)]
struct LogsParams {
    tail: Option<usize>,
}

async fn server_logs(
    State(state): State<Arc<FactoryState>>,
    Path(server_id): Path<String>,
    Query(params): Query<LogsParams>,
) -> Result<Json<Value>, ApiError> {
    let tail = params.tail.unwrap_or(100).max(1);
    let logs = state
        .registry
        .merged_logs(&server_id, tail)
        .await
        .ok_or_else(|| ApiError::not_found("server does not exist"))?;
    let container_id = state.registry.get(&server_id).and_then(|i| i.container_id);

    Ok(Json(json!({
        "server_id": server_id,
        "logs": logs,
        "log_count": logs.len(),
        "container_id": container_id,
    })))
}

#[derive(Debug, Deserialize)]
struct ActivityParams {
    connection_count: Option<u32>,
}

async fn update_activity(
    State(state): State<Arc<FactoryState>>,
    Path(server_id): Path<String>,
    Query(params): Query<ActivityParams>,
) -> Result<Json<Value>, ApiError> {
    if !state.registry.contains(&server_id) {
        return Err(ApiError::not_found("server does not exist"));
    }
    let connection_count = params.connection_count.unwrap_or(0);
    if let Some(docker) = &state.docker {
        docker.supervisor.update_activity(&server_id, connection_count);
    }

    Ok(Json(json!({
        "message": "activity updated",
        "server_id": server_id,
        "connection_count": connection_count,
    })))
}

async fn system_stats(State(state): State<Arc<FactoryState>>) -> Result<Json<Value>, ApiError> {
    let mut body = json!({
        "timestamp": Utc::now().to_rfc3339(),
        "game_servers_count": state.registry.len(),
        "docker_available": state.docker.is_some(),
        "resource_manager_available": state.docker.is_some(),
    });

    if let Some(docker) = &state.docker {
        match docker.runtime.system_summary().await {
            Ok(summary) => {
                body["docker_version"] = json!(summary.runtime_version);
                body["total_containers"] = json!(summary.total_containers);
                body["game_containers"] = json!(summary.game_containers);
                body["running_game_containers"] = json!(summary.running_game_containers);
            }
            Err(err) => warn!(%err, "system summary failed"),
        }
        body["resource_management"] = serde_json::to_value(docker.supervisor.stats())
            .map_err(|e| ApiError::internal_from(e, state.config.debug))?;
    }

    Ok(Json(body))
}

fn docker_or_unavailable(state: &FactoryState) -> Result<&DockerStack, ApiError> {
    state
        .docker
        .as_ref()
        .ok_or_else(|| ApiError::dependency_unavailable("container runtime unavailable"))
}

async fn resource_stats(State(state): State<Arc<FactoryState>>) -> Result<Json<Value>, ApiError> {
    let docker = docker_or_unavailable(&state)?;
    let stats = docker.supervisor.stats();
    Ok(Json(serde_json::to_value(stats).map_err(|e| {
        ApiError::internal_from(e, state.config.debug)
    })?))
}

async fn resource_details(
    State(state): State<Arc<FactoryState>>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let docker = docker_or_unavailable(&state)?;
    let activity = docker
        .supervisor
        .activity(&server_id)
        .ok_or_else(|| ApiError::not_found("server is not tracked by the supervisor"))?;

    Ok(Json(json!({
        "server_id": activity.instance_id,
        "container_id": activity.container_id,
        "last_activity": activity.last_activity.to_rfc3339(),
        "idle_time_seconds": activity.idle_seconds(Utc::now()).max(0),
        "connection_count": activity.connection_count,
        "cpu_usage": activity.cpu_percent,
        "memory_usage_mb": activity.memory_mb,
        "is_idle": activity.is_idle,
        "error_count": activity.error_count,
        "last_error": activity.last_error,
    })))
}

async fn idle_containers(State(state): State<Arc<FactoryState>>) -> Result<Json<Value>, ApiError> {
    let docker = docker_or_unavailable(&state)?;
    let idle = docker.supervisor.idle_activities();

    Ok(Json(json!({
        "count": idle.len(),
        "idle_timeout_seconds": state.config.idle_timeout_seconds,
        "containers": idle
            .iter()
            .map(|a| {
                json!({
                    "server_id": a.instance_id,
                    "container_id": short_id(&a.container_id),
                    "last_activity": a.last_activity.to_rfc3339(),
                    "connection_count": a.connection_count,
                })
            })
            .collect::<Vec<_>>(),
    })))
}

async fn force_cleanup(
    State(state): State<Arc<FactoryState>>,
    Path(server_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let docker = docker_or_unavailable(&state)?;
    if !state.registry.contains(&server_id) {
        return Err(ApiError::not_found("server does not exist"));
    }

    if docker.supervisor.force_cleanup(&server_id).await {
        state.registry.update(&server_id, |i| {
            i.status = InstanceStatus::Stopped;
            i.push_log(format!("force cleanup finished: {}", Utc::now().to_rfc3339()));
        });
        Ok(Json(json!({
            "message": "server resources cleaned up",
            "server_id": server_id,
        })))
    } else {
        Err(ApiError::runtime_failure("force cleanup failed"))
    }
}
