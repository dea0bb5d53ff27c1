use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::{ResourceSnapshot, RuntimeError};

/// Port every generated game template listens on inside its container.
pub const CONTAINER_PORT: u16 = 8080;

/// Label key marking resources created by the factory.
pub const MANAGED_BY_LABEL: &str = "created_by";
/// Label value marking resources created by the factory.
pub const MANAGED_BY_VALUE: &str = "roomforge-factory";
/// Label key carrying the owning instance id.
pub const INSTANCE_ID_LABEL: &str = "instance_id";

/// Coarse container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Created but never started.
    Created,
    /// Up.
    Running,
    /// Restart policy is cycling it.
    Restarting,
    /// Paused.
    Paused,
    /// Exited (cleanly or not).
    Exited,
    /// Daemon considers it dead.
    Dead,
    /// Anything the runtime reports that we do not model.
    Unknown,
}

impl ContainerState {
    /// Whether the container is currently up.
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    /// Parse a runtime status string.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "restarting" => ContainerState::Restarting,
            "paused" => ContainerState::Paused,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            _ => ContainerState::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Restarting => "restarting",
            ContainerState::Paused => "paused",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
            ContainerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// An in-memory image build context: relative paths and file contents.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    files: Vec<(String, Vec<u8>)>,
}

impl BuildContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file at a context-relative path.
    pub fn add_file(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.push((path.into(), contents.into()));
    }

    /// All files in insertion order.
    pub fn files(&self) -> &[(String, Vec<u8>)] {
        &self.files
    }
}

/// Everything needed to run one game container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Image tag to run.
    pub image: String,
    /// Container name.
    pub name: String,
    /// Port the process listens on inside the container.
    pub container_port: u16,
    /// Host port to publish it on.
    pub host_port: u16,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Labels; must include the managed-by marker and instance id.
    pub labels: Vec<(String, String)>,
    /// Bridge network to attach to.
    pub network: String,
    /// Restart policy name, e.g. `unless-stopped`.
    pub restart_policy: String,
    /// Memory ceiling in bytes, if limited.
    pub memory_limit_bytes: Option<i64>,
    /// CPU ceiling in cores, if limited.
    pub cpu_limit: Option<f64>,
}

/// Summary of a container from a label-filtered listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    /// Container id.
    pub id: String,
    /// Current state.
    pub state: ContainerState,
    /// All labels on the container.
    pub labels: HashMap<String, String>,
    /// Host ports the container publishes.
    pub host_ports: Vec<u16>,
}

/// Aggregate runtime figures for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemSummary {
    /// Daemon version string.
    pub runtime_version: String,
    /// All containers on the host.
    pub total_containers: usize,
    /// Containers carrying the managed-by label.
    pub game_containers: usize,
    /// Managed containers currently running.
    pub running_game_containers: usize,
}

/// The operations the factory needs from a container runtime.
///
/// The supervisor, image builder and instance registry depend on this trait
/// only; the Docker-backed implementation lives in `roomforge-docker`, and
/// tests substitute a mock.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + std::fmt::Debug {
    /// Check daemon liveness.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Create the named bridge network if it does not exist, labeled so
    /// teardown can find it.
    async fn ensure_network(&self, name: &str) -> Result<(), RuntimeError>;

    /// Build an image from an in-memory context, returning the image id.
    async fn build_image(&self, tag: &str, context: BuildContext) -> Result<String, RuntimeError>;

    /// Create and start a container, returning its id.
    async fn run_container(&self, spec: RunSpec) -> Result<String, RuntimeError>;

    /// Current state of a container; `NotFound` when it is gone.
    async fn container_state(&self, container_id: &str) -> Result<ContainerState, RuntimeError>;

    /// Current resource readings for a container.
    async fn container_stats(&self, container_id: &str)
        -> Result<ResourceSnapshot, RuntimeError>;

    /// Tail of the container log stream.
    async fn container_logs(
        &self,
        container_id: &str,
        tail: usize,
    ) -> Result<Vec<String>, RuntimeError>;

    /// Stop a container, force-killing after `timeout`.
    async fn stop_container(
        &self,
        container_id: &str,
        timeout: Duration,
    ) -> Result<(), RuntimeError>;

    /// Remove a container.
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Remove an image by tag.
    async fn remove_image(&self, tag: &str) -> Result<(), RuntimeError>;

    /// All containers (running or not) carrying `key=value`.
    async fn containers_with_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Host ports currently claimed by managed containers.
    async fn used_host_ports(&self) -> Result<HashSet<u16>, RuntimeError>;

    /// Aggregate daemon/container counts.
    async fn system_summary(&self) -> Result<SystemSummary, RuntimeError>;
}
