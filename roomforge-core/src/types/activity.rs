use chrono::{DateTime, Utc};
use serde::Serialize;

/// The supervisor's view of one managed container: when it last did work,
/// how many players are connected, recent resource readings, and how many
/// consecutive errors it has accumulated.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerActivity {
    /// Owning instance id.
    pub instance_id: String,
    /// Container the activity belongs to.
    pub container_id: String,
    /// When the container last reported activity.
    pub last_activity: DateTime<Utc>,
    /// Currently connected players.
    pub connection_count: u32,
    /// Latest CPU reading, percent.
    pub cpu_percent: f64,
    /// Latest memory reading, MiB.
    pub memory_mb: f64,
    /// Derived idle marker; the timestamps are authoritative.
    pub is_idle: bool,
    /// Consecutive errors observed by the supervisor.
    pub error_count: u32,
    /// Most recent error message, if any.
    pub last_error: Option<String>,
    /// Set once an error event has been emitted for the current error run;
    /// cleared by the next activity update.
    #[serde(skip)]
    pub notified: bool,
}

impl ContainerActivity {
    /// A fresh activity row for a container registered just now.
    pub fn new(instance_id: String, container_id: String) -> Self {
        Self {
            instance_id,
            container_id,
            last_activity: Utc::now(),
            connection_count: 0,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            is_idle: false,
            error_count: 0,
            last_error: None,
            notified: false,
        }
    }

    /// Seconds since the last recorded activity at `now`.
    pub fn idle_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_activity).num_seconds()
    }
}
