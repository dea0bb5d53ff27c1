use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on retained per-instance log lines.
pub const MAX_LOG_LINES: usize = 200;

/// Lifecycle state of a managed game-server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Upload accepted, container not launched yet.
    Creating,
    /// Container is up.
    Running,
    /// Container was stopped (by the user or the idle reaper).
    Stopped,
    /// Launch failed or the container died.
    Error,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Creating => "creating",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Point-in-time resource readings for one container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// CPU usage in percent of one core times core count.
    pub cpu_percent: f64,
    /// Memory in use, MiB.
    pub memory_mb: f64,
    /// Memory limit, MiB (0 when unlimited).
    pub memory_limit_mb: f64,
    /// Cumulative network bytes received, MiB.
    pub network_rx_mb: f64,
    /// Cumulative network bytes sent, MiB.
    pub network_tx_mb: f64,
}

/// A user-uploaded game after admission, as tracked by the factory and
/// projected over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct GameInstance {
    /// Unique id, derived from the display name plus a monotonic counter.
    pub server_id: String,
    /// Display name given at upload time.
    pub name: String,
    /// Free-form description given at upload time.
    pub description: String,
    /// Current lifecycle state.
    pub status: InstanceStatus,
    /// Container id, present once a launch was attempted successfully.
    pub container_id: Option<String>,
    /// Host port the container is published on.
    pub port: Option<u16>,
    /// Advertised player ceiling.
    pub max_players: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Latest resource readings.
    pub resource_usage: ResourceSnapshot,
    /// Bounded merged log buffer (internal events + container tail).
    pub logs: Vec<String>,
}

impl GameInstance {
    /// Create a fresh instance in `creating` state.
    pub fn new(server_id: String, name: String, description: String, max_players: u32) -> Self {
        let now = Utc::now();
        Self {
            server_id,
            name,
            description,
            status: InstanceStatus::Creating,
            container_id: None,
            port: None,
            max_players,
            created_at: now,
            updated_at: now,
            resource_usage: ResourceSnapshot::default(),
            logs: Vec::new(),
        }
    }

    /// Append a log line, evicting the oldest lines past [`MAX_LOG_LINES`].
    pub fn push_log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
        if self.logs.len() > MAX_LOG_LINES {
            let excess = self.logs.len() - MAX_LOG_LINES;
            self.logs.drain(..excess);
        }
    }

    /// Record a state transition, bumping `updated_at`.
    pub fn set_status(&mut self, status: InstanceStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_is_bounded() {
        let mut instance =
            GameInstance::new("user_1_game_001".into(), "game".into(), "d".into(), 10);
        for i in 0..(MAX_LOG_LINES + 25) {
            instance.push_log(format!("line {i}"));
        }
        assert_eq!(instance.logs.len(), MAX_LOG_LINES);
        assert_eq!(instance.logs[0], "line 25");
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&InstanceStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
