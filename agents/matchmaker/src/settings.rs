//! Configuration

use serde::Deserialize;

use roomforge_base::{load_settings_object, AppSettings, NewFromSettings};

fn default_heartbeat_timeout() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    10
}

/// Settings for the matchmaker agent.
#[derive(Debug, Deserialize)]
pub struct MatchmakerSettings {
    /// Shared agent settings.
    #[serde(flatten)]
    pub app: AppSettings,
    /// Seconds without a heartbeat before an entry is considered stale.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    /// Seconds between reaper sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl AsRef<AppSettings> for MatchmakerSettings {
    fn as_ref(&self) -> &AppSettings {
        &self.app
    }
}

impl NewFromSettings for MatchmakerSettings {
    type Error = eyre::Report;

    fn new() -> Result<Self, Self::Error> {
        load_settings_object(&[("port", 8000)])
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = self.app.validate();
        if self.heartbeat_timeout == 0 {
            errors.push("HEARTBEAT_TIMEOUT must be positive, got 0".to_owned());
        }
        if self.cleanup_interval == 0 {
            errors.push("CLEANUP_INTERVAL must be positive, got 0".to_owned());
        }
        errors
    }
}
