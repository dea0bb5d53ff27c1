//! Configuration

use serde::Deserialize;

use roomforge_base::{load_settings_object, AppSettings, NewFromSettings};

fn default_max_file_size() -> u64 {
    1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    [".js", ".mjs", ".html", ".htm", ".zip"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_upload_timeout() -> u64 {
    300
}

fn default_docker_network() -> String {
    "game-network".to_owned()
}

fn default_base_port() -> u16 {
    8081
}

fn default_max_containers() -> usize {
    50
}

fn default_container_memory_limit() -> String {
    "512m".to_owned()
}

fn default_container_cpu_limit() -> f64 {
    1.0
}

fn default_matchmaker_url() -> String {
    "http://localhost:8000".to_owned()
}

fn default_matchmaker_timeout() -> u64 {
    10
}

fn default_idle_timeout_seconds() -> u64 {
    1800
}

fn default_cleanup_interval_seconds() -> u64 {
    300
}

fn default_resource_check_interval() -> u64 {
    60
}

fn default_max_error_count() -> u32 {
    5
}

fn default_api_rate_limit() -> u32 {
    100
}

/// Settings for the factory agent.
#[derive(Debug, Deserialize)]
pub struct FactorySettings {
    /// Shared agent settings.
    #[serde(flatten)]
    pub app: AppSettings,

    /// Upload size ceiling for JavaScript payloads, bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Accepted upload extensions (with leading dot).
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Upload handling budget, seconds.
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout: u64,

    /// Bridge network game containers attach to.
    #[serde(default = "default_docker_network")]
    pub docker_network: String,
    /// First host port probed for new containers.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
    /// Hard ceiling on supervised containers.
    #[serde(default = "default_max_containers")]
    pub max_containers: usize,
    /// Per-container memory ceiling, e.g. `512m`.
    #[serde(default = "default_container_memory_limit")]
    pub container_memory_limit: String,
    /// Per-container CPU ceiling in cores.
    #[serde(default = "default_container_cpu_limit")]
    pub container_cpu_limit: f64,

    /// Matchmaker endpoint handed to game containers.
    #[serde(default = "default_matchmaker_url")]
    pub matchmaker_url: String,
    /// Matchmaker health probe timeout, seconds.
    #[serde(default = "default_matchmaker_timeout")]
    pub matchmaker_timeout: u64,

    /// Idle window after which a connection-less container is stopped.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    /// Supervisor tick period, seconds.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
    /// Stats refresh budget, seconds.
    #[serde(default = "default_resource_check_interval")]
    pub resource_check_interval: u64,
    /// Consecutive errors tolerated before a container is stopped.
    #[serde(default = "default_max_error_count")]
    pub max_error_count: u32,

    /// Requests-per-minute ceiling advertised to clients.
    #[serde(default = "default_api_rate_limit")]
    pub api_rate_limit: u32,
}

impl AsRef<AppSettings> for FactorySettings {
    fn as_ref(&self) -> &AppSettings {
        &self.app
    }
}

impl NewFromSettings for FactorySettings {
    type Error = eyre::Report;

    fn new() -> Result<Self, Self::Error> {
        load_settings_object(&[("port", 8080)])
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = self.app.validate();
        if !(1024..=65535).contains(&self.base_port) {
            errors.push(format!(
                "BASE_PORT must be between 1024 and 65535, got {}",
                self.base_port
            ));
        }
        if self.max_file_size == 0 {
            errors.push("MAX_FILE_SIZE must be positive, got 0".to_owned());
        }
        if self.max_containers == 0 {
            errors.push("MAX_CONTAINERS must be positive, got 0".to_owned());
        }
        if self.upload_timeout == 0 {
            errors.push("UPLOAD_TIMEOUT must be positive, got 0".to_owned());
        }
        if self.idle_timeout_seconds == 0 {
            errors.push("IDLE_TIMEOUT_SECONDS must be positive, got 0".to_owned());
        }
        if self.cleanup_interval_seconds == 0 {
            errors.push("CLEANUP_INTERVAL_SECONDS must be positive, got 0".to_owned());
        }
        if self.resource_check_interval == 0 {
            errors.push("RESOURCE_CHECK_INTERVAL must be positive, got 0".to_owned());
        }
        if self.matchmaker_timeout == 0 {
            errors.push("MATCHMAKER_TIMEOUT must be positive, got 0".to_owned());
        }
        if self.max_error_count == 0 {
            errors.push("MAX_ERROR_COUNT must be positive, got 0".to_owned());
        }
        if self.container_cpu_limit <= 0.0 {
            errors.push(format!(
                "CONTAINER_CPU_LIMIT must be positive, got {}",
                self.container_cpu_limit
            ));
        }
        if parse_memory_limit(&self.container_memory_limit).is_none() {
            errors.push(format!(
                "CONTAINER_MEMORY_LIMIT is not a valid size: {}",
                self.container_memory_limit
            ));
        }
        if self.api_rate_limit == 0 {
            errors.push("API_RATE_LIMIT must be positive, got 0".to_owned());
        }
        errors
    }
}

/// Parse a docker-style memory size (`512m`, `1g`, `131072k`, plain bytes)
/// into bytes.
pub fn parse_memory_limit(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (digits, multiplier) = match trimmed.chars().last()? {
        'k' | 'K' => (&trimmed[..trimmed.len() - 1], 1024i64),
        'm' | 'M' => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        'g' | 'G' => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        '0'..='9' => (trimmed, 1),
        _ => return None,
    };
    let value: i64 = digits.parse().ok()?;
    (value > 0).then_some(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limits_parse() {
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("2048"), Some(2048));
        assert_eq!(parse_memory_limit("lots"), None);
        assert_eq!(parse_memory_limit("0m"), None);
    }
}
