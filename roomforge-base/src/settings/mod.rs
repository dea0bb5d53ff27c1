//! Settings and configuration for roomforge agents
//!
//! Both agents read their configuration from the process environment (after
//! an optional `.env` file load). Environment variable names map 1:1 onto
//! the flat settings struct fields, e.g. `MAX_FILE_SIZE` configures
//! `max_file_size`. Values are plain strings in the environment and are
//! parsed into their typed fields by the loader.
//!
//! All agents share the [`AppSettings`] block (host/port, environment,
//! logging, CORS, metrics) and then define any additional settings in their
//! own crate, flattened alongside it. Validation collects every violation
//! so a misconfigured process prints the full list before refusing to
//! start.

use std::net::SocketAddr;

use axum::http::{HeaderValue, Method};
use config::{Config, ConfigError, Environment as ConfigEnvironment};
use eyre::Report;
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

mod trace;
pub use trace::*;

/// Deployment environment of a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development; permissive CORS, detailed errors.
    #[default]
    Development,
    /// Pre-production.
    Staging,
    /// Production; restricted CORS, generic internal errors.
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        };
        f.write_str(s)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_log_max_size() -> u64 {
    10 * 1024 * 1024
}

fn default_log_backup_count() -> u32 {
    5
}

fn default_allowed_origins() -> Vec<String> {
    vec!["*".to_owned()]
}

/// Settings shared by every agent. Usually embedded with `#[serde(flatten)]`
/// into an agent-specific settings struct.
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    /// Interface to bind the HTTP server on.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind the HTTP server on. The per-agent loader supplies the
    /// default.
    pub port: u16,
    /// Debug mode: detailed error payloads, permissive behavior.
    #[serde(default)]
    pub debug: bool,
    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,
    /// Minimum log level.
    #[serde(default)]
    pub log_level: LogLevel,
    /// Log file path; when set, logs are also written there.
    #[serde(default)]
    pub log_file: Option<String>,
    /// Nominal log file size ceiling in bytes.
    #[serde(default = "default_log_max_size")]
    pub log_max_size: u64,
    /// Number of rotated log files to keep.
    #[serde(default = "default_log_backup_count")]
    pub log_backup_count: u32,
    /// CORS origin allowlist; `*` is only honored outside production.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Port to serve prometheus metrics on; metrics are not served when
    /// unset.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl AppSettings {
    /// Collect every violation in the shared settings block.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !(1024..=65535).contains(&self.port) {
            errors.push(format!(
                "PORT must be between 1024 and 65535, got {}",
                self.port
            ));
        }
        if let Some(metrics_port) = self.metrics_port {
            if !(1024..=65535).contains(&metrics_port) {
                errors.push(format!(
                    "METRICS_PORT must be between 1024 and 65535, got {metrics_port}"
                ));
            }
        }
        if self.log_max_size == 0 {
            errors.push("LOG_MAX_SIZE must be positive, got 0".to_owned());
        }
        errors
    }

    /// The socket address the HTTP server binds.
    pub fn socket_addr(&self) -> eyre::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    /// Whether this process runs in production mode.
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Cross-origin policy: permissive outside production; in production,
    /// only the configured origins are allowed and a literal `*` entry is
    /// rejected (yielding an empty allowlist).
    pub fn cors_layer(&self) -> CorsLayer {
        if !self.is_production() {
            return CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
        }

        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter(|origin| origin.as_str() != "*")
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(Any)
    }
}

/// Settings of an agent.
pub trait NewFromSettings: AsRef<AppSettings> + Sized {
    /// The error type returned by new on failures to parse.
    type Error: Into<Report>;

    /// Create a new instance of these settings by reading the environment.
    fn new() -> std::result::Result<Self, Self::Error>;

    /// Collect configuration violations; agents extend the shared checks.
    fn validate(&self) -> Vec<String> {
        self.as_ref().validate()
    }
}

/// Build the environment-backed configuration source shared by all agents.
///
/// `defaults` supplies per-agent numeric fallback values (at minimum the
/// listen port) keyed by the lowercase settings field name.
pub fn load_settings_object<'de, T: Deserialize<'de>>(
    defaults: &[(&str, i64)],
) -> eyre::Result<T> {
    let mut builder = Config::builder().add_source(
        ConfigEnvironment::default()
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("allowed_origins")
            .with_list_parse_key("allowed_extensions"),
    );
    for (key, value) in defaults {
        builder = builder.set_default(*key, *value).map_err(config_report)?;
    }
    let config = builder.build().map_err(config_report)?;
    Ok(serde_path_to_error::deserialize(config)?)
}

fn config_report(err: ConfigError) -> Report {
    Report::new(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(port: u16, environment: Environment) -> AppSettings {
        AppSettings {
            host: default_host(),
            port,
            debug: false,
            environment,
            log_level: LogLevel::default(),
            log_file: None,
            log_max_size: default_log_max_size(),
            log_backup_count: default_log_backup_count(),
            allowed_origins: default_allowed_origins(),
            metrics_port: None,
        }
    }

    #[test]
    fn port_range_is_validated() {
        let errors = settings(80, Environment::Development).validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("PORT"));

        assert!(settings(8080, Environment::Development)
            .validate()
            .is_empty());
    }

    #[test]
    fn environment_parses_lowercase() {
        let env: Environment = serde_json::from_str("\"production\"").unwrap();
        assert_eq!(env, Environment::Production);
    }
}
