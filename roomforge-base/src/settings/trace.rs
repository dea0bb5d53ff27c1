use std::path::Path;

use eyre::Result;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::prelude::*;

use super::AppSettings;

/// Logging level. Mirrors the classic five-level scheme configured through
/// `LOG_LEVEL`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Everything.
    #[serde(alias = "debug")]
    Debug,
    /// Normal operation (default).
    #[default]
    #[serde(alias = "info")]
    Info,
    /// Problems worth attention.
    #[serde(alias = "warning")]
    Warning,
    /// Failures.
    #[serde(alias = "error")]
    Error,
    /// Only the worst failures.
    #[serde(alias = "critical")]
    Critical,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> LevelFilter {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

impl AppSettings {
    /// Attempt to instantiate and register a tracing subscriber setup from
    /// settings: stdout, an error layer, and an optional rolling log file.
    pub fn start_tracing(&self) -> Result<()> {
        let level: LevelFilter = self.log_level.into();

        let mut target_layer = Targets::new().with_default(level);
        if level < LevelFilter::TRACE {
            // Reduce log noise from trusted libraries that we can reasonably
            // assume are working correctly
            target_layer = target_layer
                .with_target("hyper", LevelFilter::INFO)
                .with_target("reqwest", LevelFilter::INFO)
                .with_target("bollard", LevelFilter::INFO)
                .with_target("tower_http", LevelFilter::INFO);
        }

        let fmt_layer = tracing_subscriber::fmt::layer();
        let err_layer = tracing_error::ErrorLayer::default();

        let registry = tracing_subscriber::registry()
            .with(target_layer)
            .with(fmt_layer)
            .with(err_layer);

        if let Some(log_file) = &self.log_file {
            let path = Path::new(log_file);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| log_file.clone());
            let appender = tracing_appender::rolling::daily(
                dir.unwrap_or_else(|| Path::new(".")),
                file_name,
            );
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender);
            registry.with(file_layer).try_init()?;
        } else {
            registry.try_init()?;
        }
        Ok(())
    }
}
