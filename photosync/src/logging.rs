//! Subscriber setup for the `photosync` binary.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the binary or embedder. `RUST_LOG`, when set, replaces the configured level.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("failed to open log file {path}: {source}")]
    File { path: PathBuf, source: io::Error },
    #[error("failed to initialize logging: {0}")]
    Init(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Multi-line, human oriented.
    Pretty,
    /// One line per event.
    #[default]
    Compact,
    /// One JSON object per event.
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Level for this workspace's crates; dependencies stay at `warn`.
    pub level: String,
    /// Append events here instead of stderr.
    pub file: Option<PathBuf>,
    pub display_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "info".to_string(),
            file: None,
            display_target: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_file(mut self, file: Option<PathBuf>) -> Self {
        self.file = file;
        self
    }
}

pub fn init_logging(config: LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_filter(&config)?;
    let (writer, ansi) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::File {
                    path: path.clone(),
                    source,
                })?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(ansi)
                    .with_target(config.display_target)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(ansi)
                    .with_target(config.display_target)
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_target(config.display_target)
                    .with_writer(writer),
            )
            .try_init(),
    };
    result.map_err(|err| LoggingError::Init(err.to_string()))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directives(&config.level))
        .map_err(|err| LoggingError::Filter(err.to_string()))
}

fn default_directives(level: &str) -> String {
    format!("warn,photosync={level},photosync_remote={level},sqlx=warn,reqwest=warn")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_scope_level_to_workspace_crates() {
        let directives = default_directives("debug");
        assert!(directives.starts_with("warn,"));
        assert!(directives.contains("photosync=debug"));
        assert!(directives.contains("photosync_remote=debug"));
        assert!(EnvFilter::try_new(directives).is_ok());
    }

    #[test]
    fn bogus_level_is_rejected() {
        assert!(EnvFilter::try_new(default_directives("loud!")).is_err());
    }
}
