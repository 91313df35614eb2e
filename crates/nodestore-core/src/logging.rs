//! Tracing subscriber setup for the embedding process.
//!
//! Store components only emit through `tracing` macros. The process that owns
//! the store calls [`init_logging`] once with the `[logging]` section of its
//! [`StoreConfig`](crate::config::StoreConfig).
//!
//! Field names used across the crate: `step` (reconcile step), `imsi`,
//! `category` (retention), `revision` (fleet revision), `kind` (telemetry
//! event kind).
//!
//! **Subscriber keys and OPc values are never logged.**

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (`info`, `nodestore_core=debug`, ...). `RUST_LOG`
    /// takes precedence when set.
    pub level: String,

    pub format: LogFormat,

    /// Append to this file instead of writing to stderr
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log filter {directive:?}: {reason}")]
    Filter { directive: String, reason: String },

    #[error("failed to open log file: {0}")]
    File(#[from] io::Error),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn env_filter(config: &LogConfig) -> Result<EnvFilter, LogError> {
    let directive = std::env::var(EnvFilter::DEFAULT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| config.level.clone());
    EnvFilter::try_new(&directive).map_err(|e| LogError::Filter {
        directive,
        reason: e.to_string(),
    })
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

fn format_layer(format: LogFormat, writer: BoxMakeWriter, ansi: bool) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .flatten_event(true)
            .boxed(),
    }
}

/// Build the subscriber described by `config` without installing it.
pub fn build_subscriber(config: &LogConfig) -> Result<impl Subscriber + Send + Sync, LogError> {
    let filter = env_filter(config)?;
    let (writer, ansi) = match &config.file {
        Some(path) => (BoxMakeWriter::new(Mutex::new(open_log_file(path)?)), false),
        None => (BoxMakeWriter::new(io::stderr), true),
    };
    Ok(tracing_subscriber::registry().with(format_layer(config.format, writer, ansi).with_filter(filter)))
}

/// Install the subscriber for `config` as the process-wide default.
///
/// A second call returns [`LogError::AlreadyInitialized`].
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let subscriber = build_subscriber(config)?;
    tracing::subscriber::set_global_default(subscriber).map_err(|_| LogError::AlreadyInitialized)?;
    tracing::info!(
        level = %config.level,
        format = %config.format,
        file = ?config.file,
        "logging initialized"
    );
    Ok(())
}
