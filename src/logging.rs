//! Tracing setup: stderr always, plus a daily-rolling file when configured.
//!
//! `RUST_LOG` takes precedence over the configured filter.

use color_eyre::{eyre::eyre, Result};
use std::fs;
use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub const LOG_FILE_PREFIX: &str = "fleetwatch.log";

/// Keep alive for the life of the process; dropping it flushes the file writer.
pub struct LoggingGuard {
  _file_guard: Option<WorkerGuard>,
}

pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
  let filter = build_filter(std::env::var("RUST_LOG").ok().as_deref(), &config.filter)?;

  let (file_layer, file_guard) = match &config.directory {
    Some(dir) => {
      fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;
      let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to init tracing subscriber: {}", e))?;

  Ok(LoggingGuard {
    _file_guard: file_guard,
  })
}

fn build_filter(env_override: Option<&str>, configured: &str) -> Result<EnvFilter> {
  let directives = env_override
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .unwrap_or(configured);

  EnvFilter::try_new(directives).map_err(|e| eyre!("Invalid log filter '{}': {}", directives, e))
}
