//! Tracing setup: stderr plus an optional daily-rotated JSON log file.

use std::fs;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogSection;

/// Build the filter: `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Keep the returned guard alive for the life
/// of the process so buffered file output is flushed on exit.
pub fn init(log: &LogSection) -> Result<Option<WorkerGuard>> {
    let console = if log.json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&log.level))
            .boxed()
    } else {
        fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter(&log.level))
            .boxed()
    };

    let (file_layer, guard) = match &log.dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "futureproof.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter(&log.level))
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    if tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already installed");
    }
    Ok(guard)
}
