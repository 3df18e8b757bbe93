//! Logging bootstrap for the binaries
//!
//! Console output always; a daily-rolling file in addition when a log
//! directory is configured. `RUST_LOG` overrides the configured filter.

use crate::config::LoggingConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init(config: &LoggingConfig, file_prefix: &str) -> anyhow::Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let console_layer = fmt::layer().with_target(false);

    let Some(directory) = config.directory.as_deref() else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .try_init()?;
        return Ok(None);
    };

    std::fs::create_dir_all(directory)?;
    let file_appender = tracing_appender::rolling::daily(directory, file_prefix);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_target(true).with_ansi(false).with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!("logging to {}", directory.display());
    let removed = cleanup_old_logs(directory, file_prefix, config.retention_days, chrono::Local::now().date_naive());
    if removed > 0 {
        tracing::info!("removed {} old log file(s)", removed);
    }
    Ok(Some(guard))
}

/// Delete `<prefix>.YYYY-MM-DD` files dated before `today - keep_days`
pub fn cleanup_old_logs(directory: &Path, prefix: &str, keep_days: i64, today: chrono::NaiveDate) -> usize {
    let cutoff = today - chrono::Duration::days(keep_days);
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("cannot read log directory for cleanup: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(prefix))
            .and_then(|n| n.strip_prefix('.'))
            .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if date < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("cannot remove old log {}: {}", path.display(), e),
            }
        }
    }
    removed
}
