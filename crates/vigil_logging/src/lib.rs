//! Shared logging utilities for Vigil binaries.
//!
//! File output is daily-rotated and written off the hot path by a
//! background worker; scan workers log per-task progress at info level and
//! must never stall on disk I/O. The stderr layer stays quiet (warn) unless
//! verbose mode mirrors the file filter.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "vigil=info,vigil_scanner=info,vigil_updater=info";
/// Rotated daily; a week of files covers the job-state retention window.
const MAX_LOG_FILES: usize = 7;

/// Logging configuration shared by Vigil binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Keeps the background log writer alive; dropping it flushes and stops the
/// worker. Hold it for the life of the process.
pub struct LogGuard {
    _worker: WorkerGuard,
}

/// Initialize tracing: daily-rotating file output under `~/.vigil/logs`
/// plus a stderr layer.
pub fn init_logging(config: LogConfig<'_>) -> Result<LogGuard> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(config.app_name)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(&log_dir)
        .context("Failed to initialize rolling log writer")?;
    let (file_writer, worker) = tracing_appender::non_blocking(file_appender);

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(LogGuard { _worker: worker })
}

/// Get the Vigil home directory: ~/.vigil
pub fn vigil_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("VIGIL_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".vigil")
}

/// Get the logs directory: ~/.vigil/logs
pub fn logs_dir() -> PathBuf {
    vigil_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn home_override_drives_all_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("VIGIL_HOME", dir.path());

        assert_eq!(vigil_home(), dir.path());
        assert_eq!(logs_dir(), dir.path().join("logs"));

        let logs = ensure_logs_dir().unwrap();
        assert!(logs.is_dir());

        std::env::remove_var("VIGIL_HOME");
    }
}
