use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Rotated log files kept on disk (one per day).
pub const LOG_FILES_KEPT: usize = 7;

/// Install the global subscriber: stderr plus a daily-rotated `login.*.log`.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// process lifetime. When the log directory is unusable, logging falls back
/// to stderr only and `None` is returned.
pub fn init_tracing(log_dir: &Path) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let appender = std::fs::create_dir_all(log_dir)
        .map_err(|e| e.to_string())
        .and_then(|_| {
            RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("login")
                .filename_suffix("log")
                .max_log_files(LOG_FILES_KEPT)
                .build(log_dir)
                .map_err(|e| e.to_string())
        });

    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        Err(e) => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init();
            tracing::warn!(
                "log directory {} unusable ({}); logging to stderr only",
                log_dir.display(),
                e
            );
            None
        }
    }
}
