//! provides logging helpers

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

const LOG_FILE_PREFIX: &str = "vgpu-scheduler.log";

fn env_filter() -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy()
}

/// initiate the global tracing subscriber
///
/// Logs always go to stderr. When `log_dir` is set, the same events are also
/// written to a daily rotated file in that directory; keep the returned guard
/// alive for as long as the file writer must flush.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let stderr_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter());

    let Some(log_dir) = log_dir else {
        registry().with(stderr_layer).init();
        return None;
    };

    let appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(3)
        .build(log_dir)
    {
        Ok(appender) => appender,
        Err(e) => {
            registry().with(stderr_layer).init();
            tracing::warn!(
                log_dir = %log_dir.display(),
                error = %e,
                "Failed to create rolling log file, logging to stderr only"
            );
            return None;
        }
    };

    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let file_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(env_filter());

    registry().with(stderr_layer).with(file_layer).init();
    Some(file_guard)
}
