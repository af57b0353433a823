//! Log setup.
//!
//! Logs go to a file in the system temp directory so the live tables on
//! stdout stay readable. `RUST_LOG` overrides the level from the command
//! line.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogLevel;

pub const LOG_FILE_NAME: &str = "reachprobe.log";

/// Keeps the background log writer alive; flushes pending lines on drop.
pub struct LogGuard {
    _worker: WorkerGuard,
    pub path: PathBuf,
}

pub fn log_path() -> PathBuf {
    env::temp_dir().join(LOG_FILE_NAME)
}

/// Installs the global subscriber. Call once at process start and hold the
/// returned guard until exit.
pub fn init_logging(level: LogLevel) -> Result<LogGuard> {
    let path = log_path();
    let file_appender = tracing_appender::rolling::never(env::temp_dir(), LOG_FILE_NAME);
    let (writer, worker) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .context("failed to build log filter")?
        .add_directive("hyper=info".parse()?)
        .add_directive("reqwest=info".parse()?);

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init()
        .context("failed to install log subscriber")?;

    tracing::info!(level = level.as_str(), file = %path.display(), "logging initialized");
    Ok(LogGuard {
        _worker: worker,
        path,
    })
}
