//! Tracing subscriber setup
//!
//! Logs go to stdout by default. Pointing `CPU_MANAGER_LOG_PATH` at a file
//! or directory switches to a daily-rotated file appender; the level is
//! controlled through `CPU_MANAGER_LOG_LEVEL` (INFO when unset).

use std::env;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_PATH_ENV_VAR: &str = "CPU_MANAGER_LOG_PATH";
const LOG_LEVEL_ENV_VAR: &str = "CPU_MANAGER_LOG_LEVEL";
const DEFAULT_LOG_PREFIX: &str = "cpu-manager.log";
const MAX_LOG_FILES: usize = 7;

// The non-blocking writer stops flushing once its guard drops; park it for
// the process lifetime.
static LOG_WORKER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Call once, early in startup.
pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    match env::var(LOG_PATH_ENV_VAR).ok().map(PathBuf::from) {
        Some(path) => {
            let (directory, prefix) = if path.is_dir() {
                (path, DEFAULT_LOG_PREFIX.to_string())
            } else {
                let prefix = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| DEFAULT_LOG_PREFIX.to_string());
                let directory = path.parent().map(PathBuf::from).unwrap_or_default();
                (directory, prefix)
            };

            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(prefix)
                .max_log_files(MAX_LOG_FILES)
                .build(directory)
                .expect("failed to create rolling file appender");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = LOG_WORKER_GUARD.set(guard);

            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .with(filter)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(std::io::stdout))
                .with(filter)
                .init();
        }
    }
}
