use crate::config::EngineConfig;
use crate::errors::{AppError, AppResult};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "keepnotes-engine.log";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// `RUST_LOG` when set, otherwise the configured `logLevel`.
pub fn log_filter(config: &EngineConfig) -> AppResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(config.log_level.trim())
        .map_err(|error| AppError::Config(format!("invalid logLevel \"{}\": {}", config.log_level, error)))
}

/// Installs the global JSON subscriber. Events go to a daily rotated file in
/// the resolved log directory, or to stderr when the engine has none.
pub fn init_tracing(config: &EngineConfig) -> AppResult<()> {
    let filter = log_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).json();
    let installed = match config.resolved_log_dir() {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);
            builder.with_writer(non_blocking).try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    installed.map_err(|error| AppError::Internal(format!("tracing subscriber not installed: {}", error)))
}
