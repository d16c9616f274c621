use std::fs;
use std::path::Path;

use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::errors::{RelayError, RelayResult};

/// `RUST_LOG` when set and valid, otherwise `default_level`.
pub fn build_filter(default_level: &str) -> RelayResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| RelayError::FatalConfig(format!("invalid log level {:?}: {}", default_level, e)))
}

/// Builds the relay subscriber without installing it: ANSI console output
/// plus JSON lines in `log_dir/<app_name>.<date>`, rotated daily.
///
/// The returned guard flushes the file writer when dropped.
pub fn build_subscriber(
    log_dir: &Path,
    app_name: &str,
    default_level: &str,
) -> RelayResult<(impl Subscriber + Send + Sync + 'static, WorkerGuard)> {
    fs::create_dir_all(log_dir)
        .map_err(|e| RelayError::FatalConfig(format!("cannot create log dir {}: {}", log_dir.display(), e)))?;

    let file_appender = rolling::daily(log_dir, app_name);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let subscriber = tracing_subscriber::registry()
        .with(build_filter(default_level)?)
        .with(console_layer)
        .with(file_layer);
    Ok((subscriber, guard))
}

/// Installs the subscriber from [`build_subscriber`] as the global default.
///
/// The caller keeps the returned guard alive until exit. A second call fails
/// with `FatalConfig`.
pub fn setup_logging(log_dir: &Path, app_name: &str, default_level: &str) -> RelayResult<WorkerGuard> {
    let (subscriber, guard) = build_subscriber(log_dir, app_name, default_level)?;
    subscriber
        .try_init()
        .map_err(|e| RelayError::FatalConfig(format!("logging already initialized: {}", e)))?;

    tracing::info!(log_dir = %log_dir.display(), "Logging initialized with level: {}", default_level);
    Ok(guard)
}
