//! Tracing subscriber set-up.
//!
//! Console output goes to stderr so command output on stdout stays clean.
//! A daily-rotated file layer is added when `logging.directory` is set.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};

pub const LOG_FILE_PREFIX: &str = "iac-runner.log";

/// Build the filter from `RUST_LOG` when set, otherwise from `level` plus
/// quieter defaults for chatty dependencies.
pub fn build_env_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut directives = vec![level.to_string()];
    for (target, lvl) in [
        ("hyper", "warn"),
        ("hyper_util", "warn"),
        ("reqwest", "warn"),
        ("h2", "warn"),
    ] {
        directives.push(format!("{}={}", target, lvl));
    }
    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("Invalid tracing filter '{}': {}", filter_str, e))
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. Returns `None` when file logging is disabled.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let console_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(build_env_filter(&config.level)?)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(build_env_filter(&config.level)?)
            .boxed(),
    };

    let (file_layer, guard) = if config.directory.trim().is_empty() {
        (None, None)
    } else {
        std::fs::create_dir_all(&config.directory)?;
        let appender = tracing_appender::rolling::daily(&config.directory, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_filter(build_env_filter(&config.level)?)
            .boxed();
        (Some(layer), Some(guard))
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {}", e))?;

    tracing::debug!(
        level = %config.level,
        file = !config.directory.is_empty(),
        "logging initialized"
    );
    Ok(guard)
}
