//! Logging setup
//!
//! The crate itself only emits `tracing` events. Applications embedding the
//! client can call one of these helpers once at startup to get console
//! output (and optionally a daily rolling log file) filtered through
//! `RUST_LOG`.

use crate::error::{Result, SmaxError};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,smax_client=debug";

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install a console subscriber.
///
/// Fails if a global subscriber has already been set.
pub fn init(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
        .map_err(|e| SmaxError::Config(format!("Failed to install logger: {}", e)))
}

/// Install a console subscriber plus a daily rolling file in `dir`.
///
/// The returned guard flushes the file writer when dropped; keep it alive
/// for the lifetime of the program.
pub fn init_with_file(
    dir: impl AsRef<Path>,
    file_prefix: &str,
    default_filter: &str,
) -> Result<WorkerGuard> {
    let appender = tracing_appender::rolling::daily(dir.as_ref(), file_prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .try_init()
        .map_err(|e| SmaxError::Config(format!("Failed to install logger: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        let _ = init(DEFAULT_FILTER);
        let err = init(DEFAULT_FILTER).unwrap_err();
        assert!(matches!(err, SmaxError::Config(_)));
    }

    #[test]
    fn test_env_filter_falls_back_to_default() {
        let filter = env_filter("warn");
        assert!(!filter.to_string().is_empty());
    }
}
