//! Tracing subscriber setup.
//!
//! The level is taken from `RUST_LOG` when set:
//!
//! ```bash
//! RUST_LOG=debug etude 8080
//! RUST_LOG=etude_core=debug,etude_site=info etude 8080
//! ```

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log to stdout at `info` unless `RUST_LOG` says otherwise.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Log to stdout with `level` as the fallback filter.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// Log to stdout and to a daily-rolling file `dir/prefix.YYYY-MM-DD`.
///
/// File writes go through a background thread so the reactor never blocks
/// on disk. Keep the returned guard alive for the life of the process;
/// dropping it flushes and stops the writer.
///
/// # Panics
///
/// Panics if a global subscriber is already installed.
pub fn init_file_logging(dir: impl AsRef<Path>, prefix: &str) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let appender = tracing_appender::rolling::daily(dir.as_ref(), prefix);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();

    guard
}
