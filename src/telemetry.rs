//! Tracing initialisation for the patchwork binary.
//!
//! Human-readable logs go to stderr; when a log directory is available a
//! daily-rolling file under `.patchwork/logs/` receives the same events.
//! `RUST_LOG` overrides the default level.

use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

/// File name prefix of the rolling log.
pub const LOG_FILE_PREFIX: &str = "patchwork.log";

/// Options for [`init_tracing`].
#[derive(Debug, Clone, Copy)]
pub struct TelemetryOptions {
    pub level: Level,
    /// Emit newline-delimited JSON on stderr
    pub json: bool,
}

impl TelemetryOptions {
    pub fn from_verbosity(verbose: bool, json: bool) -> Self {
        Self {
            level: if verbose { Level::DEBUG } else { Level::WARN },
            json,
        }
    }
}

/// Install the global subscriber.
///
/// Returns the appender guard when file logging is active; dropping it flushes
/// the file writer, so the caller keeps it alive for the life of the process.
/// Only the first call in a process takes effect.
pub fn init_tracing(options: TelemetryOptions, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = || {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("patchwork={}", options.level)))
    };

    let stderr_layer = if options.json {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .json()
            .with_filter(env_filter())
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(env_filter())
            .boxed()
    };

    let (file_layer, guard) = match log_dir.filter(|d| d.is_dir()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("patchwork=info")),
                )
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .ok();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(TelemetryOptions::from_verbosity(true, false).level, Level::DEBUG);
        assert_eq!(TelemetryOptions::from_verbosity(false, false).level, Level::WARN);
    }

    #[test]
    fn test_init_without_log_dir_is_repeatable() {
        let opts = TelemetryOptions::from_verbosity(false, false);
        assert!(init_tracing(opts, None).is_none());
        assert!(init_tracing(opts, None).is_none());
    }
}
