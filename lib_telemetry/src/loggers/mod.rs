//! # Logging Setup
//!
//! Installs the global `tracing` subscriber used by the binaries:
//!
//! - an `EnvFilter` taken from `RUST_LOG`, falling back to the configured level,
//! - a human-readable console layer,
//! - optionally, a JSON layer writing to a daily-rotated file through a
//!   non-blocking appender.
//!
//! The returned [`LoggingGuard`] owns the appender's worker guard. Keep it
//! alive for the lifetime of the process, otherwise buffered file output is lost.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::io;
use std::path::PathBuf;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Filter directive used when `RUST_LOG` is unset.
    pub default_level: String,
    /// Directory for JSON log files. `None` disables file output.
    pub log_dir: Option<PathBuf>,
    /// Base file name for the rolling appender.
    pub file_prefix: String,
    /// Emit ANSI colors on the console.
    pub ansi: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            default_level: "info".to_string(),
            log_dir: None,
            file_prefix: "telemetry".to_string(),
            ansi: true,
        }
    }
}

/// Keeps the non-blocking file writer alive.
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Builds the env filter: `RUST_LOG` wins, then `default_level`, then `info`.
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber.
///
/// Fails if the log directory cannot be created or a global subscriber is
/// already installed.
pub fn setup_logging(options: &LogOptions) -> io::Result<LoggingGuard> {
    let console_layer = fmt::layer().with_target(true).with_ansi(options.ansi);

    let (file_layer, guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = rolling::daily(dir, &options.file_prefix);
            let (writer, guard) = non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).json();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter(&options.default_level))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e))?;

    info!(
        level = %options.default_level,
        log_dir = ?options.log_dir,
        "logging initialized"
    );
    Ok(LoggingGuard { _file: guard })
}
