//! Subscriber setup for binaries and tests.
//!
//! Library code only emits `tracing` events; installing a subscriber is left to the
//! process entry point. `RUST_LOG` takes precedence over the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

/// Level used when neither `RUST_LOG` nor the configuration yields a valid filter.
const FALLBACK_LEVEL: &str = "info";

/// Build the event filter for `config`.
pub fn filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}

/// Install the global subscriber.
///
/// Logs go to stdout, and additionally to `config.file` (appended, no ANSI colours)
/// when set. Returns `false` if a subscriber was already installed, which makes
/// repeated calls harmless.
pub fn init(config: &LoggingConfig) -> bool {
    let mut problems = Vec::new();

    if EnvFilter::try_new(&config.level).is_err() {
        problems.push(format!("invalid log level {:?}, using {FALLBACK_LEVEL}", config.level));
    }

    let file_layer = config.file.as_ref().and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            Err(e) => {
                problems.push(format!("cannot open log file {}: {e}", path.display()));
                None
            }
        }
    });

    let installed = tracing_subscriber::registry()
        .with(filter(config))
        .with(fmt::layer().with_target(true))
        .with(file_layer)
        .try_init()
        .is_ok();

    for problem in problems {
        tracing::warn!("{}", problem);
    }
    if installed {
        tracing::debug!(level = %config.level, file = ?config.file, "Logging initialised");
    }
    installed
}
