//! Tracing setup for gateway binaries.
//!
//! Two presets: `pretty` (ANSI, human-oriented, the dev default) and
//! `json` (one object per line, selected automatically when stdout is
//! not a TTY or via `LOG_FORMAT=json`).

use gateway_core::{Error, Result};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Output format for the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// ANSI-coloured, human-readable.
    Pretty,
    /// Newline-delimited JSON objects.
    Json,
}

impl LogFormat {
    /// Resolve the format from `LOG_FORMAT`, falling back to TTY detection.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT").as_deref() {
            Ok("json") => Self::Json,
            Ok("pretty") => Self::Pretty,
            _ if std::io::IsTerminal::is_terminal(&std::io::stdout()) => Self::Pretty,
            _ => Self::Json,
        }
    }
}

/// Install the global tracing subscriber. Call once at process start.
///
/// `RUST_LOG` is parsed strictly: an invalid filter is reported as an
/// [`Error::InternalError`] rather than silently discarded in favour of
/// a default. Installing a second global subscriber in the same
/// process is likewise reported rather than panicking.
pub fn init() -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::try_from_default_env()
            .map_err(|e| Error::internal(format!("invalid RUST_LOG filter: {e}")))?,
        Err(_) => EnvFilter::new("info"),
    };

    let result = match LogFormat::from_env() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init(),
    };

    result.map_err(|e| Error::internal(format!("failed to install tracing subscriber: {e}")))
}
