//! # roomcast-logging
//!
//! Structured logging with `tracing`.
//!
//! [`init_subscriber`] installs the global subscriber once at startup:
//! an [`EnvFilter`] built from the configured level (`RUST_LOG` wins when
//! set) feeding either a human-readable or a JSON-lines fmt layer.

#![deny(unsafe_code)]

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Output format for log lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, one event per line.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Pick the format from a `json` flag.
    pub fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Pretty }
    }
}

/// Build the event filter.
///
/// `RUST_LOG` takes precedence; otherwise `level` is used as the directive,
/// falling back to `info` if it does not parse.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global tracing subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_subscriber(level: &str, format: LogFormat) -> Result<(), TryInitError> {
    let filter = build_filter(level);
    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(fmt_layer).try_init()
}
