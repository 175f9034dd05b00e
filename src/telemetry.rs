//! Tracing subscriber setup for hosts embedding the control plane.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! host's call. These helpers give every host the same output: JSON for
//! production log pipelines, pretty for local development.

use std::str::FromStr;

use tracing_subscriber::fmt::{self, format::FmtSpan};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "masterchef_control=info";

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One flattened JSON object per event.
    #[default]
    Json,
    /// Human-readable multi-line output.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(Error::validation(format!("unknown log format \"{other}\""))),
        }
    }
}

impl LogFormat {
    /// Read `LOG_FORMAT`; anything unrecognized means JSON.
    pub fn from_env() -> Self {
        std::env::var("LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }
}

/// Install the global subscriber, failing if one is already set.
pub fn try_init_tracing(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_target(true).with_span_events(FmtSpan::CLOSE))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .try_init(),
    };
    installed.map_err(|e| Error::validation(format!("tracing subscriber already installed: {e}")))
}

/// Install the global subscriber, keeping an existing one if present.
pub fn init_tracing(format: LogFormat) {
    if let Err(err) = try_init_tracing(format) {
        tracing::debug!(error = %err, "tracing not re-initialized");
    }
}
