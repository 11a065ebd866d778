//! Logging setup and span helpers
//!
//! `RUST_LOG` overrides the default filter (`kyc_operator=debug,info`).

use alloy_primitives::U256;
use std::fmt;
use std::str::FromStr;
use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt as fmt_layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

const DEFAULT_FILTER: &str = "kyc_operator=debug,info";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{}', expected json or pretty", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Json => f.write_str("json"),
            LogFormat::Pretty => f.write_str("pretty"),
        }
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer::layer())
                    .init();
            }
        }
    });
}

/// Span carried by every log line about one task.
#[must_use]
pub fn task_span(task_id: U256) -> Span {
    tracing::info_span!("task", task_id = %task_id)
}

/// Span for a worker's whole lifetime.
#[must_use]
pub fn worker_span(worker_id: usize) -> Span {
    tracing::info_span!("worker", id = worker_id)
}
