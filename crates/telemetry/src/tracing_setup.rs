//! Structured logging setup for the broker.
//!
//! Diagnostics go through `tracing`; hot-path events carry structured
//! fields (`partition = %tp, offset = o`) rather than formatted strings.
//! The subscriber is installed once at startup, either human-readable for
//! interactive runs or JSON lines for log shippers.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for broker logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Single-line text for terminals.
    #[default]
    Text,
    /// JSON lines, one event per line.
    Json,
}

impl LogFormat {
    /// `LOG_JSON=1` (or `true`) selects JSON output.
    fn from_env() -> Self {
        match std::env::var("LOG_JSON") {
            Ok(v) if v == "1" || v.eq_ignore_ascii_case("true") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Installs the global subscriber. `default_filter` uses `EnvFilter`
/// syntax (e.g. "info" or "brokernode=debug,storage=trace"); a set
/// `RUST_LOG` overrides it.
pub fn init_tracing(default_filter: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            // Shipped logs get call sites and thread ids; the broker id
            // and partition ride in the structured fields themselves.
            let layer = fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
        LogFormat::Text => {
            let layer = fmt::layer().with_target(true);
            tracing_subscriber::registry().with(filter).with(layer).init();
        }
    }
    tracing::debug!(?format, "Tracing initialized");
}

/// Environment-driven setup used by the binary: `RUST_LOG` for the
/// filter, `LOG_JSON` for the format.
pub fn init_tracing_from_env() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    init_tracing(&filter, LogFormat::from_env());
}
