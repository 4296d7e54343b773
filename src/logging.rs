//! KN-011: Diagnostic logging setup.
//!
//! Diagnostics go to stderr so stdout stays clean for plans, status tables
//! and JSON output. `RUST_LOG` wins over `--log-level` when set.

use std::str::FromStr;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Expand a bare level into a filter that keeps dependency noise down.
/// Directive strings (containing ',' or '=') are used as-is.
pub fn filter_spec(log_level: &str) -> String {
    let normalized = log_level.trim();
    if normalized.contains(',') || normalized.contains('=') {
        normalized.to_string()
    } else {
        format!("{},rusqlite=warn", normalized)
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn setup_logging(log_level: &str, json_format: bool) {
    let spec = filter_spec(log_level);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::from_str(&spec))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = if json_format {
        let json_layer = fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(true)
            .with_writer(std::io::stderr);
        subscriber.with(json_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact();
        subscriber.with(fmt_layer).try_init()
    };

    if installed.is_ok() {
        tracing::debug!(
            filter = %spec,
            format = if json_format { "json" } else { "compact" },
            "logging initialized"
        );
    }
}
