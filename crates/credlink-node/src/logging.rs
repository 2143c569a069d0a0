//! Log output for the node and the simulator.
//!
//! Levels used across the crates:
//! - ERROR: link-layer hardware faults
//! - WARN: rejected opens, discarded or malformed notifications, truncation,
//!   requests the link layer refused
//! - INFO: channel lifecycle (opened, closed, torn down, abandoned)
//! - DEBUG: credit grants and updates, requeued sends
//! - TRACE: relay passes, per-send credit accounting

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSection};

/// Environment variable that forces JSON output regardless of config.
pub const FORMAT_ENV: &str = "RUST_LOG_FORMAT";

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Resolve the output format: `RUST_LOG_FORMAT=json` wins over the config.
#[must_use]
pub fn effective_format(section: &LoggingSection, env: Option<&str>) -> LogFormat {
    match env {
        Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => section.format,
    }
}

/// Install the global subscriber described by the `[logging]` section.
///
/// `RUST_LOG` overrides `section.level`.
pub fn init(section: &LoggingSection) {
    let env = std::env::var(FORMAT_ENV).ok();
    let filter = filter(&section.level);
    match effective_format(section, env.as_deref()) {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Test subscriber at `debug`, routed through the test harness capture.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}
