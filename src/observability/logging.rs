//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! The output format is selected by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON for log aggregation
//! - `pretty` - Multi-line, colored output for development
//! - `compact` - Single-line, colored terminal output
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE) - defaults to INFO
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to json
//! - `LOG_SPANS`: Include span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG gateway-sim run --config gateway.toml
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that are only interesting when something goes wrong
const QUIET_DEPENDENCIES: &[&str] = &["rumqttc=warn", "tokio=warn"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value; unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Filter for `level` with dependency noise reduced, unless `rust_log` is set
pub fn build_filter(level: Level, rust_log: Option<&str>) -> EnvFilter {
    if let Some(rust_log) = rust_log {
        return EnvFilter::new(rust_log);
    }

    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Initialize logging with manual configuration.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let rust_log = env::var("RUST_LOG").ok();
    let filter = build_filter(level, rust_log.as_deref());
    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Create a lifecycle event span
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

// Re-export macros for convenience
pub use {lifecycle_span, mqtt_span};
