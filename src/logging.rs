//! # Structured Logging Module
//!
//! Console logging through the tracing ecosystem, written for containers: logs go
//! to stdout, level comes from `RUST_LOG`, the configuration, or the environment
//! (`debug` for development/test, `info` for production), and JSON output can be
//! switched on for log shippers.

use chrono::Utc;
use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{detect_environment, LogFormat, LoggingConfig};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing from the logging section of the configuration.
///
/// Safe to call more than once; only the first call installs a subscriber, and an
/// already-installed global subscriber is left in place.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = detect_environment();
        let filter = build_filter(config.level.as_deref(), &environment);
        let use_ansi = IsTerminal::is_terminal(&std::io::stdout());

        let console_layer = match config.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(use_ansi)
                .with_filter(filter)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .with_filter(filter)
                .boxed(),
        };

        if tracing_subscriber::registry()
            .with(console_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        } else {
            tracing::debug!(
                environment = %environment,
                format = ?config.format,
                ansi_colors = use_ansi,
                "Console logging initialized"
            );
        }
    });
}

fn build_filter(configured_level: Option<&str>, environment: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = configured_level
            .map(str::to_string)
            .unwrap_or_else(|| get_log_level(environment).to_string());
        EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Default log level for an environment
fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" | "prd" | "qas" => "info",
        _ => "debug",
    }
}

/// Process start/stop marker
pub fn log_lifecycle(phase: &str, component: &str, details: Option<&str>) {
    tracing::info!(
        phase = %phase,
        component = %component,
        version = env!("CARGO_PKG_VERSION"),
        details = details,
        pid = std::process::id(),
        timestamp = %Utc::now().to_rfc3339(),
        "{phase}"
    );
}

/// Log an error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "Operation failed"
    );
}
