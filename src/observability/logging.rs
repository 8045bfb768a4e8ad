//! # Structured Logging
//!
//! Installs the global `tracing` subscriber and provides the redaction helper
//! used wherever an API key would otherwise end up in a log line.

use crate::core::config::{LogFormat, LoggingConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize the tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// is harmless; the second call logs a warning and keeps the first subscriber.
pub fn init_logging(config: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
        return;
    }

    info!(format = ?config.format, "Structured logging initialized");
}

/// Shorten an API key to a prefix safe for logs
pub fn redact_api_key(api_key: &str) -> String {
    let visible = (api_key.chars().count() / 2).min(4);
    let prefix: String = api_key.chars().take(visible).collect();
    format!("{}***", prefix)
}
