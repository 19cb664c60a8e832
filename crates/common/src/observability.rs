//! Logging and tracing initialization
//!
//! The proxy logs through `tracing` everywhere; this module installs the
//! subscriber once at process start.

use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable selecting the log format (`json`, `pretty`, anything else is compact)
pub const LOG_FORMAT_ENV: &str = "BURROW_LOG_FORMAT";

/// Initialize the tracing/logging subsystem
///
/// `default_level` is used when `RUST_LOG` is not set.
pub fn init_tracing(default_level: &str) -> Result<()> {
    let format = std::env::var(LOG_FORMAT_ENV).unwrap_or_else(|_| "json".to_string());

    // Use JSON format for structured logging in production
    let json_layer = if format == "json" {
        Some(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
    } else {
        None
    };

    // Pretty format for development
    let pretty_layer = if format == "pretty" {
        Some(fmt::layer().pretty().with_target(true))
    } else {
        None
    };

    let compact_layer = if format != "json" && format != "pretty" {
        Some(fmt::layer().compact())
    } else {
        None
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(compact_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))?;

    info!(format = %format, "Tracing initialized");
    Ok(())
}
