//! Logging initialisation via tracing-subscriber.
//!
//! The library itself only emits `tracing` events. Binaries call [`init`]
//! once at startup.

use crate::{Error, ErrorContext, Result};
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber writing to stderr.
///
/// `RUST_LOG` wins when set and valid; otherwise `default_level` (a level
/// or any `EnvFilter` directive string) is used.
pub fn init(default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| {
            Error::configuration_with_context(
                format!("invalid log filter '{}': {}", default_level, e),
                ErrorContext::new()
                    .with_field_path("RUST_LOG")
                    .with_source("logging"),
            )
        })?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| {
            Error::runtime_with_context(
                format!("failed to set subscriber: {}", e),
                ErrorContext::new().with_source("logging"),
            )
        })
}
