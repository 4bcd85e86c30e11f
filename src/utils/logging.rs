//! # Logging
//!
//! Installs the process-wide `tracing` subscriber from a [`LoggingConfig`].
//!
//! The filter honours `RUST_LOG` when present and falls back to the
//! configured level. Output goes to the console or to an append-only file,
//! as plain text or JSON.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Build the env filter for `config`
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_ascii_lowercase()))
}

/// Install the global subscriber.
///
/// Fails if the configuration is invalid, the log file cannot be opened, or a
/// global subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(ProtocolError::ConfigError(errors.join("; ")));
    }

    let filter = env_filter(config);
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match (config.log_to_file, config.log_file_path.as_deref()) {
        (true, Some(path)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}"))
                })?;
            let writer = Mutex::new(file);
            if config.json_format {
                registry
                    .with(fmt::layer().json().with_writer(writer).with_ansi(false))
                    .try_init()
            } else {
                registry
                    .with(fmt::layer().with_writer(writer).with_ansi(false))
                    .try_init()
            }
        }
        _ if config.json_format => registry.with(fmt::layer().json()).try_init(),
        _ => registry.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Logging already initialised: {e}")))?;
    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialised");
    Ok(())
}
