//! # Configuration Management
//!
//! Centralized configuration for the session server.
//!
//! This module provides structured configuration for the server, covering
//! bindings, admission limits, session timeouts, session log toggles, and
//! process logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Operational Considerations
//! - An idle timeout bounds how long a silent peer holds a session
//! - `max_connections` and `max_connections_per_ip` reject excess peers with an error frame
//! - `max_bad_commands = 0` disables the bad-command limit

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default listen address
pub const DEFAULT_BINDING: &str = "127.0.0.1:8001";

/// Default bad-command limit before a session is closed
pub const DEFAULT_MAX_BAD_COMMANDS: u32 = 8;

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(bindings) = std::env::var("BINARY_SESSION_BINDINGS") {
            config.server.bindings = bindings
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(val) = env_parse::<usize>("BINARY_SESSION_MAX_CONNECTIONS")? {
            config.server.max_connections = Some(val);
        }

        if let Some(val) = env_parse::<usize>("BINARY_SESSION_MAX_CONNECTIONS_PER_IP")? {
            config.server.max_connections_per_ip = Some(val);
        }

        if let Some(val) = env_parse::<u64>("BINARY_SESSION_IDLE_TIMEOUT_MS")? {
            config.server.session_idle_timeout = Some(Duration::from_millis(val));
        }

        if let Some(val) = env_parse::<u32>("BINARY_SESSION_MAX_BAD_COMMANDS")? {
            config.server.max_bad_commands = val;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

// Unset variables are not an error; unparsable ones are.
fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {key}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen addresses (e.g., "0.0.0.0:8001")
    pub bindings: Vec<String>,

    /// Close sessions whose reads or writes stay pending this long
    #[serde(default, with = "opt_duration_serde")]
    pub session_idle_timeout: Option<Duration>,

    /// Cap on sessions held by the server
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Cap on sessions held per remote address
    #[serde(default)]
    pub max_connections_per_ip: Option<usize>,

    /// Unrecognized commands tolerated per session, 0 for unlimited
    pub max_bad_commands: u32,

    /// Send business error details to clients instead of a generic message
    pub client_debug: bool,

    /// How long teardown waits for pending writes to flush
    #[serde(with = "duration_serde")]
    pub linger_timeout: Duration,

    /// Which session log entries are produced
    #[serde(default)]
    pub session_log: SessionLogConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bindings: vec![String::from(DEFAULT_BINDING)],
            session_idle_timeout: None,
            max_connections: None,
            max_connections_per_ip: None,
            max_bad_commands: DEFAULT_MAX_BAD_COMMANDS,
            client_debug: false,
            linger_timeout: timeout::LINGER_TIMEOUT,
            session_log: SessionLogConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse every binding, failing on the first malformed one
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.bindings
            .iter()
            .map(|b| {
                b.parse::<SocketAddr>()
                    .map_err(|_| ProtocolError::InvalidBinding(b.clone()))
            })
            .collect()
    }

    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bindings.is_empty() {
            errors.push("At least one binding is required".to_string());
        }
        for binding in &self.bindings {
            if binding.parse::<SocketAddr>().is_err() {
                errors.push(format!(
                    "Invalid binding format: '{binding}' (expected format: '0.0.0.0:8001')"
                ));
            }
        }

        errors.extend(self.validate_limits());
        errors
    }

    /// Validate everything except the binding list
    pub fn validate_limits(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_connections == Some(0) {
            errors.push("Max connections must be greater than 0 when set".to_string());
        }

        if self.max_connections_per_ip == Some(0) {
            errors.push("Max connections per IP must be greater than 0 when set".to_string());
        }

        if let (Some(total), Some(per_ip)) = (self.max_connections, self.max_connections_per_ip) {
            if per_ip > total {
                errors.push(format!(
                    "Max connections per IP ({per_ip}) exceeds max connections ({total})"
                ));
            }
        }

        if let Some(idle) = self.session_idle_timeout {
            if idle < timeout::MIN_IDLE_TIMEOUT {
                errors.push("Session idle timeout too short (minimum: 10ms)".to_string());
            }
        }

        if self.linger_timeout.as_millis() < 10 {
            errors.push("Linger timeout too short (minimum: 10ms)".to_string());
        } else if self.linger_timeout.as_secs() > 60 {
            errors.push("Linger timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Session log toggles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionLogConfig {
    /// Session enter and exit
    pub system: bool,
    /// Every received command
    pub normal_in: bool,
    /// Every sent command
    pub normal_out: bool,
    /// Business handler failures
    pub unknown_error: bool,
    /// Unexpected socket and internal failures
    pub critical_error: bool,
    /// Per-command execution time
    pub performance: bool,
}

impl Default for SessionLogConfig {
    fn default() -> Self {
        Self {
            system: true,
            normal_in: false,
            normal_out: false,
            unknown_error: true,
            critical_error: true,
            performance: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("binary-session"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Optional Duration as milliseconds; absent means unset
mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
