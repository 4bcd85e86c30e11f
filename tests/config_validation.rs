//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use binary_session::config::{LoggingConfig, NetworkConfig, ServerConfig, SessionLogConfig};
use serial_test::serial;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_binding() {
    let mut config = NetworkConfig::default();
    config.server.bindings = vec!["invalid_address".to_string()];

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid binding format")));
}

#[test]
fn test_empty_bindings() {
    let mut config = NetworkConfig::default();
    config.server.bindings.clear();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one binding is required")));
    // Limits alone are still fine
    assert!(config.server.validate_limits().is_empty());
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = Some(0);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_per_ip_limit_above_total() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = Some(10);
    config.server.max_connections_per_ip = Some(20);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections per IP (20) exceeds max connections (10)")));
}

#[test]
fn test_short_idle_timeout() {
    let mut config = NetworkConfig::default();
    config.server.session_idle_timeout = Some(Duration::from_millis(1));

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Session idle timeout too short")));
}

#[test]
fn test_linger_bounds() {
    let mut config = NetworkConfig::default();
    config.server.linger_timeout = Duration::from_millis(1);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Linger timeout too short")));

    config.server.linger_timeout = Duration::from_secs(120);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Linger timeout too long")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.bindings.clear();
    config.server.max_connections_per_ip = Some(0);
    config.logging.app_name = String::new();

    let result = config.validate_strict();
    let message = result.expect_err("invalid config").to_string();
    assert!(message.contains("Configuration validation failed"));
    assert_eq!(config.validate().len(), 3);
}

#[test]
fn test_toml_defaults_fill_missing_fields() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        bindings = ["0.0.0.0:9000", "[::1]:9000"]
        max_bad_commands = 3
        client_debug = true
        linger_timeout = 500
        session_idle_timeout = 30000

        [server.session_log]
        performance = true
        "#,
    )
    .expect("parse");

    assert_eq!(config.server.bindings.len(), 2);
    assert_eq!(config.server.max_connections, None);
    assert_eq!(config.server.session_idle_timeout, Some(Duration::from_secs(30)));
    assert_eq!(config.server.linger_timeout, Duration::from_millis(500));
    assert!(config.server.session_log.performance);
    assert!(config.server.session_log.system);
    assert!(!config.server.session_log.normal_in);
    assert_eq!(config.server.socket_addrs().expect("addrs").len(), 2);
    assert_eq!(config.logging.app_name, "binary-session");
}

#[test]
fn test_malformed_toml_is_config_error() {
    let err = NetworkConfig::from_toml("[server\nbindings = 3").expect_err("malformed");
    assert!(err.to_string().contains("Failed to parse TOML"));
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("server.toml");

    let config = NetworkConfig {
        server: ServerConfig {
            bindings: vec!["127.0.0.1:7000".to_string()],
            max_connections: Some(500),
            max_connections_per_ip: Some(16),
            session_idle_timeout: Some(Duration::from_secs(90)),
            session_log: SessionLogConfig {
                normal_in: true,
                ..SessionLogConfig::default()
            },
            ..ServerConfig::default()
        },
        logging: LoggingConfig {
            app_name: "session-gateway".to_string(),
            log_level: Level::DEBUG,
            json_format: true,
            ..LoggingConfig::default()
        },
    };
    config.save_to_file(&path).expect("save");

    let loaded = NetworkConfig::from_file(&path).expect("load");
    assert_eq!(loaded.server.bindings, config.server.bindings);
    assert_eq!(loaded.server.max_connections, Some(500));
    assert_eq!(loaded.server.max_connections_per_ip, Some(16));
    assert_eq!(loaded.server.session_idle_timeout, Some(Duration::from_secs(90)));
    assert_eq!(loaded.server.session_log, config.server.session_log);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
    assert!(loaded.validate().is_empty());
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).expect("example parses");
    assert!(parsed.validate().is_empty());
}

fn clear_env() {
    for key in [
        "BINARY_SESSION_BINDINGS",
        "BINARY_SESSION_MAX_CONNECTIONS",
        "BINARY_SESSION_MAX_CONNECTIONS_PER_IP",
        "BINARY_SESSION_IDLE_TIMEOUT_MS",
        "BINARY_SESSION_MAX_BAD_COMMANDS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn test_env_overrides() {
    clear_env();
    std::env::set_var("BINARY_SESSION_BINDINGS", "127.0.0.1:7001, 127.0.0.1:7002");
    std::env::set_var("BINARY_SESSION_MAX_CONNECTIONS", "100");
    std::env::set_var("BINARY_SESSION_IDLE_TIMEOUT_MS", "2500");

    let config = NetworkConfig::from_env().expect("env config");
    clear_env();

    assert_eq!(
        config.server.bindings,
        vec!["127.0.0.1:7001".to_string(), "127.0.0.1:7002".to_string()]
    );
    assert_eq!(config.server.max_connections, Some(100));
    assert_eq!(config.server.max_connections_per_ip, None);
    assert_eq!(
        config.server.session_idle_timeout,
        Some(Duration::from_millis(2500))
    );
}

#[test]
#[serial]
fn test_env_rejects_garbage() {
    clear_env();
    std::env::set_var("BINARY_SESSION_MAX_BAD_COMMANDS", "lots");
    let result = NetworkConfig::from_env();
    clear_env();

    let err = result.expect_err("unparsable value");
    assert!(err.to_string().contains("BINARY_SESSION_MAX_BAD_COMMANDS"));
}
