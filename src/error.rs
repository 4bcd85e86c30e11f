//! # Error Types
//!
//! Error handling for the session server.
//!
//! This module defines all error variants that can occur while serving sessions,
//! from low-level socket faults to frame bound violations and business failures.
//!
//! ## Error Categories
//! - **Bind Errors**: every configured binding failed to open
//! - **Protocol Errors**: frame fields out of bounds, malformed command names
//! - **Socket Faults**: reset/aborted/eof/canceled are expected, anything else is critical
//! - **Business Errors**: a command handler failed; converted to an error reply frame
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! All errors implement `std::error::Error` for interoperability.
//!
//! ## Example Usage
//! ```rust
//! use binary_session::error::{ProtocolError, Result};
//! use tracing::error;
//!
//! fn check_name_length(len: i32) -> Result<usize> {
//!     if !(0..=128).contains(&len) {
//!         return Err(ProtocolError::OversizedFrame { field: "name", length: len as i64 });
//!     }
//!     Ok(len as usize)
//! }
//!
//! if let Err(e) = check_name_length(4096) {
//!     error!(error = %e, "Rejected frame");
//! }
//! ```

use std::io;
use thiserror::Error;

/// Static message strings used on error paths and in error reply frames.
pub mod constants {
    /// Reply to a command name/hash the business table does not know
    pub const ERR_NOT_RECOGNIZED: &str = "Not recognized.";
    /// Reply sent right before a session is closed for sending too many bad commands
    pub const ERR_TOO_MANY_BAD_COMMANDS: &str =
        "Too many bad commands, closing transmission channel.";
    /// Reply to a failed command when client debugging is disabled
    pub const ERR_INTERNAL_SERVER_ERROR: &str = "Internal server error.";
    /// Rejection sent when the global connection cap is reached
    pub const ERR_TOO_MANY_CONNECTIONS: &str =
        "Client host rejected: too many connections, please try again later.";

    /// Connection errors
    pub const ERR_OPERATION_CANCELED: &str = "Operation canceled";
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_SESSION_IDLE: &str = "Session idle timeout elapsed";

    /// Rejection sent when the per-address connection cap is reached
    pub fn too_many_connections_from(ip: &std::net::IpAddr) -> String {
        format!(
            "Client host rejected: too many connections from your IP({ip}), please try again later."
        )
    }
}

// ProtocolError is the primary error type for all server operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Already running")]
    AlreadyRunning,

    #[error("No valid binding configured")]
    NoBindings,

    #[error("Failed to bind {address}: {source}")]
    BindFailure {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid binding: {0}")]
    InvalidBinding(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Frame field {field} out of bounds: {length}")]
    OversizedFrame { field: &'static str, length: i64 },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout occurred")]
    Timeout,

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error terminates the connection without any reply
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ProtocolError::ProtocolViolation(_) | ProtocolError::OversizedFrame { .. }
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Build the error used to fail in-flight socket operations on shutdown
pub fn canceled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, constants::ERR_OPERATION_CANCELED)
}

/// Socket faults that end a session silently.
///
/// Anything not listed here is reported as a critical error before the session stops.
pub fn is_expected_fault(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
    )
}
