//! # Binary Session
//!
//! Asynchronous TCP session server for a compact binary command protocol.
//!
//! A [`Server`](transport::Server) listens on one or more addresses, admits
//! connections under global and per-address limits, and runs each connection
//! as a [`Session`](transport::Session): an ordered command queue fed by an
//! incremental framing parser, dispatched to a business
//! [`CommandTable`](protocol::CommandTable) on a shared tokio runtime.
//!
//! ## Modules
//! - [`core`]: command frames, the framing state machine and the tokio codec
//! - [`protocol`]: the dispatch boundary and the per-session context
//! - [`transport`]: server, sessions and session log entries
//! - [`service`]: client for talking to a server
//! - [`utils`]: guarded cells, signals, worker-local caches, RC4 transform, logging, metrics
//! - [`config`]: TOML and environment configuration
//! - [`error`]: the crate error type
//!
//! ## Example
//! ```rust,no_run
//! use binary_session::config::NetworkConfig;
//! use binary_session::protocol::Dispatcher;
//! use binary_session::transport::Server;
//! use binary_session::utils::logging::init_logging;
//! use std::sync::Arc;
//!
//! # fn main() -> binary_session::error::Result<()> {
//! let config = NetworkConfig::from_env()?;
//! init_logging(&config.logging)?;
//!
//! let table = Dispatcher::new();
//! table.register("Echo", 0x00C0_FFEE, |_, payload| Ok(payload.to_vec()))?;
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let server = Server::new(config.server, Arc::new(table), runtime.handle().clone())?;
//! server.start()?;
//! # server.stop();
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use crate::core::command::Command;
pub use crate::error::{ProtocolError, Result};
pub use crate::protocol::{CommandTable, Dispatcher, SessionContext, SessionHandle};
pub use crate::service::SessionClient;
pub use crate::transport::{Server, ServerEvents, Session};
