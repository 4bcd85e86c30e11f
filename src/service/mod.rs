//! # Client Services
//!
//! Client side of the session protocol, used by integration tests, benches
//! and tools that talk to a running server.

pub mod client;

pub use client::{is_error_frame, SessionClient};
