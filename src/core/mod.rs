//! # Core Protocol Components
//!
//! Command frames, the incremental framing parser, and the codec built on it.
//!
//! ## Components
//! - **Command**: frame type, bounds, encoding and the error reply frame
//! - **Framing**: pull-style state machine turning bytes into commands
//! - **Codec**: Tokio codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [NameLen(4)] [Name(N)] [Hash(4)] [ParamsLen(4)] [Params(M)]
//! ```
//!
//! ## Limits
//! - Name: at most 128 bytes of UTF-8
//! - Params: at most 8192 bytes
//! - Length fields are validated before anything is copied

pub mod codec;
pub mod command;
pub mod framing;
