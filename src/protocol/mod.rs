//! # Protocol Layer
//!
//! The boundary between sessions and business code.
//!
//! ## Components
//! - **Dispatcher**: [`CommandTable`] trait and a handler map implementing it
//! - **Context**: per-session identity and handle passed to every handler
//!
//! Handlers run on the shared worker pool. A session never runs two of its
//! commands at once, so per-session state needs no extra locking beyond what
//! the handler shares across sessions.

pub mod context;
pub mod dispatcher;

pub use context::{SessionContext, SessionHandle};
pub use dispatcher::{CommandTable, Dispatcher};
