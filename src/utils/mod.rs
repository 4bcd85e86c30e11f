//! # Utility Modules
//!
//! Concurrency primitives, the stream transform, logging, and timing.
//!
//! ## Components
//! - **Guarded**: mutex-protected cell with closure-based atomic access
//! - **Signal**: auto-reset wake primitive for the dedicated worker loops
//! - **Worker Local**: lazily built per-thread values reclaimed on thread exit
//! - **RC4**: keystream generator and the two-direction stream transform
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Shared deadlines and async timeout wrappers

pub mod guarded;
pub mod logging;
pub mod metrics;
pub mod rc4;
pub mod signal;
pub mod timeout;
pub mod worker_local;

pub use guarded::GuardedCell;
pub use rc4::StreamTransform;
pub use signal::AutoResetSignal;
pub use worker_local::WorkerLocal;
