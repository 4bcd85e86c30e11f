//! # Transport Layer
//!
//! TCP listener, admission control and the per-connection session actor.
//!
//! ## Components
//! - **Server**: bindings, accept loops, admission and purge workers, the session registry
//! - **Session**: ordered command queue, framing, send queue and teardown for one peer
//! - **Log**: session log entries and their kinds
//!
//! ## Threads
//! Accept loops and session I/O run on the tokio runtime handed to the server.
//! Admission and purge run on two dedicated threads that sleep on
//! [`AutoResetSignal`](crate::utils::AutoResetSignal)s, so a blocking
//! `Session::stop` normally never occupies a runtime worker. When user code
//! stops a session or the server from inside a task, the wait runs under
//! `block_in_place` instead.

pub mod log;
pub mod server;
pub mod session;

pub use log::{SessionLogEntry, SessionLogKind};
pub use server::{NoopEvents, Server, ServerEvents};
pub use session::{Session, SessionId};

use tokio::runtime::{Handle, RuntimeFlavor};

/// Run a blocking closure without stalling the runtime that called it.
///
/// On a multi-threaded runtime worker the closure runs under
/// `block_in_place`, which hands the worker's queued tasks to another thread
/// first. On a current-thread runtime it moves to a scoped helper thread; the
/// runtime is stalled meanwhile, so tasks it owns cannot make progress there.
/// Outside any runtime it runs in place. Panics resume on the caller.
pub(crate) fn off_runtime<R: Send>(f: impl FnOnce() -> R + Send) -> R {
    match Handle::try_current() {
        Err(_) => f(),
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::CurrentThread => {
            std::thread::scope(|scope| match scope.spawn(f).join() {
                Ok(value) => value,
                Err(panic) => std::panic::resume_unwind(panic),
            })
        }
        Ok(_) => tokio::task::block_in_place(f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_off_runtime_outside_runtime_runs_in_place() {
        let caller = std::thread::current().id();
        let ran_on = off_runtime(|| std::thread::current().id());
        assert_eq!(caller, ran_on);
    }

    #[tokio::test]
    async fn test_off_runtime_on_current_thread_leaves_the_context() {
        let inside = off_runtime(|| Handle::try_current().is_ok());
        assert!(!inside);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_off_runtime_keeps_local_tasks_running() {
        let value = tokio::spawn(async {
            // Lands in this worker's local queue; only runs if the queue is handed off
            let inner = tokio::spawn(async { 7u8 });
            off_runtime(|| futures::executor::block_on(inner))
        })
        .await
        .expect("outer task");
        assert_eq!(value.expect("inner task"), 7);
    }
}
