//! # Auto-Reset Signal
//!
//! Single-slot wake primitive for producer/consumer loops.
//!
//! `set()` lets exactly one pending or future `wait()` return and then clears
//! itself. Several `set()` calls before a wait collapse into one wake-up, so a
//! consumer must drain its whole queue after waking.
//!
//! Waiting blocks the calling thread. Only call it from dedicated threads,
//! never from a thread of the async runtime.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct AutoResetSignal {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl AutoResetSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release one waiter, or the next caller of `wait` if nobody waits yet
    pub fn set(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        self.cond.notify_one();
    }

    /// Block until signaled, then clear the signal
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            signaled = self
                .cond
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *signaled = false;
    }

    /// Block until signaled or until `timeout` elapses.
    ///
    /// Returns `true` if the signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(signaled, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            signaled = guard;
        }
        *signaled = false;
        true
    }
}
