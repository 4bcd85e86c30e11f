//! # Per-Worker Cached Resources
//!
//! `WorkerLocal<T>` lazily builds one value per worker thread and hands out
//! shared references to it. The first access from a thread runs the factory
//! and registers an exit hook for that thread; when the thread terminates the
//! hook removes the cached entry.
//!
//! Dropping the `WorkerLocal` clears every cached value and cancels all exit
//! hooks it registered, so threads that exit later never touch the dropped
//! cache. The hook only holds a `Weak` reference and a cancellation flag.
//!
//! ## Usage
//! ```rust
//! use binary_session::utils::worker_local::WorkerLocal;
//!
//! let scratch = WorkerLocal::new(|| std::sync::Mutex::new(Vec::<u8>::with_capacity(1024)));
//! let buf = scratch.get();
//! buf.lock().unwrap().push(1);
//! assert_eq!(scratch.len(), 1);
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use tracing::trace;

use crate::utils::guarded::GuardedCell;

type ExitHook = Box<dyn FnOnce()>;

#[derive(Default)]
struct ExitHooks {
    hooks: Vec<(Arc<AtomicBool>, ExitHook)>,
}

impl Drop for ExitHooks {
    fn drop(&mut self) {
        for (cancelled, hook) in self.hooks.drain(..) {
            if !cancelled.load(Ordering::Acquire) {
                hook();
            }
        }
    }
}

thread_local! {
    static EXIT_HOOKS: RefCell<ExitHooks> = RefCell::new(ExitHooks::default());
}

/// Handle to a hook registered with [`on_worker_exit`]
#[derive(Debug, Clone)]
pub struct ExitRegistration {
    cancelled: Arc<AtomicBool>,
}

impl ExitRegistration {
    /// Prevent the hook from running when its thread exits
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Run `hook` when the current thread terminates.
///
/// If the thread is already tearing down its locals the hook cannot be
/// registered and the returned registration is born cancelled.
pub fn on_worker_exit(hook: impl FnOnce() + 'static) -> ExitRegistration {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let registered = EXIT_HOOKS
        .try_with(|hooks| {
            let mut hooks = hooks.borrow_mut();
            hooks
                .hooks
                .retain(|(cancelled, _)| !cancelled.load(Ordering::Acquire));
            hooks.hooks.push((flag, Box::new(hook)));
        })
        .is_ok();
    if !registered {
        cancelled.store(true, Ordering::Release);
    }
    ExitRegistration { cancelled }
}

struct Entry<T> {
    value: Arc<T>,
    registration: ExitRegistration,
}

struct Inner<T> {
    factory: Box<dyn Fn() -> T + Send + Sync>,
    values: GuardedCell<HashMap<ThreadId, Entry<T>>>,
}

/// Lazily built value cached per worker thread
pub struct WorkerLocal<T: Send + Sync + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + Sync + 'static> WorkerLocal<T> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                factory: Box::new(factory),
                values: GuardedCell::new(HashMap::new()),
            }),
        }
    }

    /// The value for the calling thread, built on first access
    pub fn get(&self) -> Arc<T> {
        let id = thread::current().id();
        if let Some(value) = self
            .inner
            .values
            .check(|values| values.get(&id).map(|e| e.value.clone()))
        {
            return value;
        }

        // Nothing else runs on this thread, so nobody can insert for `id`
        // between the check above and the insert below.
        let value = Arc::new((self.inner.factory)());
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let registration = on_worker_exit(move || {
            if let Some(inner) = weak.upgrade() {
                inner.values.mutate(|values| values.remove(&id));
                trace!(?id, "Released worker-local value on thread exit");
            }
        });

        self.inner.values.mutate(|values| {
            values.insert(
                id,
                Entry {
                    value: value.clone(),
                    registration,
                },
            );
        });
        value
    }

    /// Number of threads currently holding a cached value
    pub fn len(&self) -> usize {
        self.inner.values.check(|values| values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached value and cancel their exit hooks
    pub fn clear(&self) {
        let entries = self.inner.values.take();
        for entry in entries.values() {
            entry.registration.cancel();
        }
    }
}

impl<T: Send + Sync + 'static> Drop for WorkerLocal<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for WorkerLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLocal")
            .field("workers", &self.len())
            .finish()
    }
}
