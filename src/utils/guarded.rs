//! # Guarded Cell
//!
//! A value behind a single mutex with closure-based access.
//!
//! Every read, mutation and replacement runs while the lock is held, so a
//! closure sees a consistent value and its effect is atomic with respect to
//! other callers. Closures must not reenter the same cell and must not perform
//! I/O; capture what you need and act after the call returns.
//!
//! ## Usage
//! ```rust
//! use binary_session::utils::guarded::GuardedCell;
//!
//! let count = GuardedCell::new(0usize);
//! count.mutate(|n| *n += 1);
//! let previous = count.update(|n| n * 10);
//! assert_eq!(previous, 1);
//! assert_eq!(count.check(|n| *n), 10);
//! ```

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Mutex-protected value with atomic read, mutate and replace operations
pub struct GuardedCell<T> {
    inner: Mutex<T>,
}

impl<T> GuardedCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    // A panic inside a closure leaves the value as the closure left it;
    // later callers keep working with it.
    #[inline]
    fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read a projection of the value
    pub fn check<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.lock();
        f(&guard)
    }

    /// Mutate the value in place, returning whatever the closure returns
    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// Replace the value with `f(&old)`, returning the old value
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> T {
        let mut guard = self.lock();
        let next = f(&guard);
        std::mem::replace(&mut *guard, next)
    }

    /// Store `value`, returning the previous one
    pub fn replace(&self, value: T) -> T {
        std::mem::replace(&mut *self.lock(), value)
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Default> GuardedCell<T> {
    /// Take the value, leaving `T::default()` behind
    pub fn take(&self) -> T {
        std::mem::take(&mut *self.lock())
    }
}

impl<T: Default> Default for GuardedCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for GuardedCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.check(|v| f.debug_tuple("GuardedCell").field(v).finish())
    }
}
