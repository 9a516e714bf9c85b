//! Mutable Cell
//!
//! A shared mutable reference whose every access is an effect.
//!
//! # Design
//!
//! One slot behind a short critical section; each operation is a single
//! read-compute-swap transition, so concurrent callers interleave at whole
//! operations and never observe a partial update. Update functions run
//! inside the transition, which keeps `update`/`modify` atomic with respect
//! to each other at the cost of holding the section across user code, so
//! callers should keep those functions small.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;

/// A mutable cell holding a `T`, accessed through effects.
///
/// Handles are cheap to clone and share the underlying slot.
pub struct MutCell<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for MutCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> MutCell<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Create a cell as an effect.
    pub fn of(value: T) -> Effect<MutCell<T>> {
        Effect::delay(move || MutCell::new(value))
    }

    /// Read the current value.
    pub fn get(&self) -> Effect<T> {
        let inner = self.inner.clone();
        Effect::delay(move || inner.lock().clone())
    }

    /// Replace the current value.
    pub fn set(&self, value: T) -> Effect<()> {
        let inner = self.inner.clone();
        Effect::delay(move || *inner.lock() = value)
    }

    /// Replace the current value, returning the previous one.
    pub fn get_and_set(&self, value: T) -> Effect<T> {
        let inner = self.inner.clone();
        Effect::delay(move || std::mem::replace(&mut *inner.lock(), value))
    }

    /// Transform the current value in one transition.
    pub fn update<F>(&self, f: F) -> Effect<()>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        let inner = self.inner.clone();
        Effect::delay(move || {
            let mut guard = inner.lock();
            let old = guard.clone();
            *guard = f(old);
        })
    }

    /// Transform the current value and surface a derived result.
    pub fn modify<B, F>(&self, f: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(T) -> (T, B) + Send + 'static,
    {
        let inner = self.inner.clone();
        Effect::delay(move || {
            let mut guard = inner.lock();
            let (new, out) = f(guard.clone());
            *guard = new;
            out
        })
    }
}

impl<T: Clone + PartialEq + Send + 'static> MutCell<T> {
    /// Replace the value only if it currently equals `expected`.
    ///
    /// Returns whether the swap happened.
    pub fn compare_and_set(&self, expected: T, new: T) -> Effect<bool> {
        let inner = self.inner.clone();
        Effect::delay(move || {
            let mut guard = inner.lock();
            if *guard == expected {
                *guard = new;
                true
            } else {
                false
            }
        })
    }
}

impl<T: fmt::Debug> fmt::Debug for MutCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutCell").field("value", &*self.inner.lock()).finish()
    }
}
