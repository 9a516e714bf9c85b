//! Completion Cell
//!
//! A single-assignment cell: settled exactly once with a success or a
//! failure, awaited any number of times.
//!
//! # Design
//!
//! The cell is a two-state machine behind one shared snapshot: `Pending`
//! holds the callbacks of every waiting `get`, `Settled` holds the outcome.
//! The only legal transition is Pending to Settled; settling drains the
//! waiting callbacks and invokes each exactly once, outside the critical
//! section. A `get` that arrives after settlement resolves immediately
//! without registering anything.
//!
//! Settling an already-settled cell is a protocol violation, surfaced as an
//! [`AlreadySettled`] failure rather than a silent overwrite. `try_complete`
//! is the non-failing variant for callers racing to settle.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::error::{AlreadySettled, Failure};

/// A waiting `get` callback, invoked exactly once on settlement.
type Waiter<A> = Box<dyn FnOnce(Result<A, Failure>) + Send>;

enum State<A> {
    /// Not settled yet; waiters are keyed for removal on cancellation.
    Pending {
        next_id: u64,
        waiters: Vec<(u64, Waiter<A>)>,
    },
    /// Terminal state.
    Settled(Result<A, Failure>),
}

/// A single-assignment completion cell.
///
/// Handles are cheap to clone and share the underlying state.
pub struct Promise<A> {
    inner: Arc<Mutex<State<A>>>,
}

impl<A> Clone for Promise<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Clone + Send + 'static> Promise<A> {
    /// Create an unsettled cell.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::Pending {
                next_id: 0,
                waiters: Vec::new(),
            })),
        }
    }

    /// Create an unsettled cell as an effect.
    pub fn create() -> Effect<Promise<A>> {
        Effect::delay(Promise::new)
    }

    /// Settle the cell, draining and invoking every waiter.
    ///
    /// Returns `false` without touching anything if the cell was already
    /// settled.
    pub(crate) fn settle(&self, result: Result<A, Failure>) -> bool {
        let waiters = {
            let mut guard = self.inner.lock();
            match std::mem::replace(&mut *guard, State::Settled(result.clone())) {
                State::Pending { waiters, .. } => waiters,
                State::Settled(previous) => {
                    // first settlement wins
                    *guard = State::Settled(previous);
                    return false;
                }
            }
        };
        log::trace!("promise settled, waking {} waiter(s)", waiters.len());
        for (_, waiter) in waiters {
            waiter(result.clone());
        }
        true
    }

    /// Fulfill the cell with a value.
    ///
    /// Fails with [`AlreadySettled`] if the cell was settled before.
    pub fn complete(&self, value: A) -> Effect<()> {
        let cell = self.clone();
        Effect::suspend(move || {
            if cell.settle(Ok(value)) {
                Effect::unit()
            } else {
                Effect::raise_error(Failure::raised(AlreadySettled))
            }
        })
    }

    /// Settle the cell with a failure.
    ///
    /// Fails with [`AlreadySettled`] if the cell was settled before.
    pub fn error(&self, failure: Failure) -> Effect<()> {
        let cell = self.clone();
        Effect::suspend(move || {
            if cell.settle(Err(failure)) {
                Effect::unit()
            } else {
                Effect::raise_error(Failure::raised(AlreadySettled))
            }
        })
    }

    /// Fulfill the cell, reporting whether this call won the settlement.
    pub fn try_complete(&self, value: A) -> Effect<bool> {
        let cell = self.clone();
        Effect::delay(move || cell.settle(Ok(value)))
    }

    /// The settled outcome, if any, without suspending.
    pub fn try_get(&self) -> Effect<Option<Result<A, Failure>>> {
        let inner = self.inner.clone();
        Effect::delay(move || match &*inner.lock() {
            State::Settled(result) => Some(result.clone()),
            State::Pending { .. } => None,
        })
    }

    /// Await the cell's outcome.
    ///
    /// Suspends until settled; resolves immediately if the cell is already
    /// settled. A cell settled with a failure raises that failure here.
    /// Cancelling a suspended `get` unregisters its waiter.
    pub fn get(&self) -> Effect<A> {
        let inner = self.inner.clone();
        Effect::from_callback_cancelable(move |resume| {
            let waiter: Waiter<A> = Box::new(move |result| resume.resolve(result));
            let unregister = inner.clone();
            let (run_now, token) = {
                let mut guard = inner.lock();
                match &mut *guard {
                    State::Settled(result) => (Some((waiter, result.clone())), Effect::unit()),
                    State::Pending { next_id, waiters } => {
                        let id = *next_id;
                        *next_id += 1;
                        waiters.push((id, waiter));
                        let token = Effect::delay(move || {
                            if let State::Pending { waiters, .. } = &mut *unregister.lock() {
                                waiters.retain(|(wid, _)| *wid != id);
                            }
                        });
                        (None, token)
                    }
                }
            };
            if let Some((waiter, result)) = run_now {
                waiter(result);
            }
            token
        })
    }
}

impl<A: Clone + Send + 'static> Default for Promise<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for Promise<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.lock() {
            State::Pending { waiters, .. } => format!("pending({} waiting)", waiters.len()),
            State::Settled(Ok(_)) => "fulfilled".to_string(),
            State::Settled(Err(_)) => "errored".to_string(),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_after_complete_is_immediate() {
        let cell = Promise::new();
        cell.complete(7).run_sync().unwrap();
        assert_eq!(cell.get().run_sync().unwrap(), 7);
        // a second get resolves again
        assert_eq!(cell.get().run_sync().unwrap(), 7);
    }

    #[test]
    fn test_get_before_complete_suspends() {
        let cell = Promise::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        cell.get().run_async(move |result| {
            let _ = tx.send(result);
        });
        assert!(rx.try_recv().is_err());

        cell.complete(3).run_sync().unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), 3);
    }

    #[test]
    fn test_double_complete_raises() {
        let cell = Promise::new();
        cell.complete(1).run_sync().unwrap();
        let err = cell.complete(2).run_sync().unwrap_err();
        assert!(err.downcast_ref::<AlreadySettled>().is_some());
        // the original value is untouched
        assert_eq!(cell.get().run_sync().unwrap(), 1);
    }

    #[test]
    fn test_try_complete_reports_loss() {
        let cell = Promise::new();
        assert!(cell.try_complete(1).run_sync().unwrap());
        assert!(!cell.try_complete(2).run_sync().unwrap());
    }

    #[test]
    fn test_error_propagates_to_get() {
        let cell: Promise<i32> = Promise::new();
        cell.error(Failure::msg("settled badly")).run_sync().unwrap();
        let err = cell.get().run_sync().unwrap_err();
        assert_eq!(err.to_string(), "settled badly");
    }

    #[test]
    fn test_try_get() {
        let cell = Promise::new();
        assert!(cell.try_get().run_sync().unwrap().is_none());
        cell.complete(5).run_sync().unwrap();
        assert_eq!(cell.try_get().run_sync().unwrap().unwrap().unwrap(), 5);
    }

    #[test]
    fn test_all_waiters_drain_on_settlement() {
        let cell = Promise::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        for _ in 0..3 {
            let tx = tx.clone();
            cell.get().run_async(move |result| {
                let _ = tx.send(result);
            });
        }
        cell.complete(9).run_sync().unwrap();
        for _ in 0..3 {
            assert_eq!(rx.recv().unwrap().unwrap(), 9);
        }
    }

    #[test]
    fn test_canceled_get_unregisters_waiter() {
        let cell = Promise::new();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let cancel = cell.get().run_async_cancelable(move |result| {
            let _ = tx.send(result);
        });
        cancel.run_sync().unwrap();

        // the canceled waiter is gone; settlement delivers nothing to it
        cell.complete(4).run_sync().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cross_thread_settlement() {
        let cell = Promise::new();
        let settler = cell.clone();
        std::thread::spawn(move || {
            settler.complete(11).run_sync().unwrap();
        });
        assert_eq!(cell.get().run_sync().unwrap(), 11);
    }
}
