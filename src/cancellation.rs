//! Cooperative Cancellation
//!
//! This module provides the cancel connection: the per-computation stack of
//! cleanup actions plus the canceled flag the run loop polls between
//! trampoline steps.
//!
//! # Design
//!
//! Cancellation is cooperative. Cancelling a connection runs every pushed
//! cleanup action in LIFO order and flips the flag; the computation itself
//! only stops at its next poll point or via a pushed action that its
//! asynchronous registration respects. An in-flight registration that never
//! checks the connection cannot be forcibly preempted; that is a deliberate
//! boundary of the model, not a bug.
//!
//! # Components
//!
//! - [`Connection`]: shareable handle to one computation's cancel state
//! - [`CancelToken`]: an effect that, when run, performs a cancellation
//! - [`DeferredCancel`]: a forwarding slot for a cancel action that is not
//!   known yet at the moment it must be registered
//!
//! # Invariants
//!
//! - `cancel` is idempotent and thread-safe; the action stack is taken
//!   exactly once and the canceled state is encoded by its absence.
//! - `push` on an already-canceled connection runs the pushed action
//!   immediately instead of storing it, so no cleanup is ever lost.
//! - `push_pair` collapses two child connections into one composite action,
//!   keeping cancellation trees stack-safe.
//! - Failures from multiple cleanup actions are composed, never dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;
use crate::error::Failure;

/// An effect that, when run, performs a cancellation.
pub type CancelToken = Effect<()>;

/// Shared cancel state for one computation.
enum Inner {
    /// Never reports canceled; push and pop are no-ops.
    Uncancelable,
    /// Live state: the canceled flag plus the action stack.
    ///
    /// The stack being `None` is the canceled sentinel; the atomic flag
    /// mirrors it for the run loop's lock-free poll.
    Active {
        canceled: AtomicBool,
        stack: Mutex<Option<Vec<CancelToken>>>,
    },
}

/// A shareable handle to one running computation's cancel state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Create a live, cancelable connection.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::Active {
                canceled: AtomicBool::new(false),
                stack: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// Create a connection that can never be canceled.
    ///
    /// Used for plain `run_sync`/`run_async` entries and for masked
    /// sections: push and pop are no-ops and the poll always reports alive.
    pub fn uncancelable() -> Self {
        Self {
            inner: Arc::new(Inner::Uncancelable),
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        match &*self.inner {
            Inner::Uncancelable => false,
            Inner::Active { canceled, .. } => canceled.load(Ordering::Acquire),
        }
    }

    /// The effect that cancels this connection.
    ///
    /// Running it flips the canceled flag, takes the action stack, and runs
    /// every action in LIFO order, composing failures from any that fail.
    /// Idempotent: a second run finds the stack already taken and is a
    /// no-op.
    pub fn cancel(&self) -> CancelToken {
        let inner = self.inner.clone();
        Effect::suspend(move || match &*inner {
            Inner::Uncancelable => Effect::unit(),
            Inner::Active { canceled, stack } => {
                canceled.store(true, Ordering::Release);
                let taken = stack.lock().take();
                match taken {
                    None => Effect::unit(),
                    Some(actions) => {
                        log::debug!("cancelling connection, {} action(s)", actions.len());
                        run_all(actions)
                    }
                }
            }
        })
    }

    /// Push a cancel action.
    ///
    /// If the connection is already canceled the action is run immediately
    /// (fire-and-forget) rather than stored.
    pub fn push(&self, token: CancelToken) {
        match &*self.inner {
            Inner::Uncancelable => {}
            Inner::Active { stack, .. } => {
                let run_now = {
                    let mut guard = stack.lock();
                    match guard.as_mut() {
                        Some(actions) => {
                            actions.push(token);
                            None
                        }
                        None => Some(token),
                    }
                };
                if let Some(token) = run_now {
                    log::debug!("push on canceled connection, running action now");
                    token.run_async(|_| {});
                }
            }
        }
    }

    /// Pop the most recently pushed action, or a no-op token if the stack
    /// is empty or the connection is canceled.
    pub fn pop(&self) -> CancelToken {
        match &*self.inner {
            Inner::Uncancelable => Effect::unit(),
            Inner::Active { stack, .. } => match stack.lock().as_mut().and_then(Vec::pop) {
                Some(token) => token,
                None => Effect::unit(),
            },
        }
    }

    /// Push one composite action that cancels both child connections.
    ///
    /// Failures from the two child cancellations are composed.
    pub fn push_pair(&self, left: &Connection, right: &Connection) {
        let left = left.cancel();
        let right = right.cancel();
        let composite = left.attempt().flat_map(move |first| {
            right.attempt().flat_map(move |second| {
                match gather(gather(None, first), second) {
                    None => Effect::unit(),
                    Some(failure) => Effect::raise_error(failure),
                }
            })
        });
        self.push(composite);
    }

    /// Bring a canceled connection back to a live, empty state.
    ///
    /// Returns `true` if the connection was canceled and has been restored
    /// (or was uncancelable, which needs no restoring), `false` if it is
    /// still live and untouched.
    pub fn try_reactivate(&self) -> bool {
        match &*self.inner {
            Inner::Uncancelable => true,
            Inner::Active { canceled, stack } => {
                let mut guard = stack.lock();
                if guard.is_none() {
                    *guard = Some(Vec::new());
                    canceled.store(false, Ordering::Release);
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.inner {
            Inner::Uncancelable => f.debug_struct("Connection").field("kind", &"uncancelable").finish(),
            Inner::Active { canceled, stack } => f
                .debug_struct("Connection")
                .field("canceled", &canceled.load(Ordering::Acquire))
                .field("pending", &stack.lock().as_ref().map_or(0, Vec::len))
                .finish(),
        }
    }
}

/// Sequence cancel actions in LIFO order, composing every failure.
fn run_all(actions: Vec<CancelToken>) -> Effect<()> {
    let mut chain: Effect<Option<Failure>> = Effect::pure(None);
    for action in actions.into_iter().rev() {
        chain = chain.flat_map(move |acc| action.attempt().map(move |result| gather(acc, result)));
    }
    chain.flat_map(|acc| match acc {
        None => Effect::unit(),
        Some(failure) => Effect::raise_error(failure),
    })
}

/// Fold one cleanup outcome into the accumulated failure.
fn gather(acc: Option<Failure>, result: Result<(), Failure>) -> Option<Failure> {
    match (acc, result) {
        (acc, Ok(())) => acc,
        (None, Err(failure)) => Some(failure),
        (Some(first), Err(second)) => Some(Failure::compose(first, second)),
    }
}

// ============================================================================
// Deferred cancel slot
// ============================================================================

/// State of a [`DeferredCancel`] slot.
enum Slot {
    /// No action yet, no cancel requested.
    Empty,
    /// Cancel arrived before the action; run the action on arrival.
    CancelRequested,
    /// Action present, cancel not requested yet.
    Set(CancelToken),
    /// The action has been taken or already run.
    Finished,
}

/// A forwarding slot for a cancel action that is registered before it is
/// known.
///
/// An asynchronous registration must have its cancel action on the
/// connection *before* the register function runs (otherwise a synchronous
/// resume could pop a stranger's action), but the action is the register
/// function's return value. The slot's token is pushed first; the real
/// action is filled in afterwards. A cancellation that fires in between is
/// remembered and the action runs the moment it arrives.
pub(crate) struct DeferredCancel {
    slot: Arc<Mutex<Slot>>,
}

impl DeferredCancel {
    pub(crate) fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Empty)),
        }
    }

    /// The forwarding token to push on a connection.
    pub(crate) fn token(&self) -> CancelToken {
        let slot = self.slot.clone();
        Effect::suspend(move || {
            let mut guard = slot.lock();
            match std::mem::replace(&mut *guard, Slot::Finished) {
                Slot::Set(action) => action,
                Slot::Empty => {
                    *guard = Slot::CancelRequested;
                    Effect::unit()
                }
                Slot::CancelRequested | Slot::Finished => Effect::unit(),
            }
        })
    }

    /// Provide the real cancel action.
    ///
    /// # Panics
    ///
    /// Panics if an action was already provided; that is a protocol
    /// violation by the caller.
    pub(crate) fn complete(&self, action: CancelToken) {
        let run_now = {
            let mut guard = self.slot.lock();
            match std::mem::replace(&mut *guard, Slot::Finished) {
                Slot::Empty => {
                    *guard = Slot::Set(action);
                    return;
                }
                Slot::CancelRequested => Some(action),
                Slot::Set(_) | Slot::Finished => {
                    panic!("cancel action already provided")
                }
            }
        };
        if let Some(action) = run_now {
            action.run_async(|_| {});
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn recording(order: &Arc<Mutex<Vec<u32>>>, id: u32) -> CancelToken {
        let order = order.clone();
        Effect::delay(move || {
            order.lock().push(id);
        })
    }

    #[test]
    fn test_cancel_runs_actions_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let conn = Connection::new();
        conn.push(recording(&order, 1));
        conn.push(recording(&order, 2));
        conn.push(recording(&order, 3));

        conn.cancel().run_sync().unwrap();
        assert_eq!(*order.lock(), vec![3, 2, 1]);
        assert!(conn.is_canceled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let conn = Connection::new();
        conn.push(Effect::delay(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        conn.cancel().run_sync().unwrap();
        conn.cancel().run_sync().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_push_after_cancel_runs_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let conn = Connection::new();
        conn.cancel().run_sync().unwrap();

        let c = counter.clone();
        conn.push(Effect::delay(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_composes_failures() {
        let conn = Connection::new();
        conn.push(Effect::raise_error(Failure::msg("first pushed")));
        conn.push(Effect::raise_error(Failure::msg("second pushed")));

        let err = conn.cancel().run_sync().unwrap_err();
        // LIFO: the second pushed action fails first and becomes primary
        assert_eq!(err.to_string(), "second pushed (suppressed: first pushed)");
    }

    #[test]
    fn test_pop_removes_most_recent() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let conn = Connection::new();
        conn.push(recording(&order, 1));
        conn.push(recording(&order, 2));

        let _ = conn.pop();
        conn.cancel().run_sync().unwrap();
        assert_eq!(*order.lock(), vec![1]);
    }

    #[test]
    fn test_push_pair_cancels_both_children() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let parent = Connection::new();
        let left = Connection::new();
        let right = Connection::new();
        left.push(recording(&order, 1));
        right.push(recording(&order, 2));

        parent.push_pair(&left, &right);
        parent.cancel().run_sync().unwrap();

        assert_eq!(*order.lock(), vec![1, 2]);
        assert!(left.is_canceled());
        assert!(right.is_canceled());
    }

    #[test]
    fn test_uncancelable_ignores_everything() {
        let counter = Arc::new(AtomicU32::new(0));
        let conn = Connection::uncancelable();
        let c = counter.clone();
        conn.push(Effect::delay(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        conn.cancel().run_sync().unwrap();
        assert!(!conn.is_canceled());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_try_reactivate() {
        let conn = Connection::new();
        assert!(!conn.try_reactivate());

        conn.cancel().run_sync().unwrap();
        assert!(conn.is_canceled());
        assert!(conn.try_reactivate());
        assert!(!conn.is_canceled());
    }

    #[test]
    fn test_deferred_cancel_normal_order() {
        let counter = Arc::new(AtomicU32::new(0));
        let deferred = DeferredCancel::new();
        let token = deferred.token();

        let c = counter.clone();
        deferred.complete(Effect::delay(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        token.run_sync().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_cancel_before_complete() {
        let counter = Arc::new(AtomicU32::new(0));
        let deferred = DeferredCancel::new();
        let token = deferred.token();

        // cancel fires first; the action runs when it arrives
        token.run_sync().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let c = counter.clone();
        deferred.complete(Effect::delay(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
