//! Counting Gate
//!
//! A semaphore permitting up to N concurrent holders, expressed in the
//! effect algebra: acquiring suspends instead of blocking a thread.
//!
//! # Design
//!
//! The gate is a two-state machine behind one shared snapshot: either a
//! non-negative pool of free permits, or a FIFO queue of waiters each owing
//! some remainder of its request. An acquire that finds the pool short
//! consumes what is available and queues for the rest; a release feeds the
//! queue front-first, splitting across several small waiters when the
//! released amount exceeds one waiter's debt. Permits are unsigned, so the
//! pool can never go negative, and releasing above the initial count simply
//! accumulates surplus.
//!
//! Cancelling a suspended acquire removes its waiter and refunds the
//! permits it had already been granted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancellation::CancelToken;
use crate::effect::Effect;

/// A suspended acquirer, woken once its debt reaches zero.
type Wake = Box<dyn FnOnce() + Send>;

struct Waiter {
    id: u64,
    /// Permits still owed before this acquirer can be woken.
    owed: u64,
    wake: Wake,
}

enum State {
    /// Free permits; no one is waiting.
    Available(u64),
    /// FIFO queue of acquirers owed permits; the pool is exhausted.
    Waiting(VecDeque<Waiter>),
}

struct Inner {
    next_id: u64,
    state: State,
}

/// A counting gate.
///
/// Handles are cheap to clone and share the underlying permit pool.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Mutex<Inner>>,
}

impl Semaphore {
    /// Create a gate with `permits` free permits.
    pub fn new(permits: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                state: State::Available(permits),
            })),
        }
    }

    /// Create a gate as an effect.
    pub fn of(permits: u64) -> Effect<Semaphore> {
        Effect::delay(move || Semaphore::new(permits))
    }

    /// Acquire `n` permits, suspending until all are granted.
    ///
    /// Acquiring zero permits is a no-op. Acquiring `n` then `m` gates the
    /// same as acquiring `n + m`.
    pub fn acquire_n(&self, n: u64) -> Effect<()> {
        if n == 0 {
            return Effect::unit();
        }
        let inner = self.inner.clone();
        Effect::from_callback_cancelable(move |resume| {
            let wake_self: Wake = Box::new(move || resume.succeed(()));
            let unregister = inner.clone();
            let (run_now, token) = {
                let mut guard = inner.lock();
                let Inner { next_id, state } = &mut *guard;
                match state {
                    State::Available(pool) if *pool >= n => {
                        *pool -= n;
                        (Some(wake_self), Effect::unit())
                    }
                    State::Available(pool) => {
                        // short: drain the pool and queue for the remainder
                        let owed = n - *pool;
                        let id = *next_id;
                        *next_id += 1;
                        let mut queue = VecDeque::new();
                        queue.push_back(Waiter {
                            id,
                            owed,
                            wake: wake_self,
                        });
                        *state = State::Waiting(queue);
                        (None, cancel_waiter(unregister, id, n))
                    }
                    State::Waiting(queue) => {
                        let id = *next_id;
                        *next_id += 1;
                        queue.push_back(Waiter {
                            id,
                            owed: n,
                            wake: wake_self,
                        });
                        (None, cancel_waiter(unregister, id, n))
                    }
                }
            };
            if let Some(wake) = run_now {
                wake();
            }
            token
        })
    }

    /// Acquire `n` permits only if all are free right now.
    pub fn try_acquire_n(&self, n: u64) -> Effect<bool> {
        let inner = self.inner.clone();
        Effect::delay(move || {
            if n == 0 {
                return true;
            }
            let mut guard = inner.lock();
            match &mut guard.state {
                State::Available(pool) if *pool >= n => {
                    *pool -= n;
                    true
                }
                _ => false,
            }
        })
    }

    /// Return `n` permits, waking queued acquirers front-first.
    ///
    /// A single release splits across several small waiters when `n`
    /// exceeds one waiter's debt; any leftover returns to the pool.
    pub fn release_n(&self, n: u64) -> Effect<()> {
        let inner = self.inner.clone();
        Effect::delay(move || {
            let wakes = grant(&inner, n);
            for wake in wakes {
                wake();
            }
        })
    }

    /// Acquire a single permit.
    pub fn acquire(&self) -> Effect<()> {
        self.acquire_n(1)
    }

    /// Acquire a single permit only if one is free right now.
    pub fn try_acquire(&self) -> Effect<bool> {
        self.try_acquire_n(1)
    }

    /// Return a single permit.
    pub fn release(&self) -> Effect<()> {
        self.release_n(1)
    }

    /// The number of permits free right now; zero while acquirers wait.
    pub fn available(&self) -> Effect<u64> {
        let inner = self.inner.clone();
        Effect::delay(move || match &inner.lock().state {
            State::Available(pool) => *pool,
            State::Waiting(_) => 0,
        })
    }

    /// A signed snapshot of the gate: the free permit count, or the negated
    /// sum of permits owed to queued acquirers.
    pub fn count(&self) -> Effect<i64> {
        let inner = self.inner.clone();
        Effect::delay(move || match &inner.lock().state {
            State::Available(pool) => *pool as i64,
            State::Waiting(queue) => -(queue.iter().map(|w| w.owed).sum::<u64>() as i64),
        })
    }

    /// Run `effect` holding `n` permits, released however it ends.
    pub fn with_permits<A>(&self, n: u64, effect: Effect<A>) -> Effect<A>
    where
        A: Send + 'static,
    {
        let releaser = self.clone();
        self.acquire_n(n)
            .bracket(move |()| effect, move |()| releaser.release_n(n))
    }

    /// Run `effect` holding one permit.
    pub fn with_permit<A>(&self, effect: Effect<A>) -> Effect<A>
    where
        A: Send + 'static,
    {
        self.with_permits(1, effect)
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.lock().state {
            State::Available(pool) => f.debug_struct("Semaphore").field("available", pool).finish(),
            State::Waiting(queue) => f
                .debug_struct("Semaphore")
                .field("waiting", &queue.len())
                .finish(),
        }
    }
}

/// Feed `n` released permits into the gate, returning the wakes to run
/// outside the critical section.
fn grant(inner: &Mutex<Inner>, mut n: u64) -> Vec<Wake> {
    let mut wakes = Vec::new();
    if n == 0 {
        return wakes;
    }
    let mut guard = inner.lock();
    let state = std::mem::replace(&mut guard.state, State::Available(0));
    guard.state = match state {
        State::Available(pool) => State::Available(pool + n),
        State::Waiting(mut queue) => {
            while n > 0 {
                match queue.pop_front() {
                    None => break,
                    Some(mut front) => {
                        if front.owed <= n {
                            n -= front.owed;
                            wakes.push(front.wake);
                        } else {
                            front.owed -= n;
                            n = 0;
                            queue.push_front(front);
                        }
                    }
                }
            }
            if queue.is_empty() {
                State::Available(n)
            } else {
                State::Waiting(queue)
            }
        }
    };
    wakes
}

/// The cancel action for a queued acquire: remove the waiter and refund
/// whatever portion of its request had already been granted.
fn cancel_waiter(inner: Arc<Mutex<Inner>>, id: u64, requested: u64) -> CancelToken {
    Effect::delay(move || {
        let refund = {
            let mut guard = inner.lock();
            let state = std::mem::replace(&mut guard.state, State::Available(0));
            match state {
                State::Waiting(mut queue) => {
                    let refund = match queue.iter().position(|w| w.id == id) {
                        Some(index) => queue.remove(index).map_or(0, |w| requested - w.owed),
                        None => 0,
                    };
                    guard.state = if queue.is_empty() {
                        State::Available(0)
                    } else {
                        State::Waiting(queue)
                    };
                    refund
                }
                settled => {
                    guard.state = settled;
                    0
                }
            }
        };
        let wakes = grant(&inner, refund);
        for wake in wakes {
            wake();
        }
    })
}
