//! Fibers, Racing, Parallel Composition
//!
//! Handles to concurrently running effects, and the combinators that spawn
//! them: `start`, `race_pair`, and `par_map2`/`par_map3`.
//!
//! # Design
//!
//! A fiber is nothing more than a cancel connection plus a completion cell
//! its result lands in: `join` reads the cell, `cancel` cancels the
//! connection. The interpreter spawns no threads of its own; every
//! concurrent combinator hands its work to the caller's execution context.
//!
//! Racing runs both sides under child connections joined into the parent
//! as one composite cancel action, so cancelling the race tears down
//! whichever side is still running. The first side to settle takes the
//! one-shot winner slot; the loser's eventual outcome is absorbed into the
//! completion cell its fiber joins on. A first *failure* wins too: it
//! proactively cancels the sibling and, if that cancellation itself fails,
//! composes the two failures.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancellation::{CancelToken, Connection};
use crate::effect::{Effect, Resume};
use crate::error::Failure;
use crate::executor::ExecHandle;
use crate::promise::Promise;

/// Unique identifier for a fiber, for logs and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber-{}", self.0)
    }
}

/// A handle to a still-running computation.
pub struct Fiber<A> {
    id: FiberId,
    cell: Promise<A>,
    conn: Connection,
}

impl<A> Clone for Fiber<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: self.cell.clone(),
            conn: self.conn.clone(),
        }
    }
}

impl<A: Clone + Send + 'static> Fiber<A> {
    pub(crate) fn new(conn: Connection, cell: Promise<A>) -> Self {
        Self {
            id: FiberId::next(),
            cell,
            conn,
        }
    }

    /// This fiber's id.
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Await the fiber's outcome.
    ///
    /// Raises the fiber's failure if it failed. A fiber that never settles
    /// never resumes the joiner.
    pub fn join(&self) -> Effect<A> {
        self.cell.get()
    }

    /// The effect that cancels the fiber.
    pub fn cancel(&self) -> CancelToken {
        self.conn.cancel()
    }
}

impl<A> fmt::Debug for Fiber<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("id", &self.id).finish()
    }
}

impl<A: Clone + Send + 'static> Effect<A> {
    /// Start this effect on `exec`, returning a handle to it.
    ///
    /// The fiber runs under its own connection: cancelling the spawning
    /// computation does not cancel it. Use [`Fiber::cancel`] for that.
    pub fn start(self, exec: ExecHandle) -> Effect<Fiber<A>> {
        Effect::from_register(move |resume, _conn| {
            let child = Connection::new();
            let cell = Promise::new();
            let fiber = Fiber::new(child.clone(), cell.clone());
            log::debug!("{} started", fiber.id());
            exec.execute(Box::new(move || {
                self.run_with(child, move |result| {
                    let _ = cell.settle(result);
                });
            }));
            resume.succeed(fiber);
        })
    }
}

/// Outcome of [`race_pair`]: the winner's value plus the loser's fiber.
#[derive(Debug)]
pub enum RaceOutcome<A, B> {
    /// The left side settled first.
    Left(A, Fiber<B>),
    /// The right side settled first.
    Right(Fiber<A>, B),
}

/// The shared one-shot winner slot of a race.
type WinnerSlot<A, B> = Arc<Mutex<Option<Resume<RaceOutcome<A, B>>>>>;

/// Run `left` and `right` concurrently on `exec`; the first to settle wins.
///
/// On a winning success the loser keeps running, packaged as a [`Fiber`].
/// On a winning *failure* the loser is proactively canceled; a failure from
/// that cancellation is composed into the delivered one. Cancelling the
/// race cancels whichever sides are still running.
pub fn race_pair<A, B>(
    exec: ExecHandle,
    left: Effect<A>,
    right: Effect<B>,
) -> Effect<RaceOutcome<A, B>>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    Effect::from_register(move |resume, conn| {
        let winner: WinnerSlot<A, B> = Arc::new(Mutex::new(Some(resume)));
        let conn_left = Connection::new();
        let conn_right = Connection::new();
        let cell_left = Promise::<A>::new();
        let cell_right = Promise::<B>::new();
        conn.push_pair(&conn_left, &conn_right);
        let parent = conn.clone();

        {
            let winner = winner.clone();
            let parent = parent.clone();
            let run_conn = conn_left.clone();
            let sibling = conn_right.clone();
            let own_cell = cell_left.clone();
            let loser_cell = cell_right.clone();
            exec.execute(Box::new(move || {
                left.run_with(run_conn, move |result| match result {
                    Ok(value) => {
                        let taken = winner.lock().take();
                        match taken {
                            Some(resume) => {
                                let _ = parent.pop();
                                resume
                                    .succeed(RaceOutcome::Left(value, Fiber::new(sibling, loser_cell)));
                            }
                            None => {
                                let _ = own_cell.settle(Ok(value));
                            }
                        }
                    }
                    Err(failure) => {
                        let taken = winner.lock().take();
                        match taken {
                            Some(resume) => lose_sibling(sibling, parent, failure, resume),
                            None => {
                                let _ = own_cell.settle(Err(failure));
                            }
                        }
                    }
                });
            }));
        }

        {
            let winner = winner.clone();
            let run_conn = conn_right.clone();
            let sibling = conn_left.clone();
            let own_cell = cell_right.clone();
            let loser_cell = cell_left.clone();
            exec.execute(Box::new(move || {
                right.run_with(run_conn, move |result| match result {
                    Ok(value) => {
                        let taken = winner.lock().take();
                        match taken {
                            Some(resume) => {
                                let _ = parent.pop();
                                resume
                                    .succeed(RaceOutcome::Right(Fiber::new(sibling, loser_cell), value));
                            }
                            None => {
                                let _ = own_cell.settle(Ok(value));
                            }
                        }
                    }
                    Err(failure) => {
                        let taken = winner.lock().take();
                        match taken {
                            Some(resume) => lose_sibling(sibling, parent, failure, resume),
                            None => {
                                let _ = own_cell.settle(Err(failure));
                            }
                        }
                    }
                });
            }));
        }
    })
}

/// A race's first failure: cancel the still-running sibling, composing a
/// failure from the cancellation itself, then deliver.
fn lose_sibling<A, B>(
    sibling: Connection,
    parent: Connection,
    failure: Failure,
    resume: Resume<RaceOutcome<A, B>>,
) where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
{
    log::debug!("race lost to a failure, cancelling the sibling");
    sibling.cancel().run_async(move |canceled| {
        let _ = parent.pop();
        let failure = match canceled {
            Ok(()) => failure,
            Err(cancel_failure) => Failure::compose(failure, cancel_failure),
        };
        resume.fail(failure);
    });
}

/// Run both effects concurrently on `exec` and combine their results.
///
/// Both must complete; the first failure cancels the other side and wins
/// the error channel.
pub fn par_map2<A, B, C, F>(exec: ExecHandle, left: Effect<A>, right: Effect<B>, f: F) -> Effect<C>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Send + 'static,
    F: FnOnce(A, B) -> C + Send + 'static,
{
    race_pair(exec, left, right).flat_map(move |outcome| match outcome {
        RaceOutcome::Left(a, fiber) => fiber.join().map(move |b| f(a, b)),
        RaceOutcome::Right(fiber, b) => fiber.join().map(move |a| f(a, b)),
    })
}

/// Three-way [`par_map2`].
pub fn par_map3<A, B, C, D, F>(
    exec: ExecHandle,
    first: Effect<A>,
    second: Effect<B>,
    third: Effect<C>,
    f: F,
) -> Effect<D>
where
    A: Clone + Send + 'static,
    B: Clone + Send + 'static,
    C: Clone + Send + 'static,
    D: Send + 'static,
    F: FnOnce(A, B, C) -> D + Send + 'static,
{
    let paired = par_map2(exec.clone(), first, second, |a, b| (a, b));
    par_map2(exec, paired, third, move |(a, b), c| f(a, b, c))
}
