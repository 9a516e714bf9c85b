//! Resource-Safe Bracket
//!
//! The guaranteed acquire/use/release pattern: whether the `use` phase
//! succeeds, fails, or is canceled, the release phase runs exactly once.
//!
//! # Design
//!
//! The release action is reachable from two sides: the normal completion
//! path after `use` settles, and the cancel connection if the computation
//! is torn down while `use` is in flight. Both routes go through a one-shot
//! holder for the resource and release function, so whichever side arrives
//! first performs the release and the other finds it empty. The holder's
//! forwarding token is pushed on the connection *before* the acquire phase
//! runs, closing the window where an acquired resource could be orphaned by
//! a cancellation landing between acquire and use.
//!
//! Acquire runs on a connection of its own and cannot be interrupted
//! halfway; release runs with cancellation masked so it always completes.
//! A release failure that follows a `use` failure is composed into the
//! primary failure as a suppressed cause, never dropped.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancellation::{Connection, DeferredCancel};
use crate::effect::Effect;
use crate::error::Failure;

/// How the `use` phase of a bracket ended.
#[derive(Debug, Clone)]
pub enum ExitCase {
    /// `use` produced a value.
    Completed,
    /// `use` failed with the given failure.
    Error(Failure),
    /// The computation was canceled while `use` was in flight.
    Canceled,
}

/// One-shot holder for the resource and release function, shared between
/// the completion path and the cancel path.
struct Releaser<A, R> {
    slot: Mutex<Option<(A, R)>>,
}

impl<A, R> Releaser<A, R>
where
    A: Send + 'static,
    R: FnOnce(A, ExitCase) -> Effect<()> + Send + 'static,
{
    fn new(resource: A, release: R) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Some((resource, release))),
        })
    }

    /// The release effect for `case`; a no-op if the other path already
    /// performed the release. Runs masked so cleanup always completes.
    fn effect(self: &Arc<Self>, case: ExitCase) -> Effect<()> {
        let holder = self.clone();
        Effect::suspend(move || {
            let taken = { holder.slot.lock().take() };
            match taken {
                Some((resource, release)) => release(resource, case),
                None => Effect::unit(),
            }
        })
        .uncancelable()
    }
}

impl<A: Clone + Send + 'static> Effect<A> {
    /// Acquire a resource with `self`, hand it to `use_fn`, and release it
    /// with `release` exactly once, however `use_fn` ends.
    ///
    /// `release` receives the resource and the [`ExitCase`] describing how
    /// the use phase ended. If both `use_fn` and `release` fail, the use
    /// failure is primary and the release failure attached as suppressed.
    pub fn bracket_case<B, U, R>(self, use_fn: U, release: R) -> Effect<B>
    where
        B: Send + 'static,
        U: FnOnce(A) -> Effect<B> + Send + 'static,
        R: FnOnce(A, ExitCase) -> Effect<()> + Send + 'static,
    {
        Effect::from_register(move |resume, conn| {
            let conn = conn.clone();
            // the cleanup slot is on the connection before acquire starts
            let deferred = DeferredCancel::new();
            conn.push(deferred.token());
            self.run_with(Connection::uncancelable(), move |acquired| match acquired {
                Err(failure) => {
                    deferred.complete(Effect::unit());
                    let _ = conn.pop();
                    resume.fail(failure);
                }
                Ok(resource) => {
                    let releaser = Releaser::new(resource.clone(), release);
                    deferred.complete(releaser.effect(ExitCase::Canceled));
                    let finish_conn = conn.clone();
                    let chain = Effect::suspend(move || use_fn(resource))
                        .attempt()
                        .flat_map(move |outcome| {
                            let case = match &outcome {
                                Ok(_) => ExitCase::Completed,
                                Err(failure) => ExitCase::Error(failure.clone()),
                            };
                            releaser.effect(case).attempt().flat_map(move |released| {
                                let _ = finish_conn.pop();
                                match (outcome, released) {
                                    (Ok(value), Ok(())) => Effect::pure(value),
                                    (Ok(_), Err(release_failure)) => {
                                        Effect::raise_error(release_failure)
                                    }
                                    (Err(use_failure), Ok(())) => Effect::raise_error(use_failure),
                                    (Err(use_failure), Err(release_failure)) => Effect::raise_error(
                                        Failure::compose(use_failure, release_failure),
                                    ),
                                }
                            })
                        });
                    chain.run_with(conn, move |result| resume.resolve(result));
                }
            });
        })
    }

    /// [`Effect::bracket_case`] without the exit case.
    pub fn bracket<B, U, R>(self, use_fn: U, release: R) -> Effect<B>
    where
        B: Send + 'static,
        U: FnOnce(A) -> Effect<B> + Send + 'static,
        R: FnOnce(A) -> Effect<()> + Send + 'static,
    {
        self.bracket_case(use_fn, move |resource, _case| release(resource))
    }
}

impl<A: Send + 'static> Effect<A> {
    /// Run `finalizer` after `self`, however `self` ends.
    pub fn guarantee(self, finalizer: Effect<()>) -> Effect<A> {
        Effect::unit().bracket_case(move |()| self, move |(), _case| finalizer)
    }
}
