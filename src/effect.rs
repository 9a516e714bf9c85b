//! # The Effect Value Algebra
//!
//! An [`Effect`] is an immutable description of a deferred computation.
//! Building one never runs anything; composition (`map`, `flat_map`,
//! `attempt`, ...) only allocates new nodes referencing the prior value.
//! Execution happens when a terminal call (`run_sync`, `run_async`,
//! `run_async_cancelable`) hands the value to the trampolined interpreter
//! in the run loop module.
//!
//! ## Design
//!
//! The public type is generic in its result, but the interpreter works on a
//! closed, type-erased node tree: payloads are `Box<dyn Any + Send>` and
//! continuations are boxed `FnOnce` closures that downcast on entry. Erasure
//! keeps the continuation stack homogeneous so the trampoline can hold it in
//! a plain `Vec` instead of the native call stack. The typed wrapper is the
//! only place values are boxed and unboxed, so a mismatched downcast is an
//! interpreter bug, never a user error.
//!
//! Consecutive `map` calls are fused by composing their functions up to a
//! fixed depth ([`MAX_FUSED_MAPS`]); past that, a fresh node is allocated so
//! that applying a long fused chain cannot itself overflow the native stack.
//!
//! Panics inside `delay`/`suspend` thunks and composition closures are
//! caught at the interpreter boundary and reified as raised failures, so
//! that every failure is representable as data.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};

use crate::cancellation::{CancelToken, Connection, DeferredCancel};
use crate::error::Failure;
use crate::executor::ExecHandle;
use crate::run_loop::{self, Step};

/// How many consecutive `map` calls are fused into one composed function
/// before falling back to a fresh node.
pub(crate) const MAX_FUSED_MAPS: u32 = 127;

// ============================================================================
// Erased representation
// ============================================================================

/// A type-erased success value.
pub(crate) type AnyValue = Box<dyn Any + Send>;

/// The interpreter-facing completion callback.
pub(crate) type Callback = Box<dyn FnOnce(Result<AnyValue, Failure>) + Send>;

/// An erased `flat_map` continuation.
pub(crate) type BindFn = Box<dyn FnOnce(AnyValue) -> Node + Send>;

/// An erased `map` function.
pub(crate) type MapFn = Box<dyn FnOnce(AnyValue) -> AnyValue + Send>;

/// An erased error-recovery continuation.
pub(crate) type HandlerFn = Box<dyn FnOnce(Failure) -> Node + Send>;

/// Swaps the active cancel connection for a sub-tree.
pub(crate) type ModifyFn = Box<dyn FnOnce(Connection) -> Connection + Send>;

/// Restores the connection after the sub-tree settles. Receives the
/// connection that was active before the switch and the one active now.
pub(crate) type RestoreFn = Box<dyn FnOnce(Connection, Connection) -> Connection + Send>;

/// An asynchronous registration: receives the resume callback and the
/// active cancel connection.
pub(crate) type RegisterFn = Box<dyn FnOnce(Callback, &Connection) + Send>;

/// The closed node set the interpreter dispatches over.
pub(crate) enum Node {
    /// Already-computed success.
    Pure(AnyValue),
    /// Already-known failure; short-circuits subsequent map/bind.
    RaiseError(Failure),
    /// A synchronous side effect, run once on the current trampoline step.
    Delay(Box<dyn FnOnce() -> AnyValue + Send>),
    /// Deferred construction of the next node; enables safe recursion.
    Suspend(Box<dyn FnOnce() -> Node + Send>),
    /// Suspension point: hands a resume callback to an external source.
    Async(RegisterFn),
    /// Sequencing: run the source, then apply the frame to its outcome.
    Bind(Box<Node>, Frame),
    /// A success-only transformation, with a fusion counter.
    Map(Box<Node>, MapFn, u32),
    /// Forces the remainder of the chain to resume on the given context.
    ContinueOn(Box<Node>, ExecHandle),
    /// Swaps the cancel connection around the source, optionally restoring
    /// it afterwards. Used by masking and by the resource bracket.
    ConnSwitch(Box<Node>, ModifyFn, Option<RestoreFn>),
}

impl Node {
    /// Variant name, for debug output.
    pub(crate) fn variant(&self) -> &'static str {
        match self {
            Node::Pure(_) => "Pure",
            Node::RaiseError(_) => "RaiseError",
            Node::Delay(_) => "Delay",
            Node::Suspend(_) => "Suspend",
            Node::Async(_) => "Async",
            Node::Bind(_, _) => "Bind",
            Node::Map(_, _, _) => "Map",
            Node::ContinueOn(_, _) => "ContinueOn",
            Node::ConnSwitch(_, _, _) => "ConnSwitch",
        }
    }
}

/// A pending continuation on the interpreter's explicit stack.
pub(crate) enum Frame {
    /// Transform the success value.
    Map(MapFn),
    /// Feed the success value into the next node.
    Bind(BindFn),
    /// Recovery frame: invoked on failure, skipped on success.
    Handler(HandlerFn),
    /// Both arms, as pushed by `attempt` and `continue_on`.
    BindHandler(BindFn, HandlerFn),
    /// Restore the cancel connection captured before a switch.
    Restore(Connection, RestoreFn),
}

/// Run a closure, reifying panics into the failure channel.
pub(crate) fn catching<T>(f: impl FnOnce() -> T) -> Result<T, Failure> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Failure::from_panic)
}

/// Unbox an erased value back to its concrete type.
///
/// # Panics
///
/// Panics on a type mismatch, which indicates an interpreter bug: the typed
/// wrapper is the only producer and consumer of erased values.
pub(crate) fn downcast_value<A: Send + 'static>(value: AnyValue) -> A {
    *value
        .downcast::<A>()
        .expect("effect value type mismatch")
}

// ============================================================================
// Resume handle
// ============================================================================

/// The one-shot handle an asynchronous registration uses to resume the run
/// loop.
///
/// Resuming consumes the handle, so "callback invoked twice" is ruled out by
/// ownership rather than a runtime check. Dropping the handle without
/// resuming means the computation never completes.
pub struct Resume<A> {
    cb: Callback,
    _type: PhantomData<fn(A)>,
}

impl<A: Send + 'static> Resume<A> {
    pub(crate) fn new(cb: Callback) -> Self {
        Self {
            cb,
            _type: PhantomData,
        }
    }

    /// Resume the run loop with a success or failure.
    pub fn resolve(self, result: Result<A, Failure>) {
        (self.cb)(result.map(|a| Box::new(a) as AnyValue))
    }

    /// Resume with a success value.
    pub fn succeed(self, value: A) {
        self.resolve(Ok(value))
    }

    /// Resume with a failure.
    pub fn fail(self, failure: Failure) {
        self.resolve(Err(failure))
    }
}

impl<A> fmt::Debug for Resume<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume").finish_non_exhaustive()
    }
}

// ============================================================================
// Effect
// ============================================================================

/// An immutable description of a deferred computation producing `A`.
pub struct Effect<A> {
    pub(crate) node: Node,
    _type: PhantomData<fn() -> A>,
}

impl<A> fmt::Debug for Effect<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Effect").field(&self.node.variant()).finish()
    }
}

impl<A: Send + 'static> Effect<A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _type: PhantomData,
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// An already-computed success.
    pub fn pure(value: A) -> Self {
        Self::from_node(Node::Pure(Box::new(value)))
    }

    /// An already-known failure.
    pub fn raise_error(failure: Failure) -> Self {
        Self::from_node(Node::RaiseError(failure))
    }

    /// A synchronous side effect, run once when the value is interpreted.
    pub fn delay<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_node(Node::Delay(Box::new(move || Box::new(thunk()) as AnyValue)))
    }

    /// Defer construction of the next effect. The standard way to express
    /// recursive definitions without building the whole tree up front.
    pub fn suspend<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Effect<A> + Send + 'static,
    {
        Self::from_node(Node::Suspend(Box::new(move || thunk().node)))
    }

    /// Suspend at an asynchronous boundary.
    ///
    /// `register` receives a one-shot [`Resume`] handle and must arrange for
    /// it to be resolved when the external source completes. The run loop
    /// returns control to its caller until then.
    pub fn from_callback<F>(register: F) -> Self
    where
        F: FnOnce(Resume<A>) + Send + 'static,
    {
        Self::from_node(Node::Async(Box::new(move |cb, _conn| {
            register(Resume::new(cb))
        })))
    }

    /// Like [`Effect::from_callback`], but `register` returns a cancel
    /// action that is pushed on the active cancel connection for as long as
    /// the registration is in flight.
    ///
    /// The action is routed through a deferred slot so that a registration
    /// which resolves synchronously cannot race its own cancel action.
    pub fn from_callback_cancelable<F>(register: F) -> Self
    where
        F: FnOnce(Resume<A>) -> CancelToken + Send + 'static,
    {
        Self::from_node(Node::Async(Box::new(move |cb, conn| {
            let deferred = DeferredCancel::new();
            conn.push(deferred.token());
            let inner = conn.clone();
            let resume = Resume::new(Box::new(move |result| {
                let _ = inner.pop();
                cb(result);
            }));
            let token = register(resume);
            deferred.complete(token);
        })))
    }

    /// Crate-internal registration that also sees the active connection.
    pub(crate) fn from_register<F>(register: F) -> Self
    where
        F: FnOnce(Resume<A>, &Connection) + Send + 'static,
    {
        Self::from_node(Node::Async(Box::new(move |cb, conn| {
            register(Resume::new(cb), conn)
        })))
    }

    /// An effect that never completes.
    pub fn never() -> Self {
        Self::from_callback(|_resume| {})
    }

    // ------------------------------------------------------------------
    // Composition
    // ------------------------------------------------------------------

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        let lifted: MapFn = Box::new(move |value| Box::new(f(downcast_value::<A>(value))) as AnyValue);
        let node = match self.node {
            Node::Map(source, g, fused) if fused < MAX_FUSED_MAPS => {
                Node::Map(source, Box::new(move |value| lifted(g(value))), fused + 1)
            }
            other => Node::Map(Box::new(other), lifted, 0),
        };
        Effect::from_node(node)
    }

    /// Sequence: run `self`, feed its result into `f`.
    pub fn flat_map<B, F>(self, f: F) -> Effect<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B> + Send + 'static,
    {
        Effect::from_node(Node::Bind(
            Box::new(self.node),
            Frame::Bind(Box::new(move |value| f(downcast_value::<A>(value)).node)),
        ))
    }

    /// Reify the outcome as a two-armed value. Never fails.
    pub fn attempt(self) -> Effect<Result<A, Failure>> {
        Effect::from_node(Node::Bind(
            Box::new(self.node),
            Frame::BindHandler(
                Box::new(|value| {
                    Node::Pure(Box::new(Ok::<A, Failure>(downcast_value::<A>(value))))
                }),
                Box::new(|failure| Node::Pure(Box::new(Err::<A, Failure>(failure)))),
            ),
        ))
    }

    /// Recover from a failure with a fallback effect.
    ///
    /// The handler frame is skipped entirely on success.
    pub fn handle_error_with<H>(self, handler: H) -> Effect<A>
    where
        H: FnOnce(Failure) -> Effect<A> + Send + 'static,
    {
        Effect::from_node(Node::Bind(
            Box::new(self.node),
            Frame::Handler(Box::new(move |failure| handler(failure).node)),
        ))
    }

    /// Resume the remainder of the chain on the given execution context.
    pub fn continue_on(self, exec: ExecHandle) -> Effect<A> {
        Effect::from_node(Node::ContinueOn(Box::new(self.node), exec))
    }

    /// Run `self` with cancellation masked.
    ///
    /// The active connection is swapped for one that never reports canceled
    /// and ignores pushed actions; the original is restored once `self`
    /// settles. A cancellation signaled while masked is observed at the
    /// first poll point after the restore.
    pub fn uncancelable(self) -> Effect<A> {
        Effect::from_node(Node::ConnSwitch(
            Box::new(self.node),
            Box::new(|_current| Connection::uncancelable()),
            Some(Box::new(|previous, _current| previous)),
        ))
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Interpret the effect, blocking the calling thread across
    /// asynchronous boundaries until it settles.
    ///
    /// Purely synchronous chains complete without any blocking machinery.
    /// An effect that never resumes blocks forever; callers wanting a bound
    /// must race against a timer effect explicitly.
    pub fn run_sync(self) -> Result<A, Failure> {
        match run_loop::step(self.node) {
            Step::Done(result) => result.map(downcast_value),
            Step::Suspended(node) => {
                let (tx, rx) = crossbeam_channel::bounded(1);
                let sender = tx.clone();
                run_loop::start(
                    node,
                    Connection::uncancelable(),
                    Box::new(move |result| {
                        let _ = sender.send(result);
                    }),
                );
                // `tx` is still alive here, so recv can only return once the
                // callback fires; a dropped callback blocks rather than errs.
                rx.recv()
                    .expect("run_sync result channel closed")
                    .map(downcast_value)
            }
        }
    }

    /// Interpret the effect, delivering the outcome to `cb`.
    ///
    /// Runs synchronously on the calling thread up to the first asynchronous
    /// boundary, then returns; `cb` may fire on whatever thread resumes the
    /// final suspension.
    pub fn run_async<F>(self, cb: F)
    where
        F: FnOnce(Result<A, Failure>) + Send + 'static,
    {
        run_loop::start(
            self.node,
            Connection::uncancelable(),
            Box::new(move |result| cb(result.map(downcast_value))),
        );
    }

    /// Like [`Effect::run_async`], but returns a cancel token.
    ///
    /// Running the token cancels the computation: pushed cleanup actions run
    /// in LIFO order, and the loop terminates with the cancellation failure
    /// at its next poll point instead of a normal result.
    pub fn run_async_cancelable<F>(self, cb: F) -> CancelToken
    where
        F: FnOnce(Result<A, Failure>) + Send + 'static,
    {
        let conn = Connection::new();
        run_loop::start(
            self.node,
            conn.clone(),
            Box::new(move |result| cb(result.map(downcast_value))),
        );
        conn.cancel()
    }

    /// Interpret under a caller-supplied connection.
    pub(crate) fn run_with<F>(self, conn: Connection, cb: F)
    where
        F: FnOnce(Result<A, Failure>) + Send + 'static,
    {
        run_loop::start(
            self.node,
            conn,
            Box::new(move |result| cb(result.map(downcast_value))),
        );
    }
}

impl Effect<()> {
    /// The unit effect.
    pub fn unit() -> Self {
        Effect::pure(())
    }
}
