//! # The Trampolined Run Loop
//!
//! Reduces an effect node tree to a final result delivered to a callback,
//! or to a pending asynchronous registration.
//!
//! ## Design
//!
//! The interpreter is a single loop over a mutable "current node" plus an
//! explicit continuation stack: the first pending frame sits in a dedicated
//! slot and the rest in a `Vec`. That stack replaces the native call stack,
//! so a chain of a hundred thousand binds runs in constant native stack
//! depth. One invocation is single-threaded; suspension happens only at
//! async nodes, and resumption may land on a different thread than the one
//! that suspended.
//!
//! Cancellation is polled at the top of every iteration through the active
//! connection. Observing it terminates the loop with the cancellation
//! failure; side effects already completed are not re-run, and side effects
//! not yet reached are never started.
//!
//! On a raised error the continuation stack is scanned for the nearest
//! recovery frame; plain map/bind frames are discarded on the way. With no
//! recovery frame left, the loop terminates with the failure.
//!
//! The resume callback built at an async node captures the live
//! continuation stack by move. It is a `FnOnce`, so "resumed twice" is
//! unrepresentable rather than checked at run time.

use crate::cancellation::Connection;
use crate::effect::{catching, AnyValue, Callback, Frame, Node};
use crate::error::Failure;

/// Enter the loop with an empty continuation stack.
pub(crate) fn start(node: Node, conn: Connection, cb: Callback) {
    run(node, None, Vec::new(), conn, cb);
}

/// Outcome of a single synchronous evaluation pass.
pub(crate) enum Step {
    /// The effect settled without crossing an asynchronous boundary.
    Done(Result<AnyValue, Failure>),
    /// Evaluation stopped at a suspension point; the returned node packages
    /// the remaining work, continuation stack included.
    Suspended(Node),
}

/// Evaluate synchronously up to the first suspension point.
///
/// Used by `run_sync` to finish purely synchronous chains without any
/// blocking machinery. Connection-switching nodes also stop the pass,
/// since they need the live loop's connection threading.
pub(crate) fn step(node: Node) -> Step {
    let mut current = node;
    let mut bind_first: Option<Frame> = None;
    let mut bind_rest: Vec<Frame> = Vec::new();

    loop {
        match current {
            Node::Pure(value) => {
                let mut value = value;
                loop {
                    match pop_frame(&mut bind_first, &mut bind_rest) {
                        None => return Step::Done(Ok(value)),
                        Some(Frame::Map(f)) => {
                            match catching(move || f(value)) {
                                Ok(next) => current = Node::Pure(next),
                                Err(e) => current = Node::RaiseError(e),
                            }
                            break;
                        }
                        Some(Frame::Bind(f)) | Some(Frame::BindHandler(f, _)) => {
                            match catching(move || f(value)) {
                                Ok(next) => current = next,
                                Err(e) => current = Node::RaiseError(e),
                            }
                            break;
                        }
                        Some(Frame::Handler(_)) => continue,
                        Some(Frame::Restore(_, _)) => {
                            unreachable!("connection frames do not occur in synchronous stepping")
                        }
                    }
                }
            }
            Node::RaiseError(failure) => {
                match unwind_to_handler(failure, &mut bind_first, &mut bind_rest) {
                    Unwound::Recovered(next) => current = next,
                    Unwound::Terminal(failure) => return Step::Done(Err(failure)),
                    Unwound::RestoreHit(_, _, failure) => {
                        unreachable!(
                            "connection frames do not occur in synchronous stepping: {}",
                            failure
                        )
                    }
                }
            }
            Node::Delay(thunk) => match catching(thunk) {
                Ok(value) => current = Node::Pure(value),
                Err(e) => current = Node::RaiseError(e),
            },
            Node::Suspend(thunk) => match catching(thunk) {
                Ok(next) => current = next,
                Err(e) => current = Node::RaiseError(e),
            },
            Node::Map(source, f, _) => {
                push_frame(&mut bind_first, &mut bind_rest, Frame::Map(f));
                current = *source;
            }
            Node::Bind(source, frame) => {
                push_frame(&mut bind_first, &mut bind_rest, frame);
                current = *source;
            }
            suspended @ (Node::Async(_) | Node::ContinueOn(_, _) | Node::ConnSwitch(_, _, _)) => {
                // repackage the captured stack around the suspension point
                let mut node = suspended;
                while let Some(frame) = pop_frame(&mut bind_first, &mut bind_rest) {
                    node = Node::Bind(Box::new(node), frame);
                }
                return Step::Suspended(node);
            }
        }
    }
}

/// The main loop. `bind_first`/`bind_rest` together form the continuation
/// stack, newest frame first.
fn run(
    mut current: Node,
    mut bind_first: Option<Frame>,
    mut bind_rest: Vec<Frame>,
    mut conn: Connection,
    cb: Callback,
) {
    loop {
        if conn.is_canceled() {
            log::trace!("run loop observed cancellation");
            cb(Err(Failure::Canceled));
            return;
        }

        match current {
            Node::Pure(value) => {
                let mut value = value;
                loop {
                    match pop_frame(&mut bind_first, &mut bind_rest) {
                        None => {
                            cb(Ok(value));
                            return;
                        }
                        Some(Frame::Map(f)) => {
                            match catching(move || f(value)) {
                                Ok(next) => current = Node::Pure(next),
                                Err(e) => current = Node::RaiseError(e),
                            }
                            break;
                        }
                        Some(Frame::Bind(f)) | Some(Frame::BindHandler(f, _)) => {
                            match catching(move || f(value)) {
                                Ok(next) => current = next,
                                Err(e) => current = Node::RaiseError(e),
                            }
                            break;
                        }
                        // recovery frames pass successes through untouched
                        Some(Frame::Handler(_)) => continue,
                        Some(Frame::Restore(previous, restore)) => {
                            conn = restore(previous, conn);
                            // re-enter the outer loop so the restored
                            // connection is polled before continuing
                            current = Node::Pure(value);
                            break;
                        }
                    }
                }
            }
            Node::RaiseError(failure) => {
                match unwind_to_handler(failure, &mut bind_first, &mut bind_rest) {
                    Unwound::Recovered(next) => current = next,
                    Unwound::Terminal(failure) => {
                        cb(Err(failure));
                        return;
                    }
                    Unwound::RestoreHit(previous, restore, failure) => {
                        conn = restore(previous, conn);
                        current = Node::RaiseError(failure);
                    }
                }
            }
            Node::Delay(thunk) => match catching(thunk) {
                Ok(value) => current = Node::Pure(value),
                Err(e) => current = Node::RaiseError(e),
            },
            Node::Suspend(thunk) => match catching(thunk) {
                Ok(next) => current = next,
                Err(e) => current = Node::RaiseError(e),
            },
            Node::Map(source, f, _) => {
                push_frame(&mut bind_first, &mut bind_rest, Frame::Map(f));
                current = *source;
            }
            Node::Bind(source, frame) => {
                push_frame(&mut bind_first, &mut bind_rest, frame);
                current = *source;
            }
            Node::ContinueOn(source, exec) => {
                // after the source settles, both arms hop to the target
                // context by re-suspending through an async node
                let ok_exec = exec.clone();
                let err_exec = exec;
                let hop = Frame::BindHandler(
                    Box::new(move |value| {
                        Node::Async(Box::new(move |cb, _conn| {
                            ok_exec.execute(Box::new(move || cb(Ok(value))));
                        }))
                    }),
                    Box::new(move |failure| {
                        Node::Async(Box::new(move |cb, _conn| {
                            err_exec.execute(Box::new(move || cb(Err(failure))));
                        }))
                    }),
                );
                push_frame(&mut bind_first, &mut bind_rest, hop);
                current = *source;
            }
            Node::ConnSwitch(source, modify, restore) => {
                let previous = conn.clone();
                conn = modify(conn);
                if let Some(restore) = restore {
                    push_frame(&mut bind_first, &mut bind_rest, Frame::Restore(previous, restore));
                }
                current = *source;
            }
            Node::Async(register) => {
                log::trace!("run loop suspending at async boundary");
                let frames_first = bind_first.take();
                let frames_rest = std::mem::take(&mut bind_rest);
                let resume_conn = conn.clone();
                let resume: Callback = Box::new(move |result| {
                    log::trace!("run loop resuming");
                    match result {
                        Ok(value) => {
                            run(Node::Pure(value), frames_first, frames_rest, resume_conn, cb)
                        }
                        Err(failure) => run(
                            Node::RaiseError(failure),
                            frames_first,
                            frames_rest,
                            resume_conn,
                            cb,
                        ),
                    }
                });
                register(resume, &conn);
                return;
            }
        }
    }
}

/// Result of scanning the stack for a recovery frame.
enum Unwound {
    /// A handler produced the next node.
    Recovered(Node),
    /// No handler left; the failure is terminal.
    Terminal(Failure),
    /// A connection-restore frame was crossed; the caller must restore and
    /// keep unwinding with the failure.
    RestoreHit(Connection, crate::effect::RestoreFn, Failure),
}

/// Discard frames until the nearest recovery frame, applying it.
fn unwind_to_handler(
    failure: Failure,
    bind_first: &mut Option<Frame>,
    bind_rest: &mut Vec<Frame>,
) -> Unwound {
    loop {
        match pop_frame(bind_first, bind_rest) {
            None => return Unwound::Terminal(failure),
            Some(Frame::Map(_)) | Some(Frame::Bind(_)) => continue,
            Some(Frame::Handler(h)) | Some(Frame::BindHandler(_, h)) => {
                return match catching(move || h(failure)) {
                    Ok(next) => Unwound::Recovered(next),
                    Err(e) => Unwound::Recovered(Node::RaiseError(e)),
                };
            }
            Some(Frame::Restore(previous, restore)) => {
                return Unwound::RestoreHit(previous, restore, failure);
            }
        }
    }
}

fn push_frame(bind_first: &mut Option<Frame>, bind_rest: &mut Vec<Frame>, frame: Frame) {
    if let Some(previous) = bind_first.take() {
        bind_rest.push(previous);
    }
    *bind_first = Some(frame);
}

fn pop_frame(bind_first: &mut Option<Frame>, bind_rest: &mut Vec<Frame>) -> Option<Frame> {
    bind_first.take().or_else(|| bind_rest.pop())
}
