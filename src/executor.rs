//! Execution Context Handle
//!
//! An opaque handle to "where code runs next". The runtime never creates a
//! thread pool of its own; callers hand one in behind the [`Executor`] trait
//! and the run loop only ever asks it to schedule a unit of work.
//!
//! # Design
//!
//! The trait surface is deliberately a single method. Everything the
//! interpreter needs (resuming after an async boundary, hopping contexts at
//! a `continue_on`, launching the two sides of a race) is expressible as
//! "run this closure somewhere, eventually". Fairness, parallelism, and
//! shutdown are the supplier's concern.
//!
//! Two trivial adapters are provided for tests and small programs:
//! [`thread_per_job`] spawns a dedicated thread per job, and [`inline`] runs
//! the job on the calling thread before `execute` returns.

use std::sync::Arc;
use std::thread;

/// A unit of work handed to an execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs, typically a thread pool.
pub trait Executor: Send + Sync {
    /// Schedule a job. May run it before returning (see [`inline`]).
    fn execute(&self, job: Job);
}

/// A shareable handle to an execution context.
pub type ExecHandle = Arc<dyn Executor>;

impl<F> Executor for F
where
    F: Fn(Job) + Send + Sync,
{
    fn execute(&self, job: Job) {
        self(job)
    }
}

/// An executor that spawns one dedicated thread per job.
///
/// Suitable for tests and small programs; production callers should supply
/// a real pool.
struct ThreadPerJob;

impl Executor for ThreadPerJob {
    fn execute(&self, job: Job) {
        let spawned = thread::Builder::new()
            .name("riptide-worker".into())
            .spawn(job);
        if let Err(e) = spawned {
            log::error!("failed to spawn worker thread: {}", e);
        }
    }
}

/// Create a thread-per-job execution context.
pub fn thread_per_job() -> ExecHandle {
    Arc::new(ThreadPerJob)
}

/// An executor that runs each job on the calling thread.
///
/// `execute` does not return until the job completes, so a job that blocks
/// on work scheduled through the same handle will deadlock. Useful for
/// deterministic tests.
struct Inline;

impl Executor for Inline {
    fn execute(&self, job: Job) {
        job()
    }
}

/// Create an inline (calling-thread) execution context.
pub fn inline() -> ExecHandle {
    Arc::new(Inline)
}
