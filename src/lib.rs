//! # Riptide
//!
//! A trampolined effect runtime: deferred computations described as
//! immutable [`Effect`] values, interpreted by a stack-safe run loop with
//! cooperative cancellation, plus a small set of concurrency primitives
//! built on the same algebra.
//!
//! ## Components
//!
//! - **Effect values** ([`Effect`]): an immutable description of a deferred
//!   computation; building and composing one never runs anything.
//! - **Run loop**: the trampolined interpreter behind `run_sync`,
//!   `run_async`, and `run_async_cancelable`; chains of any length run in
//!   constant native stack depth.
//! - **Cancellation** ([`Connection`]): a per-computation LIFO stack of
//!   cleanup actions plus the canceled flag the interpreter polls.
//! - **Execution contexts** ([`Executor`]): the runtime never creates a
//!   thread pool; callers hand one in behind a one-method trait.
//! - **Resource safety** ([`Effect::bracket_case`]): acquire/use/release
//!   with release guaranteed exactly once, cancellation included.
//! - **Fibers & racing** ([`Fiber`], [`race_pair`], [`par_map2`]).
//! - **Primitives**: completion cell ([`Promise`]), single-slot mailbox
//!   ([`Mailbox`]), mutable cell ([`MutCell`]), counting gate
//!   ([`Semaphore`]).
//!
//! ## Example
//!
//! ```rust
//! use riptide::Effect;
//!
//! let value = Effect::pure(20)
//!     .map(|x| x * 2)
//!     .flat_map(|x| Effect::delay(move || x + 2))
//!     .run_sync()
//!     .unwrap();
//! assert_eq!(value, 42);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod bracket;
pub mod cancellation;
pub mod cell;
pub mod effect;
pub mod error;
pub mod executor;
pub mod fiber;
pub mod mailbox;
pub mod promise;
mod run_loop;
pub mod semaphore;
pub mod timer;

// Re-exports
pub use bracket::ExitCase;
pub use cancellation::{CancelToken, Connection};
pub use cell::MutCell;
pub use effect::{Effect, Resume};
pub use error::{AlreadySettled, Failure, Message};
pub use executor::{inline, thread_per_job, ExecHandle, Executor, Job};
pub use fiber::{par_map2, par_map3, race_pair, Fiber, FiberId, RaceOutcome};
pub use mailbox::Mailbox;
pub use promise::Promise;
pub use semaphore::Semaphore;
pub use timer::sleep;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
