//! Timer
//!
//! A sleeping effect. The runtime offers no implicit timeouts; callers
//! build one by racing an effect against [`sleep`] explicitly.
//!
//! # Design
//!
//! Each sleep parks a dedicated timer thread on a condition variable until
//! the deadline. Cancelling the sleep signals the condition variable, so a
//! canceled sleep wakes early instead of holding its thread until expiry;
//! either way the resumption fires and the run loop observes the
//! cancellation at its next poll. The thread itself cannot be preempted
//! mid-wait by anything except that signal: a registration that ignored
//! its cancel action would simply run to the deadline, the deliberate
//! boundary of cooperative cancellation.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::effect::Effect;

/// Complete with `()` after `duration` has elapsed.
///
/// Each call uses a dedicated timer thread; callers with many concurrent
/// sleeps should prefer a timer wheel behind their execution context.
pub fn sleep(duration: Duration) -> Effect<()> {
    Effect::from_callback_cancelable(move |resume| {
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let waiter = signal.clone();
        let spawned = thread::Builder::new()
            .name("riptide-timer".into())
            .spawn(move || {
                let deadline = Instant::now() + duration;
                let (canceled, wakeup) = &*waiter;
                let mut flag = canceled.lock();
                while !*flag {
                    if wakeup.wait_until(&mut flag, deadline).timed_out() {
                        break;
                    }
                }
                drop(flag);
                // on a canceled run the loop turns this into the
                // cancellation failure at its next poll
                resume.succeed(());
            });
        if let Err(e) = spawned {
            log::error!("failed to spawn timer thread: {}", e);
        }
        Effect::delay(move || {
            let (canceled, wakeup) = &*signal;
            *canceled.lock() = true;
            wakeup.notify_one();
        })
    })
}
