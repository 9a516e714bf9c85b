//! Single-Slot Mailbox
//!
//! A concurrent queue with capacity one: at most one value is in flight at
//! any moment.
//!
//! # Design
//!
//! The mailbox is a two-state machine behind one shared snapshot. While
//! empty it queues suspended readers and takers; while full it holds the
//! current value plus the queue of suspended puts. Every transition happens
//! in one short critical section over the snapshot, and the callbacks it
//! releases are invoked only after the section ends, so no caller ever
//! observes a partial state.
//!
//! Fairness:
//!
//! - queued `take`s are served in arrival order as values arrive;
//! - queued `put`s are accepted in arrival order as takes consume;
//! - `read` peeks without consuming, and every pending read drains before a
//!   take consumes the value that woke them.
//!
//! A `take` against a mailbox that is never filled simply never resumes;
//! callers wanting a bound race against a timer effect explicitly.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::Effect;

/// A suspended `take` or `read`, fed the value on release.
type ValueWaiter<A> = Box<dyn FnOnce(A) + Send>;

/// A suspended `put`, acknowledged once its value is accepted.
type PutAck = Box<dyn FnOnce() + Send>;

/// Deferred callback invocations, run after the critical section.
type Wake = Box<dyn FnOnce() + Send>;

enum State<A> {
    /// No value in flight; readers and takers wait for one.
    Empty {
        reads: VecDeque<(u64, ValueWaiter<A>)>,
        takes: VecDeque<(u64, ValueWaiter<A>)>,
    },
    /// A value in flight; further puts wait for it to be consumed.
    Full {
        value: A,
        puts: VecDeque<(u64, A, PutAck)>,
    },
}

impl<A> State<A> {
    fn empty() -> Self {
        State::Empty {
            reads: VecDeque::new(),
            takes: VecDeque::new(),
        }
    }
}

struct Inner<A> {
    next_id: u64,
    state: State<A>,
}

/// A single-slot concurrent mailbox.
///
/// Handles are cheap to clone and share the underlying slot.
pub struct Mailbox<A> {
    inner: Arc<Mutex<Inner<A>>>,
}

impl<A> Clone for Mailbox<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Clone + Send + 'static> Mailbox<A> {
    /// Create an empty mailbox.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                state: State::empty(),
            })),
        }
    }

    /// Create a mailbox already holding `value`.
    pub fn of(value: A) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                state: State::Full {
                    value,
                    puts: VecDeque::new(),
                },
            })),
        }
    }

    /// Create an empty mailbox as an effect.
    pub fn create() -> Effect<Mailbox<A>> {
        Effect::delay(Mailbox::empty)
    }

    /// Create a filled mailbox as an effect.
    pub fn create_with(value: A) -> Effect<Mailbox<A>> {
        Effect::delay(move || Mailbox::of(value))
    }

    /// Deposit a value, suspending while the slot is occupied.
    ///
    /// An accepted value first satisfies every pending read, then either
    /// hands off to the oldest queued taker or occupies the slot.
    pub fn put(&self, value: A) -> Effect<()> {
        let inner = self.inner.clone();
        Effect::from_callback_cancelable(move |resume| {
            let unregister = inner.clone();
            let mut wake: Vec<Wake> = Vec::new();
            let token = {
                let mut guard = inner.lock();
                let Inner { next_id, state } = &mut *guard;
                match state {
                    State::Empty { reads, takes } => {
                        for (_, read) in reads.drain(..) {
                            let v = value.clone();
                            wake.push(Box::new(move || read(v)));
                        }
                        match takes.pop_front() {
                            Some((_, take)) => wake.push(Box::new(move || take(value))),
                            None => {
                                *state = State::Full {
                                    value,
                                    puts: VecDeque::new(),
                                }
                            }
                        }
                        wake.push(Box::new(move || resume.succeed(())));
                        Effect::unit()
                    }
                    State::Full { puts, .. } => {
                        let id = *next_id;
                        *next_id += 1;
                        puts.push_back((id, value, Box::new(move || resume.succeed(()))));
                        Effect::delay(move || {
                            if let State::Full { puts, .. } = &mut unregister.lock().state {
                                puts.retain(|(pid, _, _)| *pid != id);
                            }
                        })
                    }
                }
            };
            for f in wake {
                f();
            }
            token
        })
    }

    /// Deposit a value only if the slot is free, without suspending.
    pub fn try_put(&self, value: A) -> Effect<bool> {
        let inner = self.inner.clone();
        Effect::delay(move || {
            let mut wake: Vec<Wake> = Vec::new();
            let accepted = {
                let mut guard = inner.lock();
                match &mut guard.state {
                    State::Full { .. } => false,
                    State::Empty { reads, takes } => {
                        for (_, read) in reads.drain(..) {
                            let v = value.clone();
                            wake.push(Box::new(move || read(v)));
                        }
                        match takes.pop_front() {
                            Some((_, take)) => wake.push(Box::new(move || take(value))),
                            None => {
                                guard.state = State::Full {
                                    value,
                                    puts: VecDeque::new(),
                                }
                            }
                        }
                        true
                    }
                }
            };
            for f in wake {
                f();
            }
            accepted
        })
    }

    /// Consume the value, suspending while the slot is empty.
    ///
    /// Consuming promotes the oldest queued put into the slot, if any.
    pub fn take(&self) -> Effect<A> {
        let inner = self.inner.clone();
        Effect::from_callback_cancelable(move |resume| {
            let unregister = inner.clone();
            let mut wake: Vec<Wake> = Vec::new();
            let token = {
                let mut guard = inner.lock();
                let Inner { next_id, state } = &mut *guard;
                match state {
                    State::Full { .. } => {
                        let taken = std::mem::replace(state, State::empty());
                        if let State::Full { value, mut puts } = taken {
                            if let Some((_, promoted, ack)) = puts.pop_front() {
                                *state = State::Full {
                                    value: promoted,
                                    puts,
                                };
                                wake.push(ack);
                            }
                            wake.push(Box::new(move || resume.succeed(value)));
                        }
                        Effect::unit()
                    }
                    State::Empty { takes, .. } => {
                        let id = *next_id;
                        *next_id += 1;
                        takes.push_back((id, Box::new(move |value| resume.succeed(value))));
                        Effect::delay(move || {
                            if let State::Empty { takes, .. } = &mut unregister.lock().state {
                                takes.retain(|(tid, _)| *tid != id);
                            }
                        })
                    }
                }
            };
            for f in wake {
                f();
            }
            token
        })
    }

    /// Consume the value if present, without suspending.
    pub fn try_take(&self) -> Effect<Option<A>> {
        let inner = self.inner.clone();
        Effect::delay(move || {
            let mut wake: Vec<Wake> = Vec::new();
            let out = {
                let mut guard = inner.lock();
                match &guard.state {
                    State::Empty { .. } => None,
                    State::Full { .. } => {
                        let taken = std::mem::replace(&mut guard.state, State::empty());
                        match taken {
                            State::Full { value, mut puts } => {
                                if let Some((_, promoted, ack)) = puts.pop_front() {
                                    guard.state = State::Full {
                                        value: promoted,
                                        puts,
                                    };
                                    wake.push(ack);
                                }
                                Some(value)
                            }
                            State::Empty { .. } => None,
                        }
                    }
                }
            };
            for f in wake {
                f();
            }
            out
        })
    }

    /// Observe the value without consuming it, suspending while empty.
    pub fn read(&self) -> Effect<A> {
        let inner = self.inner.clone();
        Effect::from_callback_cancelable(move |resume| {
            let unregister = inner.clone();
            let mut wake: Vec<Wake> = Vec::new();
            let token = {
                let mut guard = inner.lock();
                let Inner { next_id, state } = &mut *guard;
                match state {
                    State::Full { value, .. } => {
                        let value = value.clone();
                        wake.push(Box::new(move || resume.succeed(value)));
                        Effect::unit()
                    }
                    State::Empty { reads, .. } => {
                        let id = *next_id;
                        *next_id += 1;
                        reads.push_back((id, Box::new(move |value| resume.succeed(value))));
                        Effect::delay(move || {
                            if let State::Empty { reads, .. } = &mut unregister.lock().state {
                                reads.retain(|(rid, _)| *rid != id);
                            }
                        })
                    }
                }
            };
            for f in wake {
                f();
            }
            token
        })
    }

    /// Observe the value without consuming it, without suspending.
    pub fn try_read(&self) -> Effect<Option<A>> {
        let inner = self.inner.clone();
        Effect::delay(move || match &inner.lock().state {
            State::Full { value, .. } => Some(value.clone()),
            State::Empty { .. } => None,
        })
    }

    /// Whether the slot is currently free.
    pub fn is_empty(&self) -> Effect<bool> {
        let inner = self.inner.clone();
        Effect::delay(move || matches!(inner.lock().state, State::Empty { .. }))
    }
}

impl<A: Clone + Send + 'static> Default for Mailbox<A> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A> fmt::Debug for Mailbox<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        match &guard.state {
            State::Empty { reads, takes } => f
                .debug_struct("Mailbox")
                .field("state", &"empty")
                .field("pending_reads", &reads.len())
                .field("pending_takes", &takes.len())
                .finish(),
            State::Full { puts, .. } => f
                .debug_struct("Mailbox")
                .field("state", &"full")
                .field("pending_puts", &puts.len())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_then_take() {
        let mailbox = Mailbox::empty();
        mailbox.put(1).run_sync().unwrap();
        assert_eq!(mailbox.take().run_sync().unwrap(), 1);
        assert!(mailbox.is_empty().run_sync().unwrap());
    }

    #[test]
    fn test_of_starts_full() {
        let mailbox = Mailbox::of(5);
        assert!(!mailbox.is_empty().run_sync().unwrap());
        assert_eq!(mailbox.take().run_sync().unwrap(), 5);
    }

    #[test]
    fn test_queued_takes_are_fifo() {
        let mailbox = Mailbox::empty();
        let (tx, rx) = crossbeam_channel::unbounded();
        for tag in ["first", "second"] {
            let tx = tx.clone();
            mailbox.take().run_async(move |result| {
                let _ = tx.send((tag, result.unwrap()));
            });
        }

        mailbox.put(1).run_sync().unwrap();
        mailbox.put(2).run_sync().unwrap();

        assert_eq!(rx.recv().unwrap(), ("first", 1));
        assert_eq!(rx.recv().unwrap(), ("second", 2));
    }

    #[test]
    fn test_queued_puts_are_fifo() {
        let mailbox = Mailbox::of(0);
        let (tx, rx) = crossbeam_channel::unbounded();
        for value in [1, 2] {
            let tx = tx.clone();
            mailbox.put(value).run_async(move |result| {
                let _ = tx.send(result);
            });
        }
        // both puts are parked behind the occupied slot
        assert!(rx.try_recv().is_err());

        assert_eq!(mailbox.take().run_sync().unwrap(), 0);
        assert_eq!(mailbox.take().run_sync().unwrap(), 1);
        assert_eq!(mailbox.take().run_sync().unwrap(), 2);
        // both puts acknowledged
        assert!(rx.recv().unwrap().is_ok());
        assert!(rx.recv().unwrap().is_ok());
    }

    #[test]
    fn test_read_does_not_consume() {
        let mailbox = Mailbox::of(7);
        assert_eq!(mailbox.read().run_sync().unwrap(), 7);
        assert_eq!(mailbox.read().run_sync().unwrap(), 7);
        assert_eq!(mailbox.take().run_sync().unwrap(), 7);
    }

    #[test]
    fn test_pending_reads_drain_before_take_consumes() {
        let mailbox = Mailbox::empty();
        let (tx, rx) = crossbeam_channel::unbounded();

        let read_tx = tx.clone();
        mailbox.read().run_async(move |result| {
            let _ = read_tx.send(("read", result.unwrap()));
        });
        let take_tx = tx.clone();
        mailbox.take().run_async(move |result| {
            let _ = take_tx.send(("take", result.unwrap()));
        });

        mailbox.put(3).run_sync().unwrap();
        assert_eq!(rx.recv().unwrap(), ("read", 3));
        assert_eq!(rx.recv().unwrap(), ("take", 3));
        assert!(mailbox.is_empty().run_sync().unwrap());
    }

    #[test]
    fn test_try_put_try_take() {
        let mailbox = Mailbox::empty();
        assert!(mailbox.try_put(1).run_sync().unwrap());
        assert!(!mailbox.try_put(2).run_sync().unwrap());
        assert_eq!(mailbox.try_take().run_sync().unwrap(), Some(1));
        assert_eq!(mailbox.try_take().run_sync().unwrap(), None);
    }

    #[test]
    fn test_try_read() {
        let mailbox = Mailbox::empty();
        assert_eq!(mailbox.try_read().run_sync().unwrap(), None);
        mailbox.put(4).run_sync().unwrap();
        assert_eq!(mailbox.try_read().run_sync().unwrap(), Some(4));
        assert_eq!(mailbox.try_read().run_sync().unwrap(), Some(4));
    }

    #[test]
    fn test_take_promotes_queued_put() {
        let mailbox = Mailbox::of(0);
        let (tx, rx) = crossbeam_channel::bounded(1);
        mailbox.put(9).run_async(move |result| {
            let _ = tx.send(result);
        });

        assert_eq!(mailbox.take().run_sync().unwrap(), 0);
        // the queued put's value is now in the slot and the put resumed
        assert!(rx.recv().unwrap().is_ok());
        assert_eq!(mailbox.try_read().run_sync().unwrap(), Some(9));
    }

    #[test]
    fn test_canceled_take_unregisters() {
        let mailbox = Mailbox::empty();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let cancel = mailbox.take().run_async_cancelable(move |result| {
            let _ = tx.send(result);
        });
        cancel.run_sync().unwrap();

        // the canceled taker is gone, so the value stays in the slot
        mailbox.put(1).run_sync().unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(mailbox.try_read().run_sync().unwrap(), Some(1));
    }

    #[test]
    fn test_concurrent_producers_consumers() {
        let mailbox = Mailbox::empty();
        let (tx, rx) = crossbeam_channel::unbounded();

        for chunk in [(0..50).collect::<Vec<u32>>(), (50..100).collect()] {
            let producer = mailbox.clone();
            std::thread::spawn(move || {
                for value in chunk {
                    producer.put(value).run_sync().unwrap();
                }
            });
        }

        let consumer = mailbox.clone();
        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                let _ = tx.send(consumer.take().run_sync().unwrap());
            }
        });
        handle.join().unwrap();

        let mut seen: Vec<u32> = rx.try_iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..100).collect::<Vec<u32>>());
    }
}
