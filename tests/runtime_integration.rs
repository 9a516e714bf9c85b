//! End-to-end tests for the effect runtime: stack safety at scale,
//! resource safety under cancellation, fairness of the primitives, and the
//! behaviors that only show up when components are combined.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use riptide::{
    race_pair, sleep, thread_per_job, Effect, Failure, Mailbox, Promise, RaceOutcome, Semaphore,
};

#[test]
fn test_deep_bind_chain_is_stack_safe() {
    let mut eff = Effect::pure(0u64);
    for _ in 0..50_000 {
        eff = eff.flat_map(|x| Effect::pure(x + 1));
    }
    assert_eq!(eff.run_sync().unwrap(), 50_000);
}

#[test]
fn test_bracket_releases_once_when_use_fails() {
    let released = Arc::new(AtomicU32::new(0));
    let r = released.clone();
    let err = Effect::pure(1)
        .bracket(
            |_| Effect::<i32>::raise_error(Failure::msg("use blew up")),
            move |_| {
                Effect::delay(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                })
            },
        )
        .run_sync()
        .unwrap_err();
    assert_eq!(err.to_string(), "use blew up");
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancellation_before_effect() {
    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();
    let eff = sleep(Duration::from_millis(400)).flat_map(move |()| {
        Effect::delay(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    });

    let (tx, rx) = crossbeam_channel::bounded(1);
    let cancel = eff.run_async_cancelable(move |result| {
        let _ = tx.send(result);
    });

    std::thread::sleep(Duration::from_millis(100));
    cancel.run_sync().unwrap();

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.unwrap_err().is_canceled());
    // the canceled chain never reached its side effect
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_masked_section_completes_despite_cancellation() {
    let counter = Arc::new(AtomicU32::new(0));
    let c = counter.clone();
    let eff = sleep(Duration::from_millis(150))
        .flat_map(move |()| {
            Effect::delay(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        })
        .uncancelable();

    let (tx, rx) = crossbeam_channel::bounded(1);
    let cancel = eff.run_async_cancelable(move |result| {
        let _ = tx.send(result);
    });
    cancel.run_sync().unwrap();

    // the masked chain runs to completion; the cancellation is observed
    // only once the mask is restored
    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.unwrap_err().is_canceled());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn test_mailbox_fifo_takes() {
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
fn test_gate_acquire_release_sequence_stays_non_negative() {
    let gate = Semaphore::new(0);
    let (tx, rx) = crossbeam_channel::bounded(1);
    let acquirer = gate.clone();
    gate.acquire_n(3)
        .flat_map(move |()| acquirer.release_n(3))
        .run_async(move |result| {
            let _ = tx.send(result);
        });
    assert_eq!(gate.count().run_sync().unwrap(), -3);

    gate.release_n(3).run_sync().unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();

    assert!(gate.try_acquire_n(1).run_sync().unwrap());
    assert!(gate.count().run_sync().unwrap() >= 0);
}

#[test]
fn test_race_winner_shape_is_deterministic() {
    for _ in 0..10 {
        let outcome = race_pair(thread_per_job(), Effect::<i32>::never(), Effect::pure(1))
            .run_sync()
            .unwrap();
        match outcome {
            RaceOutcome::Right(fiber, value) => {
                assert_eq!(value, 1);
                // the loser is still cancelable
                fiber.cancel().run_sync().unwrap();
            }
            RaceOutcome::Left(_, _) => panic!("the never side cannot win"),
        }
    }
}

#[test]
fn test_explicit_timeout_by_racing() {
    let slow = sleep(Duration::from_secs(30)).map(|()| "value");
    let timeout = sleep(Duration::from_millis(50)).map(|()| "timed out");
    let outcome = race_pair(thread_per_job(), slow, timeout).run_sync().unwrap();
    match outcome {
        RaceOutcome::Right(fiber, label) => {
            assert_eq!(label, "timed out");
            fiber.cancel().run_sync().unwrap();
        }
        RaceOutcome::Left(_, _) => panic!("the 30s sleep cannot win"),
    }
}

#[test]
fn test_continue_on_hops_to_the_target_context() {
    let origin = std::thread::current().id();
    let after_hop = Effect::unit()
        .continue_on(thread_per_job())
        .map(|()| std::thread::current().id())
        .run_sync()
        .unwrap();
    assert_ne!(after_hop, origin);
}

#[test]
fn test_promise_fans_out_across_fibers() {
    let exec = thread_per_job();
    let cell: Promise<u32> = Promise::new();

    let mut joins = Vec::new();
    for _ in 0..4 {
        let reader = cell.clone();
        let fiber = Effect::suspend(move || reader.get())
            .start(exec.clone())
            .run_sync()
            .unwrap();
        joins.push(fiber);
    }

    cell.complete(7).run_sync().unwrap();
    for fiber in joins {
        assert_eq!(fiber.join().run_sync().unwrap(), 7);
    }
}

#[test]
fn test_semaphore_bounds_concurrent_holders() {
    let exec = thread_per_job();
    let gate = Semaphore::new(2);
    let active = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut fibers = Vec::new();
    for _ in 0..8 {
        let enter_active = active.clone();
        let leave = active.clone();
        let peak = peak.clone();
        let enter = Effect::delay(move || {
            let now = enter_active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
        });
        let work = enter
            .flat_map(|()| sleep(Duration::from_millis(20)))
            .map(move |()| {
                leave.fetch_sub(1, Ordering::SeqCst);
            });
        let fiber = gate.with_permit(work).start(exec.clone()).run_sync().unwrap();
        fibers.push(fiber);
    }
    for fiber in fibers {
        fiber.join().run_sync().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(gate.available().run_sync().unwrap(), 2);
}

#[test]
fn test_producer_consumer_pipeline() {
    let exec = thread_per_job();
    let mailbox: Mailbox<u32> = Mailbox::empty();

    let producer_box = mailbox.clone();
    let producer = Effect::suspend(move || {
        fn produce(mailbox: Mailbox<u32>, next: u32) -> Effect<()> {
            if next == 20 {
                Effect::unit()
            } else {
                let rest = mailbox.clone();
                mailbox
                    .put(next)
                    .flat_map(move |()| Effect::suspend(move || produce(rest, next + 1)))
            }
        }
        produce(producer_box, 0)
    })
    .start(exec.clone())
    .run_sync()
    .unwrap();

    let consumer_box = mailbox.clone();
    let consumer = Effect::suspend(move || {
        fn consume(mailbox: Mailbox<u32>, mut seen: Vec<u32>) -> Effect<Vec<u32>> {
            if seen.len() == 20 {
                Effect::pure(seen)
            } else {
                let rest = mailbox.clone();
                mailbox.take().flat_map(move |value| {
                    seen.push(value);
                    Effect::suspend(move || consume(rest, seen))
                })
            }
        }
        consume(consumer_box, Vec::new())
    })
    .start(exec)
    .run_sync()
    .unwrap();

    producer.join().run_sync().unwrap();
    let seen = consumer.join().run_sync().unwrap();
    assert_eq!(seen, (0..20).collect::<Vec<u32>>());
}
