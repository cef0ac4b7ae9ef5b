// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Worker-pool scenarios: squares round-trips, backpressure invariants, failure
//! replacement, and idle reaping. Workers are forked subprocesses, so these tests
//! are serialized.

use std::{cell::RefCell,
          collections::HashMap,
          rc::Rc,
          time::{Duration, Instant}};

use riptide::{Reactor, WorkerFailure, WorkerPoolBuilder};
use serial_test::serial;

fn run_until(
    reactor: &mut Reactor,
    deadline: Duration,
    mut done: impl FnMut(&mut Reactor) -> bool,
) {
    let stop_at = Instant::now() + deadline;
    while !done(reactor) {
        assert!(Instant::now() < stop_at, "scenario timed out");
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }
}

#[test]
#[serial]
fn test_single_call_returns_square() {
    let mut reactor = Reactor::new().unwrap();
    let (pool, handle) = WorkerPoolBuilder::new(|n: i32| Ok::<i32, String>(n * n))
        .min_workers(1)
        .max_workers(1)
        .build()
        .unwrap();
    reactor.attach(pool).unwrap();

    let answer = Rc::new(RefCell::new(None));
    let slot = answer.clone();
    handle
        .call(&mut reactor, &7, move |_r, result| {
            *slot.borrow_mut() = Some(result);
            Ok(())
        })
        .unwrap();

    run_until(&mut reactor, Duration::from_secs(10), |_r| {
        answer.borrow().is_some()
    });
    match answer.borrow_mut().take() {
        Some(Ok(value)) => assert_eq!(value, 49),
        other => panic!("unexpected result: {other:?}"),
    }

    handle.stop(&mut reactor).unwrap();
    let pool_id = handle.id().unwrap();
    run_until(&mut reactor, Duration::from_secs(10), |r| {
        r.pool_stats(pool_id).is_none_or(|(count, _, _)| count == 0)
    });
}

#[test]
#[serial]
fn test_hundred_rapid_calls_each_complete_exactly_once() {
    let mut reactor = Reactor::new().unwrap();
    let (pool, handle) = WorkerPoolBuilder::new(|n: i64| Ok::<i64, String>(n * n))
        .min_workers(1)
        .max_workers(3)
        .build()
        .unwrap();
    let pool_id = reactor.attach(pool).unwrap();

    let results: Rc<RefCell<HashMap<i64, i64>>> = Rc::new(RefCell::new(HashMap::new()));
    let completions = Rc::new(std::cell::Cell::new(0usize));

    for n in 0..100i64 {
        let sink = results.clone();
        let count = completions.clone();
        handle
            .call(&mut reactor, &n, move |_r, result| {
                let value = result.map_err(|err| miette::miette!("call {n} failed: {err}"))?;
                let previous = sink.borrow_mut().insert(n, value);
                assert!(previous.is_none(), "completion for {n} ran twice");
                count.set(count.get() + 1);
                Ok(())
            })
            .unwrap();
    }

    // Backpressure invariant: while calls queue, every worker is busy and the
    // pool is at its maximum.
    if let Some((workers, idle, pending)) = reactor.pool_stats(pool_id) {
        if pending > 0 {
            assert_eq!(idle, 0);
            assert_eq!(workers, 3);
        }
    }

    run_until(&mut reactor, Duration::from_secs(30), |_r| {
        completions.get() == 100
    });

    let results = results.borrow();
    assert_eq!(results.len(), 100);
    for n in 0..100i64 {
        assert_eq!(results[&n], n * n, "wrong square for {n}");
    }

    // Steady state: min ≤ workers ≤ max, nothing pending.
    let (workers, _idle, pending) = reactor.pool_stats(pool_id).unwrap();
    assert!((1..=3).contains(&workers));
    assert_eq!(pending, 0);

    handle.stop(&mut reactor).unwrap();
    run_until(&mut reactor, Duration::from_secs(10), |r| {
        r.pool_stats(pool_id).is_none_or(|(count, _, _)| count == 0)
    });
}

#[test]
#[serial]
fn test_exit_on_die_replaces_worker_and_recovers() {
    let mut reactor = Reactor::new().unwrap();
    let (pool, handle) = WorkerPoolBuilder::new(|n: i32| {
        if n < 0 {
            Err("refusing negative input".to_string())
        } else {
            Ok(n * n)
        }
    })
    .min_workers(1)
    .max_workers(1)
    .exit_on_die(true)
    .build()
    .unwrap();
    let pool_id = reactor.attach(pool).unwrap();

    // First call errors; the failure kind is `Error` with the worker's message.
    let failure = Rc::new(RefCell::new(None));
    let slot = failure.clone();
    handle
        .call(&mut reactor, &-1, move |_r, result| {
            *slot.borrow_mut() = Some(result);
            Ok(())
        })
        .unwrap();
    run_until(&mut reactor, Duration::from_secs(10), |_r| {
        failure.borrow().is_some()
    });
    match failure.borrow_mut().take() {
        Some(Err(WorkerFailure::Error(message))) => {
            assert!(message.contains("refusing negative input"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // A subsequent call succeeds on a freshly spawned worker.
    let answer = Rc::new(RefCell::new(None));
    let slot = answer.clone();
    handle
        .call(&mut reactor, &5, move |_r, result| {
            *slot.borrow_mut() = Some(result);
            Ok(())
        })
        .unwrap();
    run_until(&mut reactor, Duration::from_secs(10), |_r| {
        answer.borrow().is_some()
    });
    match answer.borrow_mut().take() {
        Some(Ok(value)) => assert_eq!(value, 25),
        other => panic!("unexpected result: {other:?}"),
    }

    // The pool is back at its minimum.
    let (workers, _, pending) = reactor.pool_stats(pool_id).unwrap();
    assert_eq!(workers, 1);
    assert_eq!(pending, 0);

    handle.stop(&mut reactor).unwrap();
    run_until(&mut reactor, Duration::from_secs(10), |r| {
        r.pool_stats(pool_id).is_none_or(|(count, _, _)| count == 0)
    });
}

#[test]
#[serial]
fn test_worker_panic_reports_error_not_hang() {
    let mut reactor = Reactor::new().unwrap();
    let (pool, handle) = WorkerPoolBuilder::new(|n: i32| {
        assert!(n != 13, "unlucky input");
        Ok::<i32, String>(n)
    })
    .min_workers(1)
    .max_workers(1)
    .build()
    .unwrap();
    reactor.attach(pool).unwrap();

    let outcome = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    handle
        .call(&mut reactor, &13, move |_r, result| {
            *slot.borrow_mut() = Some(result);
            Ok(())
        })
        .unwrap();
    run_until(&mut reactor, Duration::from_secs(10), |_r| {
        outcome.borrow().is_some()
    });
    match outcome.borrow_mut().take() {
        Some(Err(WorkerFailure::Error(message))) => {
            assert!(message.contains("unlucky input"), "got: {message}");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    handle.stop(&mut reactor).unwrap();
}

#[test]
#[serial]
fn test_max_calls_per_worker_is_transparent() {
    let mut reactor = Reactor::new().unwrap();
    let (pool, handle) = WorkerPoolBuilder::new(|n: u32| Ok::<u32, String>(n + 1))
        .min_workers(1)
        .max_workers(1)
        .max_calls_per_worker(2)
        .build()
        .unwrap();
    reactor.attach(pool).unwrap();

    let completions = Rc::new(std::cell::Cell::new(0u32));
    for n in 0..6u32 {
        let count = completions.clone();
        handle
            .call(&mut reactor, &n, move |_r, result| {
                assert_eq!(result.expect("call failed"), n + 1);
                count.set(count.get() + 1);
                Ok(())
            })
            .unwrap();
    }

    // Six calls across a two-call worker lifetime: three worker generations,
    // invisible to callers.
    run_until(&mut reactor, Duration::from_secs(30), |_r| {
        completions.get() == 6
    });

    handle.stop(&mut reactor).unwrap();
}

#[test]
#[serial]
fn test_idle_timeout_reaps_down_to_minimum() {
    let mut reactor = Reactor::new().unwrap();
    let (pool, handle) = WorkerPoolBuilder::new(|ms: u64| {
        std::thread::sleep(Duration::from_millis(ms));
        Ok::<u64, String>(ms)
    })
    .min_workers(1)
    .max_workers(3)
    .idle_timeout(Duration::from_millis(50))
    .build()
    .unwrap();
    let pool_id = reactor.attach(pool).unwrap();

    let completions = Rc::new(std::cell::Cell::new(0u32));
    for _ in 0..3 {
        let count = completions.clone();
        handle
            .call(&mut reactor, &100u64, move |_r, result| {
                result.expect("slow call failed");
                count.set(count.get() + 1);
                Ok(())
            })
            .unwrap();
    }

    run_until(&mut reactor, Duration::from_secs(10), |_r| {
        completions.get() == 3
    });
    let (workers, _, _) = reactor.pool_stats(pool_id).unwrap();
    assert_eq!(workers, 3);

    // Idle reaping brings the pool back to its minimum.
    run_until(&mut reactor, Duration::from_secs(10), |r| {
        r.pool_stats(pool_id)
            .is_some_and(|(count, _, _)| count == 1)
    });

    handle.stop(&mut reactor).unwrap();
}
