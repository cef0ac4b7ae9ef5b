// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words SIGUSR

//! Signal scenarios: burst delivery through the self-pipe, and watch/unwatch
//! round-trips. Everything here touches the process-wide disposition table, so
//! every test is serialized.

use std::{cell::Cell, rc::Rc, time::Duration};

use riptide::{Reactor, SignalNotifier};
use serial_test::serial;
use signal_hook::consts::SIGUSR1;

#[test]
#[serial]
fn test_usr1_burst_coalesces_but_delivers() {
    let mut reactor = Reactor::new().unwrap();
    let counter = Rc::new(Cell::new(0u32));

    let hits = counter.clone();
    reactor
        .watch_signal(SIGUSR1, move |_r, signal| {
            assert_eq!(signal, SIGUSR1);
            hits.set(hits.get() + 1);
            Ok(())
        })
        .unwrap();

    for _ in 0..1000 {
        signal_hook::low_level::raise(SIGUSR1).unwrap();
    }

    // Drain until the callback has observed the burst.
    let stop_at = std::time::Instant::now() + Duration::from_secs(5);
    let mut settled_rounds = 0;
    while settled_rounds < 3 {
        assert!(std::time::Instant::now() < stop_at, "burst never delivered");
        let before = counter.get();
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
        if counter.get() == before && before > 0 {
            settled_rounds += 1;
        } else {
            settled_rounds = 0;
        }
    }

    // At least one delivery, at most one per raise, and the pipe is drained: no
    // further invocations happen without new raises.
    let total = counter.get();
    assert!((1..=1000).contains(&total), "saw {total} deliveries");
    for _ in 0..3 {
        reactor.run_once(Some(Duration::from_millis(5))).unwrap();
    }
    assert_eq!(counter.get(), total);

    reactor.unwatch_signal(SIGUSR1).unwrap();
}

#[test]
#[serial]
fn test_each_delivery_invokes_watcher_again() {
    let mut reactor = Reactor::new().unwrap();
    let counter = Rc::new(Cell::new(0u32));

    let hits = counter.clone();
    reactor
        .watch_signal(SIGUSR1, move |_r, _signal| {
            hits.set(hits.get() + 1);
            Ok(())
        })
        .unwrap();

    for round in 1..=5 {
        signal_hook::low_level::raise(SIGUSR1).unwrap();
        let stop_at = std::time::Instant::now() + Duration::from_secs(2);
        while counter.get() < round {
            assert!(std::time::Instant::now() < stop_at, "delivery {round} lost");
            reactor.run_once(Some(Duration::from_millis(10))).unwrap();
        }
    }
    assert_eq!(counter.get(), 5);

    reactor.unwatch_signal(SIGUSR1).unwrap();
}

#[test]
#[serial]
fn test_signal_notifier_watches_while_attached() {
    let mut reactor = Reactor::new().unwrap();
    let counter = Rc::new(Cell::new(0u32));

    let hits = counter.clone();
    let watch = SignalNotifier::new(SIGUSR1, move |_r, _signal| {
        hits.set(hits.get() + 1);
        Ok(())
    });
    let id = reactor.attach(watch).unwrap();
    assert!(reactor.is_signal_watched(SIGUSR1));

    signal_hook::low_level::raise(SIGUSR1).unwrap();
    let stop_at = std::time::Instant::now() + Duration::from_secs(2);
    while counter.get() == 0 {
        assert!(std::time::Instant::now() < stop_at, "delivery lost");
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
    }

    // Detach releases the watch and restores the disposition.
    drop(reactor.detach(id).unwrap());
    assert!(!reactor.is_signal_watched(SIGUSR1));
}

#[test]
#[serial]
fn test_duplicate_signal_watch_is_refused() {
    let mut reactor = Reactor::new().unwrap();
    reactor.watch_signal(SIGUSR1, |_r, _signal| Ok(())).unwrap();
    assert!(reactor.watch_signal(SIGUSR1, |_r, _signal| Ok(())).is_err());
    reactor.unwatch_signal(SIGUSR1).unwrap();
}
