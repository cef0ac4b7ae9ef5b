// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Timer notifiers riding the reactor time queue.
//!
//! [`CountdownTimer`] arms once per attachment and goes inert after expiring
//! (detach and re-attach to restart). [`PeriodicTimer`] re-arms from the scheduled
//! deadline (not from "now"), so intervals do not drift under dispatch latency.
//! Detaching cancels the pending time-queue entry.

use std::{cell::RefCell,
          rc::Rc,
          time::{Duration, Instant}};

use super::{Notifier, NotifierId, NotifierKind};
use crate::reactor::{CallbackResult, Reactor, RuntimeError, TimerHandle};

type TickFn = Rc<RefCell<dyn FnMut(&mut Reactor) -> CallbackResult>>;

pub(crate) enum TimerNotifier {
    Countdown(CountdownTimer),
    Periodic(PeriodicTimer),
}

pub struct CountdownTimer {
    delay: Duration,
    on_expiry: TickFn,
    pending: Option<TimerHandle>,
}

impl std::fmt::Debug for CountdownTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountdownTimer")
            .field("delay", &self.delay)
            .field("armed", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl CountdownTimer {
    /// One-shot timer firing `delay` after attachment.
    pub fn after(
        delay: Duration,
        on_expiry: impl FnMut(&mut Reactor) -> CallbackResult + 'static,
    ) -> Notifier {
        Notifier::new(NotifierKind::Timer(TimerNotifier::Countdown(Self {
            delay,
            on_expiry: Rc::new(RefCell::new(on_expiry)),
            pending: None,
        })))
    }
}

pub struct PeriodicTimer {
    interval: Duration,
    first_interval: Option<Duration>,
    on_tick: TickFn,
    pending: Option<TimerHandle>,
    next_deadline: Option<Instant>,
}

impl std::fmt::Debug for PeriodicTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTimer")
            .field("interval", &self.interval)
            .field("armed", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl PeriodicTimer {
    /// Repeating timer ticking every `interval` while attached.
    pub fn every(
        interval: Duration,
        on_tick: impl FnMut(&mut Reactor) -> CallbackResult + 'static,
    ) -> Notifier {
        Self::with_first_interval(interval, interval, on_tick)
    }

    /// Like [`every`](Self::every), but the first tick comes after
    /// `first_interval` instead.
    pub fn with_first_interval(
        interval: Duration,
        first_interval: Duration,
        on_tick: impl FnMut(&mut Reactor) -> CallbackResult + 'static,
    ) -> Notifier {
        Notifier::new(NotifierKind::Timer(TimerNotifier::Periodic(Self {
            interval,
            first_interval: Some(first_interval),
            on_tick: Rc::new(RefCell::new(on_tick)),
            pending: None,
            next_deadline: None,
        })))
    }
}

impl TimerNotifier {
    pub(crate) fn on_attach(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
    ) -> Result<(), RuntimeError> {
        let deadline = match self {
            TimerNotifier::Countdown(timer) => Instant::now() + timer.delay,
            TimerNotifier::Periodic(timer) => {
                let first = timer.first_interval.unwrap_or(timer.interval);
                let deadline = Instant::now() + first;
                timer.next_deadline = Some(deadline);
                deadline
            }
        };
        let handle =
            reactor.enqueue_timer_at(deadline, move |r| r.timer_notifier_expired(id));
        match self {
            TimerNotifier::Countdown(timer) => timer.pending = Some(handle),
            TimerNotifier::Periodic(timer) => timer.pending = Some(handle),
        }
        Ok(())
    }

    pub(crate) fn on_detach(&mut self, reactor: &mut Reactor, _id: NotifierId) {
        let pending = match self {
            TimerNotifier::Countdown(timer) => timer.pending.take(),
            TimerNotifier::Periodic(timer) => timer.pending.take(),
        };
        if let Some(handle) = pending {
            reactor.cancel_timer(handle);
        }
    }
}

impl Reactor {
    /// Time-queue callback target for timer notifiers: run the user callback and,
    /// for periodic timers, re-arm from the scheduled deadline.
    pub(crate) fn timer_notifier_expired(&mut self, id: NotifierId) -> CallbackResult {
        let outcome = self.with_entry(id, |reactor, entry| {
            let NotifierKind::Timer(timer) = &mut entry.kind else {
                return Ok(());
            };
            match timer {
                TimerNotifier::Countdown(countdown) => {
                    countdown.pending = None;
                    let callback = Rc::clone(&countdown.on_expiry);
                    (&mut *callback.borrow_mut())(reactor)
                }
                TimerNotifier::Periodic(periodic) => {
                    let scheduled = periodic
                        .next_deadline
                        .unwrap_or_else(Instant::now);
                    let next = scheduled + periodic.interval;
                    periodic.next_deadline = Some(next);
                    periodic.pending = Some(
                        reactor.enqueue_timer_at(next, move |r| r.timer_notifier_expired(id)),
                    );
                    let callback = Rc::clone(&periodic.on_tick);
                    (&mut *callback.borrow_mut())(reactor)
                }
            }
        });
        outcome.unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_countdown_fires_once_while_attached() {
        let mut reactor = Reactor::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let timer = CountdownTimer::after(Duration::from_millis(1), move |_r| {
            counter.set(counter.get() + 1);
            Ok(())
        });
        let id = reactor.attach(timer).unwrap();

        for _ in 0..3 {
            reactor.run_once(Some(Duration::from_millis(20))).unwrap();
        }
        assert_eq!(hits.get(), 1);
        assert!(reactor.is_attached(id));

        // Detach and re-attach re-arms the countdown.
        let timer = reactor.detach(id).unwrap();
        let id = reactor.attach(timer).unwrap();
        reactor.run_once(Some(Duration::from_millis(20))).unwrap();
        assert_eq!(hits.get(), 2);
        drop(reactor.detach(id).unwrap());
    }

    #[test]
    fn test_periodic_ticks_repeatedly() {
        let mut reactor = Reactor::new().unwrap();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let timer = PeriodicTimer::every(Duration::from_millis(2), move |_r| {
            counter.set(counter.get() + 1);
            Ok(())
        });
        let id = reactor.attach(timer).unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        while Instant::now() < deadline && hits.get() < 3 {
            reactor.run_once(Some(Duration::from_millis(5))).unwrap();
        }
        assert!(hits.get() >= 3);

        // Detach cancels the pending tick.
        drop(reactor.detach(id).unwrap());
        let settled = hits.get();
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(hits.get(), settled);
    }

    #[test]
    fn test_add_then_remove_child_restores_tree() {
        let mut reactor = Reactor::new().unwrap();
        let parent = CountdownTimer::after(Duration::from_secs(60), |_r| Ok(()));
        let parent_id = reactor.attach(parent).unwrap();
        assert!(reactor.children_of(parent_id).is_empty());

        let child = CountdownTimer::after(Duration::from_secs(60), |_r| Ok(()));
        let child_id = reactor.add_child(parent_id, child).unwrap();
        assert_eq!(reactor.children_of(parent_id), vec![child_id]);
        assert_eq!(reactor.parent_of(child_id), Some(parent_id));

        let detached = reactor.remove_child(parent_id, child_id).unwrap();
        assert!(reactor.children_of(parent_id).is_empty());
        assert!(!reactor.is_attached(child_id));
        assert_eq!(detached.child_count(), 0);
    }

    #[test]
    fn test_detach_returns_subtree_intact() {
        let mut reactor = Reactor::new().unwrap();
        let mut parent = CountdownTimer::after(Duration::from_secs(60), |_r| Ok(()));
        parent.add_child(CountdownTimer::after(Duration::from_secs(60), |_r| Ok(())));
        parent.add_child(CountdownTimer::after(Duration::from_secs(60), |_r| Ok(())));

        let id = reactor.attach(parent).unwrap();
        assert_eq!(reactor.children_of(id).len(), 2);
        assert_eq!(reactor.notifier_count(), 3);

        let detached = reactor.detach(id).unwrap();
        assert_eq!(detached.child_count(), 2);
        assert_eq!(reactor.notifier_count(), 0);
    }

    #[test]
    fn test_remove_child_rejects_wrong_parent() {
        let mut reactor = Reactor::new().unwrap();
        let a = reactor
            .attach(CountdownTimer::after(Duration::from_secs(60), |_r| Ok(())))
            .unwrap();
        let b = reactor
            .attach(CountdownTimer::after(Duration::from_secs(60), |_r| Ok(())))
            .unwrap();
        assert!(reactor.remove_child(a, b).is_err());
    }
}
