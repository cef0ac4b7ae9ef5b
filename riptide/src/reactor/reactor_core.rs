// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EINTR SIGCHLD sigprocmask

//! The reactor: one dispatching thread multiplexing fd readiness, timers, signals,
//! and child-process completion.
//!
//! # One loop iteration
//!
//! 1. Effective timeout = `min(next timer deadline - now, caller timeout)`, rounded
//!    up to the next millisecond. An empty poll set degrades to a plain sleep.
//! 2. Block on the poll backend. An interrupted (or empty) wait with a live signal
//!    proxy retries once with a zero timeout so signal-driven work is picked up.
//! 3. Collect ready callbacks into intermediate lists (all read callbacks fire
//!    before any write callback, which fire before any hangup callback) so a
//!    callback that unregisters another watcher cannot corrupt the iteration.
//! 4. Fire expired timers (ties in insertion order; timers enqueued mid-sweep with
//!    already-past deadlines fire in the same sweep).
//! 5. Run the one-shot deferred work list.
//!
//! # Threading
//!
//! The reactor is strictly single-threaded: every callback runs on the thread that
//! called [`Reactor::run`] (or [`Reactor::run_once`]). Handles ([`TimerHandle`],
//! [`NotifierId`]) are plain ids, not thread-safe references. The only asynchronous
//! intrusion is the signal trampoline, confined to the self-pipe in
//! [`signal_proxy`](super::signal_proxy).
//!
//! [`NotifierId`]: crate::NotifierId

use std::{cell::RefCell,
          os::fd::RawFd,
          rc::Rc,
          time::{Duration, Instant}};

use super::{CallbackResult, ChildCallback, ChildExit, ChildWatchTable, InterestMask,
            IoCallback, PollBackend, RuntimeError, SignalProxy, TimeQueue, TimerHandle,
            WatchSlots, WatcherTable, child_watch};
use crate::notifier::NotifierTable;

/// One-shot timer callback.
pub type TimerCallback = Box<dyn FnOnce(&mut Reactor) -> CallbackResult>;

/// One-shot deferred work, run between iterations.
pub(crate) type DeferredCall = Box<dyn FnOnce(&mut Reactor) -> CallbackResult>;

type ErrorSink = Box<dyn FnMut(&RuntimeError)>;

/// Sleep applied when the reactor has nothing to poll and no timeout to honor.
const IDLE_SLEEP: Duration = Duration::from_secs(60);

/// Callback slots for [`Reactor::watch_io`]. Slots left unset keep whatever was
/// previously registered for the fd.
#[derive(Default)]
pub struct IoInterest {
    read: Option<Box<dyn FnMut(&mut Reactor) -> CallbackResult>>,
    write: Option<Box<dyn FnMut(&mut Reactor) -> CallbackResult>>,
    hangup: Option<Box<dyn FnMut(&mut Reactor) -> CallbackResult>>,
}

impl std::fmt::Debug for IoInterest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoInterest")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("hangup", &self.hangup.is_some())
            .finish()
    }
}

impl IoInterest {
    #[must_use]
    pub fn on_read(mut self, cb: impl FnMut(&mut Reactor) -> CallbackResult + 'static) -> Self {
        self.read = Some(Box::new(cb));
        self
    }

    #[must_use]
    pub fn on_write(mut self, cb: impl FnMut(&mut Reactor) -> CallbackResult + 'static) -> Self {
        self.write = Some(Box::new(cb));
        self
    }

    #[must_use]
    pub fn on_hangup(mut self, cb: impl FnMut(&mut Reactor) -> CallbackResult + 'static) -> Self {
        self.hangup = Some(Box::new(cb));
        self
    }
}

/// Which slot an invocation was collected from; used to skip callbacks whose
/// registration changed mid-iteration.
#[derive(Clone, Copy)]
enum IoSlot {
    Read,
    Write,
    Hangup,
}

/// See the [module docs](self).
pub struct Reactor {
    pub(crate) backend: PollBackend,
    pub(crate) watchers: WatcherTable,
    pub(crate) timers: TimeQueue<TimerCallback>,
    pub(crate) signals: Option<SignalProxy>,
    pub(crate) notifiers: NotifierTable,
    child_watches: ChildWatchTable,
    /// True while the `SIGCHLD` watch backing [`Self::watch_child`] is installed.
    sigchld_installed: bool,
    deferred: Vec<DeferredCall>,
    stop_requested: bool,
    error_sink: Option<ErrorSink>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("timers", &self.timers)
            .field("stop_requested", &self.stop_requested)
            .finish_non_exhaustive()
    }
}

impl Reactor {
    pub fn new() -> Result<Self, RuntimeError> {
        Ok(Self {
            backend: PollBackend::new().map_err(RuntimeError::Backend)?,
            watchers: WatcherTable::default(),
            timers: TimeQueue::new(),
            signals: None,
            notifiers: NotifierTable::default(),
            child_watches: ChildWatchTable::default(),
            sigchld_installed: false,
            deferred: Vec::new(),
            stop_requested: false,
            error_sink: None,
        })
    }

    // ── Loop control ────────────────────────────────────────────────────────

    /// Runs iterations until [`stop`](Self::stop) is called from a callback, or a
    /// fatal error (see [`RuntimeError::is_fatal`]) aborts the loop.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        self.stop_requested = false;
        while !self.stop_requested {
            self.run_once(None)?;
        }
        Ok(())
    }

    /// Requests the loop to exit after the current iteration.
    pub fn stop(&mut self) { self.stop_requested = true; }

    /// One loop iteration, blocking at most `caller_timeout` (on top of whatever the
    /// nearest timer allows). Returns the number of I/O and timer callbacks invoked.
    pub fn run_once(&mut self, caller_timeout: Option<Duration>) -> Result<usize, RuntimeError> {
        let now = Instant::now();
        let timer_timeout = self
            .timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        let effective = match (timer_timeout, caller_timeout) {
            (Some(t), Some(c)) => Some(t.min(c)),
            (Some(t), None) => Some(t),
            (None, c) => c,
        }
        .map(ceil_to_millis);

        // Empty poll set: plain sleep, then straight to the timers.
        if self.backend.is_empty() {
            std::thread::sleep(effective.unwrap_or(IDLE_SLEEP));
            let fired = self.fire_due_timers()?;
            self.run_deferred()?;
            return Ok(fired);
        }

        let events = self.wait_for_events(effective)?;

        let mut collected: Vec<(RawFd, IoSlot, IoCallback)> = Vec::new();
        let mut writes: Vec<(RawFd, IoSlot, IoCallback)> = Vec::new();
        let mut hangups: Vec<(RawFd, IoSlot, IoCallback)> = Vec::new();
        for event in &events {
            let Some(watcher) = self.watchers.get(event.fd) else {
                continue;
            };
            if event.readiness.triggers_read() {
                if let Some(cb) = &watcher.read_cb {
                    collected.push((event.fd, IoSlot::Read, Rc::clone(cb)));
                }
            }
            if event.readiness.triggers_write() {
                if let Some(cb) = &watcher.write_cb {
                    writes.push((event.fd, IoSlot::Write, Rc::clone(cb)));
                }
            }
            if event.readiness.triggers_hangup() {
                if let Some(cb) = &watcher.hangup_cb {
                    hangups.push((event.fd, IoSlot::Hangup, Rc::clone(cb)));
                }
            }
        }
        collected.extend(writes);
        collected.extend(hangups);

        let mut invoked = 0;
        for (fd, slot, cb) in collected {
            if !self.still_registered(fd, slot, &cb) {
                continue;
            }
            invoked += 1;
            let result = (&mut *cb.borrow_mut())(self);
            if let Err(err) = result {
                if err.is_fatal() {
                    return Err(err);
                }
                self.report_error(&err);
                self.unwatch_io(
                    fd,
                    InterestMask {
                        read: true,
                        write: true,
                        hangup: true,
                    },
                );
            }
        }

        invoked += self.fire_due_timers()?;
        self.run_deferred()?;
        Ok(invoked)
    }

    /// Routes an error to the sink (after logging it). Used for every survivable
    /// failure; fatal errors abort [`run_once`](Self::run_once) instead.
    pub(crate) fn report_error(&mut self, err: &RuntimeError) {
        tracing::error!(%err, "reactor error");
        if let Some(sink) = &mut self.error_sink {
            sink(err);
        }
    }

    /// Installs the sink that observes survivable runtime errors (callback
    /// failures, fatal I/O on handles, signal dispatch failures). Defaults to
    /// logging only.
    pub fn set_error_sink(&mut self, sink: impl FnMut(&RuntimeError) + 'static) {
        self.error_sink = Some(Box::new(sink));
    }

    /// Schedules one-shot work to run at the end of the current (or next)
    /// iteration, after timers.
    pub fn defer(&mut self, work: impl FnOnce(&mut Reactor) -> CallbackResult + 'static) {
        self.deferred.push(Box::new(work));
    }

    // ── Timers ──────────────────────────────────────────────────────────────

    /// Enqueues a one-shot timer at an absolute deadline.
    pub fn enqueue_timer_at(
        &mut self,
        deadline: Instant,
        callback: impl FnOnce(&mut Reactor) -> CallbackResult + 'static,
    ) -> TimerHandle {
        self.timers.enqueue(deadline, Box::new(callback))
    }

    /// Enqueues a one-shot timer `delay` from now.
    pub fn enqueue_timer(
        &mut self,
        delay: Duration,
        callback: impl FnOnce(&mut Reactor) -> CallbackResult + 'static,
    ) -> TimerHandle {
        self.enqueue_timer_at(Instant::now() + delay, callback)
    }

    /// Cancels a queued timer. Idempotent; fired handles are inert.
    pub fn cancel_timer(&mut self, handle: TimerHandle) { self.timers.cancel(handle); }

    // ── Raw fd watches ──────────────────────────────────────────────────────

    /// Registers (or merges) readiness callbacks for a raw fd. The interest mask
    /// pushed to the backend always reflects exactly the registered callbacks.
    pub fn watch_io(&mut self, fd: RawFd, interest: IoInterest) -> Result<(), RuntimeError> {
        let slots = WatchSlots {
            read: interest.read.map(|cb| wrap_user_io(cb, "io")),
            write: interest.write.map(|cb| wrap_user_io(cb, "io")),
            hangup: interest.hangup.map(|cb| wrap_user_io(cb, "io")),
        };
        self.watch_internal(fd, slots)
    }

    /// Clears the selected callback slots for a raw fd; the fd leaves the backend
    /// when its mask becomes empty.
    pub fn unwatch_io(&mut self, fd: RawFd, which: InterestMask) {
        let mask = self.watchers.clear(fd, which);
        if let Err(err) = self.backend.set_mask(fd, mask) {
            tracing::warn!(fd, %err, "backend mask update failed during unwatch");
        }
    }

    /// The interest mask currently declared to the backend for `fd`.
    #[must_use]
    pub fn interest_mask(&self, fd: RawFd) -> Option<InterestMask> { self.backend.mask_of(fd) }

    pub(crate) fn watch_internal(
        &mut self,
        fd: RawFd,
        slots: WatchSlots,
    ) -> Result<(), RuntimeError> {
        let mask = self.watchers.merge(fd, slots);
        self.backend.set_mask(fd, mask).map_err(RuntimeError::Backend)
    }

    /// Drops every trace of `fd` from the table and backend.
    pub(crate) fn forget_fd(&mut self, fd: RawFd) {
        self.watchers.remove(fd);
        if let Err(err) = self.backend.clear(fd) {
            tracing::warn!(fd, %err, "backend clear failed");
        }
    }

    // ── Signals ─────────────────────────────────────────────────────────────

    /// Watches a POSIX signal. The callback runs on the reactor thread; delivery
    /// bursts within one signal number may coalesce. At most one watch per signal;
    /// the underlying proxy is process-wide.
    pub fn watch_signal(
        &mut self,
        signal: i32,
        callback: impl FnMut(&mut Reactor, i32) -> CallbackResult + 'static,
    ) -> Result<(), RuntimeError> {
        if self.signals.is_none() {
            let proxy = SignalProxy::install()?;
            let fd = proxy.wake_fd();
            self.signals = Some(proxy);
            let pipe_cb: IoCallback =
                Rc::new(RefCell::new(|r: &mut Reactor| r.dispatch_signals()));
            let registered = self.watch_internal(
                fd,
                WatchSlots {
                    read: Some(pipe_cb),
                    ..WatchSlots::default()
                },
            );
            if let Err(err) = registered {
                self.forget_fd(fd);
                self.signals = None;
                return Err(err);
            }
        }

        let Some(proxy) = self.signals.as_mut() else {
            return Err(RuntimeError::config("signal proxy unavailable"));
        };
        let result = proxy.watch(signal, Rc::new(RefCell::new(callback)));
        if result.is_err() && proxy.watch_count() == 0 {
            self.teardown_signal_proxy();
        }
        result
    }

    /// Restores the signal's saved disposition and drops the callback. Tears the
    /// proxy down entirely on the last unwatch.
    pub fn unwatch_signal(&mut self, signal: i32) -> Result<(), RuntimeError> {
        let Some(proxy) = self.signals.as_mut() else {
            return Err(RuntimeError::config("no signal proxy is active"));
        };
        let now_empty = proxy.unwatch(signal)?;
        if now_empty {
            self.teardown_signal_proxy();
        }
        Ok(())
    }

    /// Whether `signal` currently has a watch.
    #[must_use]
    pub fn is_signal_watched(&self, signal: i32) -> bool {
        self.signals
            .as_ref()
            .is_some_and(|proxy| proxy.is_watching(signal))
    }

    fn teardown_signal_proxy(&mut self) {
        if let Some(proxy) = self.signals.take() {
            self.forget_fd(proxy.wake_fd());
            // Dropping the proxy restores dispositions and the trampoline statics.
        }
    }

    /// Read-ready handler for the self-pipe: drain, then dispatch per-signal
    /// callbacks. A failing callback is reported and the rest still dispatch.
    pub(crate) fn dispatch_signals(&mut self) -> Result<(), RuntimeError> {
        let pending = match self.signals.as_mut() {
            Some(proxy) => proxy.collect_pending()?,
            None => return Ok(()),
        };
        for signal in pending {
            let callback = self
                .signals
                .as_ref()
                .and_then(|proxy| proxy.callback_for(signal));
            let Some(callback) = callback else { continue };
            let result = (&mut *callback.borrow_mut())(self, signal);
            if let Err(report) = result {
                self.report_error(&RuntimeError::SignalDispatch { signal, report });
            }
        }
        Ok(())
    }

    // ── Child processes ─────────────────────────────────────────────────────

    /// Watches a child pid for completion. The callback fires exactly once, on the
    /// reactor thread, with the reaped status. Installs a `SIGCHLD` watch through
    /// the signal proxy on first use (and releases it when the last watch fires),
    /// so a separate user watch on `SIGCHLD` conflicts with this.
    pub fn watch_child(
        &mut self,
        pid: i32,
        callback: impl FnOnce(&mut Reactor, ChildExit) -> CallbackResult + 'static,
    ) -> Result<(), RuntimeError> {
        if !self.child_watches.insert(pid, Box::new(callback) as ChildCallback) {
            return Err(RuntimeError::config(format!("pid {pid} is already watched")));
        }
        if !self.sigchld_installed {
            let installed =
                self.watch_signal(libc::SIGCHLD, |r: &mut Reactor, _signal| r.sweep_children());
            if let Err(err) = installed {
                drop(self.child_watches.take(pid));
                return Err(err);
            }
            self.sigchld_installed = true;
        }
        Ok(())
    }

    /// `SIGCHLD` handler: reap everything reapable, dispatch watched completions,
    /// log and drop the rest.
    fn sweep_children(&mut self) -> CallbackResult {
        let mut completions = Vec::new();
        for exit in child_watch::reap_any() {
            match self.child_watches.take(exit.pid) {
                Some(callback) => completions.push((callback, exit)),
                None => {
                    tracing::debug!(pid = exit.pid, "reaped unwatched child");
                }
            }
        }
        for (callback, exit) in completions {
            if let Err(report) = callback(self, exit) {
                self.report_error(&RuntimeError::CallbackFailed {
                    role: "child-watch",
                    report,
                });
            }
        }
        if self.sigchld_installed && self.child_watches.is_empty() {
            self.sigchld_installed = false;
            if let Err(err) = self.unwatch_signal(libc::SIGCHLD) {
                self.report_error(&err);
            }
        }
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn wait_for_events(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Vec<super::IoEvent>, RuntimeError> {
        match self.backend.wait(timeout) {
            Ok(events) => {
                if events.is_empty() && self.signals.is_some() {
                    // Zero result with a live proxy: retry once with zero timeout
                    // to pick up signal-driven work.
                    return self
                        .backend
                        .wait(Some(Duration::ZERO))
                        .map_err(RuntimeError::Backend);
                }
                Ok(events)
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {
                if self.signals.is_some() {
                    self.backend
                        .wait(Some(Duration::ZERO))
                        .map_err(RuntimeError::Backend)
                } else {
                    Ok(Vec::new())
                }
            }
            Err(err) => Err(RuntimeError::Backend(err)),
        }
    }

    /// True when `cb` is still the callback registered in `slot` for `fd`. Guards
    /// against invoking callbacks whose watcher was replaced or removed earlier in
    /// the same iteration.
    fn still_registered(&self, fd: RawFd, slot: IoSlot, cb: &IoCallback) -> bool {
        let Some(watcher) = self.watchers.get(fd) else {
            return false;
        };
        let current = match slot {
            IoSlot::Read => &watcher.read_cb,
            IoSlot::Write => &watcher.write_cb,
            IoSlot::Hangup => &watcher.hangup_cb,
        };
        current.as_ref().is_some_and(|current| Rc::ptr_eq(current, cb))
    }

    fn fire_due_timers(&mut self) -> Result<usize, RuntimeError> {
        let now = Instant::now();
        let mut fired = 0;
        while let Some((_handle, callback)) = self.timers.pop_due(now) {
            fired += 1;
            if let Err(report) = callback(self) {
                self.report_error(&RuntimeError::CallbackFailed {
                    role: "timer",
                    report,
                });
            }
        }
        Ok(fired)
    }

    fn run_deferred(&mut self) -> Result<(), RuntimeError> {
        // Work deferred from within deferred work runs next iteration.
        let batch = std::mem::take(&mut self.deferred);
        for work in batch {
            if let Err(report) = work(self) {
                self.report_error(&RuntimeError::CallbackFailed {
                    role: "deferred",
                    report,
                });
            }
        }
        Ok(())
    }
}

fn wrap_user_io(
    mut cb: Box<dyn FnMut(&mut Reactor) -> CallbackResult>,
    role: &'static str,
) -> IoCallback {
    Rc::new(RefCell::new(move |r: &mut Reactor| {
        cb(r).map_err(|report| RuntimeError::CallbackFailed { role, report })
    }))
}

/// Timeouts are fractional; the backend takes milliseconds. Round up so a timer
/// never fires early.
fn ceil_to_millis(duration: Duration) -> Duration {
    let mut millis = duration.as_millis();
    if duration.as_nanos() % 1_000_000 != 0 {
        millis += 1;
    }
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use test_case::test_case;

    use super::*;

    #[test_case(Duration::from_micros(1), Duration::from_millis(1); "sub-millisecond rounds up")]
    #[test_case(Duration::from_millis(5), Duration::from_millis(5); "exact milliseconds unchanged")]
    #[test_case(Duration::from_micros(5_100), Duration::from_millis(6); "fractional rounds up")]
    #[test_case(Duration::ZERO, Duration::ZERO; "zero stays zero")]
    fn test_ceil_to_millis(input: Duration, expected: Duration) {
        assert_eq!(ceil_to_millis(input), expected);
    }

    #[test]
    fn test_timer_fires_and_counts() {
        let mut reactor = Reactor::new().unwrap();
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let flag = fired.clone();
        reactor.enqueue_timer(Duration::from_millis(1), move |_r| {
            flag.set(true);
            Ok(())
        });
        let invoked = reactor.run_once(Some(Duration::from_millis(50))).unwrap();
        assert!(fired.get());
        assert_eq!(invoked, 1);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let mut reactor = Reactor::new().unwrap();
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let flag = fired.clone();
        let handle = reactor.enqueue_timer(Duration::from_millis(1), move |_r| {
            flag.set(true);
            Ok(())
        });
        reactor.cancel_timer(handle);
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn test_timer_enqueued_due_fires_same_sweep() {
        let mut reactor = Reactor::new().unwrap();
        let order = std::rc::Rc::new(RefCell::new(Vec::new()));
        let outer = order.clone();
        reactor.enqueue_timer(Duration::from_millis(1), move |r| {
            outer.borrow_mut().push("outer");
            let inner = outer.clone();
            // Already due: must fire within the same sweep.
            r.enqueue_timer_at(Instant::now(), move |_r| {
                inner.borrow_mut().push("inner");
                Ok(())
            });
            Ok(())
        });
        reactor.run_once(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_watch_io_read_callback_fires() {
        let mut reactor = Reactor::new().unwrap();
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        let hits = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = hits.clone();

        reactor
            .watch_io(
                read_end.as_raw_fd(),
                IoInterest::default().on_read(move |_r| {
                    counter.set(counter.get() + 1);
                    Ok(())
                }),
            )
            .unwrap();
        assert!(
            reactor
                .interest_mask(read_end.as_raw_fd())
                .is_some_and(|m| m.read)
        );

        rustix::io::write(&write_end, b"ping").unwrap();
        let invoked = reactor.run_once(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(hits.get(), 1);
        assert_eq!(invoked, 1);

        reactor.unwatch_io(
            read_end.as_raw_fd(),
            InterestMask {
                read: true,
                ..InterestMask::default()
            },
        );
        assert!(reactor.interest_mask(read_end.as_raw_fd()).is_none());
    }

    #[test]
    fn test_failing_io_callback_is_unwatched_and_reported() {
        let mut reactor = Reactor::new().unwrap();
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        let seen = std::rc::Rc::new(std::cell::Cell::new(0));
        let sink_hits = seen.clone();
        reactor.set_error_sink(move |_err| sink_hits.set(sink_hits.get() + 1));

        reactor
            .watch_io(
                read_end.as_raw_fd(),
                IoInterest::default().on_read(|_r| miette::bail!("handler exploded")),
            )
            .unwrap();

        rustix::io::write(&write_end, b"x").unwrap();
        reactor.run_once(Some(Duration::from_millis(100))).unwrap();

        assert_eq!(seen.get(), 1);
        assert!(reactor.interest_mask(read_end.as_raw_fd()).is_none());

        // The unwatched fd no longer fires even with data pending.
        rustix::io::write(&write_end, b"y").unwrap();
        let invoked = reactor.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(invoked, 0);
    }

    #[test]
    fn test_deferred_work_runs_once() {
        let mut reactor = Reactor::new().unwrap();
        let hits = std::rc::Rc::new(std::cell::Cell::new(0));
        let counter = hits.clone();
        reactor.defer(move |_r| {
            counter.set(counter.get() + 1);
            Ok(())
        });
        reactor.run_once(Some(Duration::ZERO)).unwrap();
        reactor.run_once(Some(Duration::ZERO)).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_stop_exits_run() {
        let mut reactor = Reactor::new().unwrap();
        reactor.enqueue_timer(Duration::from_millis(1), |r| {
            r.stop();
            Ok(())
        });
        reactor.run().unwrap();
    }
}
