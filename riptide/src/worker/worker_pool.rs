// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words respawn waitpid

//! The worker pool notifier: call dispatch, queueing and backpressure, idle
//! reaping, failure replacement, and graceful stop/start.
//!
//! # Dispatch
//!
//! A call is serialized once, then: the lowest-id idle worker takes it; failing
//! that a new worker is forked while below the maximum; failing that the call
//! queues. Completions for one worker are a FIFO paired with the frames sent to
//! it; cross-worker ordering is not preserved.
//!
//! # Worker lifetime
//!
//! Each worker is one forked subprocess plus one [`ByteStream`] child notifier
//! over `{result pipe, argument pipe}`. Retirement (idle reaping, per-worker call
//! limits, `exit_on_die`, stop) closes the argument channel; the worker's loop
//! sees end-of-input and exits, the result stream reports EOF, and the pool reaps
//! the pid and replaces the worker if that would drop it below the minimum. The
//! idle reaper always retires the **highest**-id idle worker, keeping the warm
//! low-id workers; dispatch prefers the **lowest**-id idle worker for the same
//! reason.
//!
//! [`ByteStream`]: crate::ByteStream

use std::{cell::Cell,
          collections::{BTreeMap, VecDeque},
          rc::Rc,
          time::Duration};

use super::{frame::{self, FrameConsumer},
            worker_child::{self, ServeFn, SetupFn}};
use crate::{notifier::{Notifier, NotifierEntry, NotifierId, NotifierKind},
            reactor::{Reactor, RuntimeError, child_watch},
            stream::ByteStream,
            worker::WorkerFailure};

/// Identity of a worker within its pool. Ascending from zero; never reused.
pub type WorkerId = u32;

/// Erased completion: invoked exactly once with the raw reply body or the failure
/// kind. The typed layer in the pool handle wraps user completions into this.
pub(crate) type ErasedCompletion =
    Box<dyn FnOnce(&mut Reactor, Result<Vec<u8>, WorkerFailure>)>;

/// Validated pool configuration (see the builder for the knobs).
#[derive(Debug, Clone)]
pub(crate) struct PoolOptions {
    pub min_workers: usize,
    pub max_workers: usize,
    pub max_calls_per_worker: Option<u32>,
    pub idle_timeout: Option<Duration>,
    pub exit_on_die: bool,
}

struct WorkerRecord {
    pid: libc::pid_t,
    stream: NotifierId,
    busy: bool,
    /// Argument channel closed; drains its last results and exits.
    retiring: bool,
    remaining_calls: Option<u32>,
    completions: VecDeque<ErasedCompletion>,
}

/// See the [module docs](self). Constructed through the typed
/// [`WorkerPoolBuilder`](crate::WorkerPoolBuilder).
pub struct WorkerPool {
    options: PoolOptions,
    serve: ServeFn,
    setup: Option<SetupFn>,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    pending: VecDeque<(Vec<u8>, ErasedCompletion)>,
    next_worker_id: WorkerId,
    idle_timer: Option<crate::reactor::TimerHandle>,
    /// Shared with the pool handle; set while attached.
    binding: Rc<Cell<Option<NotifierId>>>,
    stopped: bool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending.len())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    pub(crate) fn new(
        options: PoolOptions,
        serve: ServeFn,
        setup: Option<SetupFn>,
        binding: Rc<Cell<Option<NotifierId>>>,
    ) -> Self {
        Self {
            options,
            serve,
            setup,
            workers: BTreeMap::new(),
            pending: VecDeque::new(),
            next_worker_id: 0,
            idle_timer: None,
            binding,
            stopped: false,
        }
    }

    pub(crate) fn validate(&self, _reactor: &Reactor) -> Result<(), RuntimeError> {
        // min ≤ max is enforced by the builder; re-attachment after a stop is
        // legal and restarts the pool.
        Ok(())
    }

    pub(crate) fn on_attach(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
        children: &mut Vec<NotifierId>,
    ) -> Result<(), RuntimeError> {
        self.stopped = false;
        self.binding.set(Some(id));
        for _ in 0..self.options.min_workers {
            self.spawn_worker(reactor, id, children)?;
        }
        Ok(())
    }

    /// Detach stops the pool: pending calls and in-flight completions fail with
    /// [`WorkerFailure::Closed`], worker streams (already detached into
    /// `detached_children`) are dropped so the subprocesses see EOF and exit.
    pub(crate) fn on_detach(
        &mut self,
        reactor: &mut Reactor,
        _id: NotifierId,
        detached_children: &mut Vec<Notifier>,
    ) {
        self.binding.set(None);
        self.stopped = true;
        if let Some(handle) = self.idle_timer.take() {
            reactor.cancel_timer(handle);
        }
        detached_children.clear();

        let mut failed: Vec<ErasedCompletion> = Vec::new();
        for (_, mut record) in std::mem::take(&mut self.workers) {
            failed.extend(record.completions.drain(..));
            reactor.reap_worker_pid(record.pid, 0);
        }
        for (_, completion) in std::mem::take(&mut self.pending) {
            failed.push(completion);
        }
        for completion in failed {
            reactor.defer(move |r| {
                completion(r, Err(WorkerFailure::Closed));
                Ok(())
            });
        }
    }

    /// Step 2 of a call (after the caller serialized the arguments): lowest idle
    /// worker, else fork below max, else queue.
    pub(crate) fn dispatch_call(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
        children: &mut Vec<NotifierId>,
        payload: Vec<u8>,
        completion: ErasedCompletion,
    ) -> Result<(), RuntimeError> {
        if self.stopped {
            return Err(RuntimeError::config("worker pool is stopped"));
        }
        match self.lowest_idle() {
            Some(worker) => self.send_to_worker(reactor, worker, payload, completion)?,
            None if self.workers.len() < self.options.max_workers => {
                let worker = self.spawn_worker(reactor, id, children)?;
                self.send_to_worker(reactor, worker, payload, completion)?;
            }
            None => self.pending.push_back((payload, completion)),
        }
        self.maintain_idle_timer(reactor, id);
        Ok(())
    }

    /// A result frame arrived: pop the head completion, free the worker, apply
    /// call-count and exit-on-die retirement. The completion is returned (not
    /// invoked) so it runs outside the pool's dispatch.
    pub(crate) fn take_result(
        &mut self,
        reactor: &mut Reactor,
        worker: WorkerId,
        payload: &[u8],
    ) -> Option<(ErasedCompletion, Result<Vec<u8>, WorkerFailure>)> {
        let record = self.workers.get_mut(&worker)?;
        let Some(completion) = record.completions.pop_front() else {
            tracing::warn!(worker, "result frame with no outstanding call");
            self.retire_worker(reactor, worker);
            return None;
        };
        record.busy = false;

        let mut retire = false;
        if let Some(remaining) = record.remaining_calls.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                tracing::debug!(worker, "worker reached its call limit");
                retire = true;
            }
        }

        let result = frame::parse_reply(payload);
        if self.options.exit_on_die && matches!(result, Err(WorkerFailure::Error(_))) {
            tracing::debug!(worker, "exit_on_die: shutting worker down after error");
            retire = true;
        }
        if retire {
            self.retire_worker(reactor, worker);
        }
        Some((completion, result))
    }

    /// The worker's stream closed (EOF or error): drop the record, reap the pid,
    /// and hand back every outstanding completion to fail with `Closed`.
    pub(crate) fn remove_worker(
        &mut self,
        reactor: &mut Reactor,
        children: &mut Vec<NotifierId>,
        worker: WorkerId,
    ) -> Option<Vec<ErasedCompletion>> {
        let mut record = self.workers.remove(&worker)?;
        children.retain(|child| *child != record.stream);
        if reactor.is_attached(record.stream) {
            reactor.request_detach(record.stream);
        }
        reactor.reap_worker_pid(record.pid, 0);
        tracing::debug!(worker, pid = record.pid, "worker gone");
        Some(record.completions.drain(..).collect())
    }

    /// Post-dispatch: drain the pending queue into free/spawnable workers, keep
    /// the worker count at or above the minimum, and reconcile the idle timer.
    pub(crate) fn post_dispatch(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
        children: &mut Vec<NotifierId>,
    ) {
        if self.stopped {
            return;
        }
        while !self.pending.is_empty() {
            let worker = match self.lowest_idle() {
                Some(worker) => worker,
                None if self.workers.len() < self.options.max_workers => {
                    match self.spawn_worker(reactor, id, children) {
                        Ok(worker) => worker,
                        Err(err) => {
                            tracing::warn!(%err, "worker spawn for queued call failed");
                            break;
                        }
                    }
                }
                None => break,
            };
            let Some((payload, completion)) = self.pending.pop_front() else {
                break;
            };
            if let Err(err) = self.send_to_worker(reactor, worker, payload, completion) {
                tracing::warn!(%err, worker, "re-dispatch of queued call failed");
            }
        }

        while self.workers.len() < self.options.min_workers {
            if let Err(err) = self.spawn_worker(reactor, id, children) {
                tracing::warn!(%err, "replacement worker spawn failed");
                break;
            }
        }

        self.maintain_idle_timer(reactor, id);
    }

    /// Idle-timeout expiry: retire the highest-id idle worker while the idle set
    /// exceeds the minimum, re-arming while it still does.
    pub(crate) fn idle_expired(&mut self, reactor: &mut Reactor, id: NotifierId) {
        self.idle_timer = None;
        if self.idle_count() > self.options.min_workers {
            if let Some(worker) = self.highest_idle() {
                tracing::debug!(worker, "idle timeout: retiring worker");
                self.retire_worker(reactor, worker);
            }
        }
        self.maintain_idle_timer(reactor, id);
    }

    /// Graceful stop: every worker's argument channel gets end-of-input; queued
    /// calls are handed back to fail with `Closed`.
    pub(crate) fn stop(
        &mut self,
        reactor: &mut Reactor,
    ) -> Vec<ErasedCompletion> {
        self.stopped = true;
        if let Some(handle) = self.idle_timer.take() {
            reactor.cancel_timer(handle);
        }
        let workers: Vec<WorkerId> = self.workers.keys().copied().collect();
        for worker in workers {
            self.retire_worker(reactor, worker);
        }
        std::mem::take(&mut self.pending)
            .into_iter()
            .map(|(_, completion)| completion)
            .collect()
    }

    /// Restart after a stop: allow dispatch again and respawn to the minimum.
    pub(crate) fn start(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
        children: &mut Vec<NotifierId>,
    ) {
        self.stopped = false;
        self.post_dispatch(reactor, id, children);
    }

    pub(crate) fn worker_count(&self) -> usize { self.workers.len() }

    pub(crate) fn pending_count(&self) -> usize { self.pending.len() }

    pub(crate) fn idle_count(&self) -> usize {
        self.workers
            .values()
            .filter(|record| !record.busy && !record.retiring)
            .count()
    }

    // ── Internals ───────────────────────────────────────────────────────────

    fn lowest_idle(&self) -> Option<WorkerId> {
        self.workers
            .iter()
            .find(|(_, record)| !record.busy && !record.retiring)
            .map(|(worker, _)| *worker)
    }

    fn highest_idle(&self) -> Option<WorkerId> {
        self.workers
            .iter()
            .rev()
            .find(|(_, record)| !record.busy && !record.retiring)
            .map(|(worker, _)| *worker)
    }

    fn send_to_worker(
        &mut self,
        reactor: &mut Reactor,
        worker: WorkerId,
        payload: Vec<u8>,
        completion: ErasedCompletion,
    ) -> Result<(), RuntimeError> {
        let Some(record) = self.workers.get_mut(&worker) else {
            return Err(RuntimeError::config("worker vanished before dispatch"));
        };
        record.busy = true;
        record.completions.push_back(completion);
        let stream = record.stream;
        let framed = frame::encode_frame(&payload);
        if let Err(err) = reactor.stream_write(stream, &framed) {
            if let Some(record) = self.workers.get_mut(&worker) {
                record.busy = false;
                if let Some(completion) = record.completions.pop_back() {
                    reactor.defer(move |r| {
                        completion(r, Err(WorkerFailure::Closed));
                        Ok(())
                    });
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Forks a worker and attaches its result/argument stream as a child of the
    /// pool.
    fn spawn_worker(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
        children: &mut Vec<NotifierId>,
    ) -> Result<WorkerId, RuntimeError> {
        let (args_read, args_write) =
            rustix::pipe::pipe().map_err(|errno| RuntimeError::Backend(errno.into()))?;
        let (results_read, results_write) =
            rustix::pipe::pipe().map_err(|errno| RuntimeError::Backend(errno.into()))?;

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(RuntimeError::WorkerFork(std::io::Error::last_os_error()));
        }
        if pid == 0 {
            // Child. Close the parent's ends and serve until end-of-input; never
            // returns, so nothing forked from the parent is dropped here.
            drop(args_write);
            drop(results_read);
            worker_child::run_child(args_read, results_write, &self.serve, self.setup.as_ref());
        }

        // Parent.
        drop(args_read);
        drop(results_write);
        let worker = self.next_worker_id;
        self.next_worker_id += 1;

        let pool_id = id;
        let built = ByteStream::builder()
            .read_fd(results_read)
            .write_fd(args_write)
            .consumer(FrameConsumer::new(pool_id, worker))
            .on_closed(move |r, _reason| {
                // Deferred so it lands after any result frames deferred by the
                // consumer during the same read pass.
                r.defer(move |r| {
                    r.worker_stream_closed(pool_id, worker);
                    Ok(())
                });
                Ok(())
            })
            .build()
            .and_then(|stream| reactor.attach_subtree(Some(id), stream));
        let stream_id = match built {
            Ok(stream_id) => stream_id,
            Err(err) => {
                // The pipes just dropped, so the child sees EOF and exits; only
                // the reap is left to arrange.
                reactor.reap_worker_pid(pid, 0);
                return Err(err);
            }
        };
        children.push(stream_id);

        self.workers.insert(
            worker,
            WorkerRecord {
                pid,
                stream: stream_id,
                busy: false,
                retiring: false,
                remaining_calls: self.options.max_calls_per_worker,
                completions: VecDeque::new(),
            },
        );
        tracing::debug!(worker, pid, "worker spawned");
        Ok(worker)
    }

    /// Sends end-of-input on the worker's argument channel; the worker exits once
    /// it has flushed its last results.
    fn retire_worker(&mut self, reactor: &mut Reactor, worker: WorkerId) {
        let Some(record) = self.workers.get_mut(&worker) else {
            return;
        };
        if record.retiring {
            return;
        }
        record.retiring = true;
        if let Err(err) = reactor.stream_close_when_drained(record.stream) {
            tracing::warn!(worker, %err, "argument channel close failed");
        }
    }

    /// Invariant: the idle timer runs iff idle workers exceed the minimum (and an
    /// idle timeout is configured).
    fn maintain_idle_timer(&mut self, reactor: &mut Reactor, id: NotifierId) {
        let Some(timeout) = self.options.idle_timeout else {
            return;
        };
        let should_run =
            !self.stopped && self.idle_count() > self.options.min_workers;
        match (self.idle_timer, should_run) {
            (None, true) => {
                self.idle_timer = Some(reactor.enqueue_timer(timeout, move |r| {
                    r.pool_idle_expired(id);
                    Ok(())
                }));
            }
            (Some(handle), false) => {
                reactor.cancel_timer(handle);
                self.idle_timer = None;
            }
            _ => {}
        }
    }
}

impl Reactor {
    /// Dispatches an already-serialized call into a pool. Used by the typed pool
    /// handle.
    pub(crate) fn pool_call(
        &mut self,
        pool: NotifierId,
        payload: Vec<u8>,
        completion: ErasedCompletion,
    ) -> Result<(), RuntimeError> {
        self.with_entry(pool, |reactor, entry| {
            let NotifierEntry { children, kind, .. } = entry;
            match kind {
                NotifierKind::Worker(p) => {
                    p.dispatch_call(reactor, pool, children, payload, completion)
                }
                _ => Err(RuntimeError::config("notifier is not a worker pool")),
            }
        })
        .unwrap_or_else(|| Err(RuntimeError::config("unknown or busy worker pool")))
    }

    /// Deferred target for complete result frames: invoke the completion outside
    /// the pool's dispatch, then run post-dispatch.
    pub(crate) fn deliver_worker_frame(
        &mut self,
        pool: NotifierId,
        worker: WorkerId,
        payload: Vec<u8>,
    ) {
        let taken = self
            .with_entry(pool, |reactor, entry| match &mut entry.kind {
                NotifierKind::Worker(p) => p.take_result(reactor, worker, &payload),
                _ => None,
            })
            .flatten();
        if let Some((completion, result)) = taken {
            completion(self, result);
        }
        self.pool_post_dispatch(pool);
    }

    /// Deferred target for a worker stream's close: fail its outstanding
    /// completions with `Closed`, then run post-dispatch (replacement happens
    /// there).
    pub(crate) fn worker_stream_closed(&mut self, pool: NotifierId, worker: WorkerId) {
        let failed = self
            .with_entry(pool, |reactor, entry| {
                let NotifierEntry { children, kind, .. } = entry;
                match kind {
                    NotifierKind::Worker(p) => p.remove_worker(reactor, children, worker),
                    _ => None,
                }
            })
            .flatten();
        if let Some(completions) = failed {
            for completion in completions {
                completion(self, Err(WorkerFailure::Closed));
            }
        }
        self.pool_post_dispatch(pool);
    }

    pub(crate) fn pool_post_dispatch(&mut self, pool: NotifierId) {
        drop(self.with_entry(pool, |reactor, entry| {
            let NotifierEntry { children, kind, .. } = entry;
            if let NotifierKind::Worker(p) = kind {
                p.post_dispatch(reactor, pool, children);
            }
        }));
    }

    pub(crate) fn pool_idle_expired(&mut self, pool: NotifierId) {
        drop(self.with_entry(pool, |reactor, entry| {
            if let NotifierKind::Worker(p) = &mut entry.kind {
                p.idle_expired(reactor, pool);
            }
        }));
    }

    /// Graceful pool stop; see [`WorkerPoolHandle::stop`](crate::WorkerPoolHandle::stop).
    pub(crate) fn pool_stop(&mut self, pool: NotifierId) -> Result<(), RuntimeError> {
        let failed = self
            .with_entry(pool, |reactor, entry| match &mut entry.kind {
                NotifierKind::Worker(p) => Some(p.stop(reactor)),
                _ => None,
            })
            .flatten()
            .ok_or_else(|| RuntimeError::config("unknown or busy worker pool"))?;
        for completion in failed {
            completion(self, Err(WorkerFailure::Closed));
        }
        Ok(())
    }

    /// Restart after [`pool_stop`](Self::pool_stop).
    pub(crate) fn pool_start(&mut self, pool: NotifierId) -> Result<(), RuntimeError> {
        self.with_entry(pool, |reactor, entry| {
            let NotifierEntry { children, kind, .. } = entry;
            match kind {
                NotifierKind::Worker(p) => {
                    p.start(reactor, pool, children);
                    Ok(())
                }
                _ => Err(RuntimeError::config("notifier is not a worker pool")),
            }
        })
        .unwrap_or_else(|| Err(RuntimeError::config("unknown or busy worker pool")))
    }

    /// `(workers, idle, pending)` for a pool; used by callers enforcing pool
    /// invariants in tests and health checks.
    #[must_use]
    pub fn pool_stats(&self, pool: NotifierId) -> Option<(usize, usize, usize)> {
        self.notifiers.get(pool).and_then(|entry| match &entry.kind {
            NotifierKind::Worker(p) => {
                Some((p.worker_count(), p.idle_count(), p.pending_count()))
            }
            _ => None,
        })
    }

    /// Retries a non-blocking reap until the worker subprocess is collected.
    pub(crate) fn reap_worker_pid(&mut self, pid: libc::pid_t, attempts: u32) {
        const MAX_REAP_ATTEMPTS: u32 = 100;
        if child_watch::reap_pid(pid).is_some() {
            return;
        }
        if attempts >= MAX_REAP_ATTEMPTS {
            tracing::warn!(pid, "giving up reaping worker");
            return;
        }
        self.enqueue_timer(Duration::from_millis(50), move |r| {
            r.reap_worker_pid(pid, attempts + 1);
            Ok(())
        });
    }
}
