// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words unwind respawn

//! Typed construction of worker pools.
//!
//! The builder captures the user function `Fn(A) -> Result<R, String>` and erases
//! it into the child-side serve loop (decode → invoke, panics caught → encode
//! tagged reply). [`WorkerPoolBuilder::build`] returns the detached pool notifier
//! plus a [`WorkerPoolHandle`] that keeps the typed `A`/`R` surface: it serializes
//! arguments (failing before any frame is written when they cannot be encoded)
//! and deserializes reply bodies into completions.

use std::{cell::Cell,
          marker::PhantomData,
          panic::{AssertUnwindSafe, catch_unwind},
          rc::Rc,
          time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use super::{frame,
            frame::{REPLY_TAG_ERROR, REPLY_TAG_RETURN},
            worker_child::{ServeFn, SetupFn},
            worker_pool::{ErasedCompletion, PoolOptions, WorkerPool}};
use crate::{notifier::{Notifier, NotifierId, NotifierKind},
            reactor::{CallbackResult, Reactor, RuntimeError}};

/// Why a worker call did not produce a return value.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum WorkerFailure {
    /// The worker exited (or its pipe died) before answering. The pool replaces
    /// the worker; the call is not retried automatically.
    #[error("worker closed before answering")]
    #[diagnostic(code(riptide::worker::closed))]
    Closed,

    /// The worker answered with an error tag: the user function returned `Err` or
    /// panicked.
    #[error("worker call failed: {0}")]
    #[diagnostic(code(riptide::worker::error))]
    Error(String),
}

/// Builder for a worker pool hosting `code` in forked subprocesses. Knobs mirror
/// the pool semantics:
///
/// | Knob | Effect |
/// | :--- | :--- |
/// | `min_workers` | Spawned at attach; replacements keep the count at or above |
/// | `max_workers` | Calls beyond this many busy workers queue |
/// | `max_calls_per_worker` | Worker retires after this many answers |
/// | `idle_timeout` | Idle workers above the minimum retire after this long |
/// | `exit_on_die` | An error reply also retires the worker |
/// | `setup` | Runs in the child after fork, before the serve loop |
pub struct WorkerPoolBuilder<A, R> {
    code: Rc<dyn Fn(A) -> Result<R, String>>,
    min_workers: usize,
    max_workers: usize,
    max_calls_per_worker: Option<u32>,
    idle_timeout: Option<Duration>,
    exit_on_die: bool,
    setup: Option<SetupFn>,
}

impl<A, R> std::fmt::Debug for WorkerPoolBuilder<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolBuilder")
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .field("exit_on_die", &self.exit_on_die)
            .finish_non_exhaustive()
    }
}

impl<A, R> WorkerPoolBuilder<A, R>
where
    A: DeserializeOwned + 'static,
    R: Serialize + 'static,
{
    /// Starts a builder around the function each worker subprocess will host.
    pub fn new(code: impl Fn(A) -> Result<R, String> + 'static) -> Self {
        Self {
            code: Rc::new(code),
            min_workers: 1,
            max_workers: 1,
            max_calls_per_worker: None,
            idle_timeout: None,
            exit_on_die: false,
            setup: None,
        }
    }

    #[must_use]
    pub fn min_workers(mut self, min: usize) -> Self {
        self.min_workers = min;
        self
    }

    #[must_use]
    pub fn max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    #[must_use]
    pub fn max_calls_per_worker(mut self, calls: u32) -> Self {
        self.max_calls_per_worker = Some(calls);
        self
    }

    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn exit_on_die(mut self, exit: bool) -> Self {
        self.exit_on_die = exit;
        self
    }

    /// Hook run in each child after fork, before serving (closing inherited
    /// descriptors and similar).
    #[must_use]
    pub fn setup(mut self, setup: impl Fn() + 'static) -> Self {
        self.setup = Some(Rc::new(setup));
        self
    }

    /// Validates the configuration and produces the detached pool notifier plus
    /// its typed handle. The handle goes live when the notifier is attached.
    pub fn build(self) -> Result<(Notifier, WorkerPoolHandle<A, R>), RuntimeError> {
        if self.max_workers == 0 {
            return Err(RuntimeError::config("max_workers must be at least 1"));
        }
        if self.min_workers > self.max_workers {
            return Err(RuntimeError::config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.max_calls_per_worker == Some(0) {
            return Err(RuntimeError::config(
                "max_calls_per_worker must be at least 1",
            ));
        }

        let code = Rc::clone(&self.code);
        let serve: ServeFn = Rc::new(move |payload: &[u8]| serve_one(&code, payload));

        let binding = Rc::new(Cell::new(None));
        let pool = WorkerPool::new(
            PoolOptions {
                min_workers: self.min_workers,
                max_workers: self.max_workers,
                max_calls_per_worker: self.max_calls_per_worker,
                idle_timeout: self.idle_timeout,
                exit_on_die: self.exit_on_die,
            },
            serve,
            self.setup,
            Rc::clone(&binding),
        );
        let handle = WorkerPoolHandle {
            binding,
            _types: PhantomData,
        };
        Ok((Notifier::new(NotifierKind::Worker(pool)), handle))
    }
}

/// One child-side call: decode the arguments, invoke the user function (catching
/// panics), encode the tagged reply.
fn serve_one<A, R>(code: &Rc<dyn Fn(A) -> Result<R, String>>, payload: &[u8]) -> Vec<u8>
where
    A: DeserializeOwned,
    R: Serialize,
{
    let args: A = match frame::try_decode(payload) {
        Ok(args) => args,
        Err(report) => return error_reply(&format!("argument decode failed: {report}")),
    };
    match catch_unwind(AssertUnwindSafe(|| code(args))) {
        Ok(Ok(value)) => match frame::try_encode(&value) {
            Ok(body) => tagged_reply(REPLY_TAG_RETURN, &body),
            Err(report) => error_reply(&format!("return value encode failed: {report}")),
        },
        Ok(Err(message)) => error_reply(&message),
        Err(panic) => error_reply(&panic_message(&panic)),
    }
}

fn tagged_reply(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(1 + body.len());
    reply.push(tag);
    reply.extend_from_slice(body);
    reply
}

fn error_reply(message: &str) -> Vec<u8> {
    match frame::try_encode(&message.to_string()) {
        Ok(body) => tagged_reply(REPLY_TAG_ERROR, &body),
        // A bare error tag decodes parent-side as "undecodable worker error".
        Err(_) => vec![REPLY_TAG_ERROR],
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}

/// Typed handle to a (possibly not-yet-attached) worker pool. Clones share the
/// same pool.
pub struct WorkerPoolHandle<A, R> {
    binding: Rc<Cell<Option<NotifierId>>>,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for WorkerPoolHandle<A, R> {
    fn clone(&self) -> Self {
        Self {
            binding: Rc::clone(&self.binding),
            _types: PhantomData,
        }
    }
}

impl<A, R> std::fmt::Debug for WorkerPoolHandle<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolHandle")
            .field("attached", &self.binding.get())
            .finish()
    }
}

impl<A, R> WorkerPoolHandle<A, R>
where
    A: Serialize,
    R: DeserializeOwned + 'static,
{
    /// Pool notifier id while attached.
    #[must_use]
    pub fn id(&self) -> Option<NotifierId> { self.binding.get() }

    /// Calls the pool function. Arguments are serialized once, up front; an
    /// unencodable value fails here, before any frame is written. The completion
    /// is invoked exactly once, on the reactor thread, with the decoded return
    /// value or the failure kind.
    pub fn call(
        &self,
        reactor: &mut Reactor,
        args: &A,
        completion: impl FnOnce(&mut Reactor, Result<R, WorkerFailure>) -> CallbackResult + 'static,
    ) -> Result<(), RuntimeError> {
        let Some(pool) = self.binding.get() else {
            return Err(RuntimeError::config("worker pool is not attached"));
        };
        let payload = frame::try_encode(args)
            .map_err(|report| RuntimeError::WorkerEncode { report })?;
        let erased: ErasedCompletion = Box::new(move |r, result| {
            let typed = result.and_then(|body| {
                frame::try_decode::<R>(&body).map_err(|report| {
                    WorkerFailure::Error(format!("return value decode failed: {report}"))
                })
            });
            if let Err(report) = completion(r, typed) {
                r.report_error(&RuntimeError::CallbackFailed {
                    role: "worker-completion",
                    report,
                });
            }
        });
        reactor.pool_call(pool, payload, erased)
    }

    /// Graceful stop: workers get end-of-input and wind down; queued calls fail
    /// with [`WorkerFailure::Closed`].
    pub fn stop(&self, reactor: &mut Reactor) -> Result<(), RuntimeError> {
        let Some(pool) = self.binding.get() else {
            return Err(RuntimeError::config("worker pool is not attached"));
        };
        reactor.pool_stop(pool)
    }

    /// Restart after [`stop`](Self::stop): dispatch reopens and the pool respawns
    /// to its minimum.
    pub fn start(&self, reactor: &mut Reactor) -> Result<(), RuntimeError> {
        let Some(pool) = self.binding.get() else {
            return Err(RuntimeError::config("worker pool is not attached"));
        };
        reactor.pool_start(pool)
    }

    /// [`stop`](Self::stop) followed by [`start`](Self::start).
    pub fn restart(&self, reactor: &mut Reactor) -> Result<(), RuntimeError> {
        self.stop(reactor)?;
        self.start(reactor)
    }
}
