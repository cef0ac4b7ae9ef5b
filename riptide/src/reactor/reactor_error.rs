// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words sigprocmask

//! Error taxonomy for the reactor and everything it drives.
//!
//! Every fallible operation in this crate returns exactly one of these shapes:
//!
//! | Kind | Flow |
//! | :--- | :--- |
//! | Configuration / state errors | Returned to the caller; nothing is mutated |
//! | Transient I/O (would-block, interrupted) | Swallowed and retried internally |
//! | Fatal I/O on a watched fd | Handle closed, closed callback fired, handler detached |
//! | User-callback failure | Routed to the reactor [error sink]; offending handler detached |
//! | Worker failure | Delivered through the call completion as [`WorkerFailure`] |
//! | Signal dispatch failure | Reported per signal; the blocked mask is restored regardless |
//!
//! The reactor loop itself only aborts on [`RuntimeError::SignalMask`] (a failed
//! `sigprocmask` leaves signal delivery in an unknown state); every other error is
//! survivable.
//!
//! [error sink]: crate::Reactor::set_error_sink
//! [`WorkerFailure`]: crate::WorkerFailure

use std::os::fd::RawFd;

/// Result type for user-supplied callbacks. Returning `Err` routes the report to the
/// reactor's error sink and detaches the handler that raised it; the loop keeps
/// running.
pub type CallbackResult = miette::Result<()>;

/// Errors surfaced by reactor operations and through the reactor error sink.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RuntimeError {
    /// Invalid parameters or a structural misuse detected before any mutation.
    #[error("invalid configuration: {message}")]
    #[diagnostic(code(riptide::config))]
    Config {
        /// What was wrong with the request.
        message: String,
    },

    /// A syscall on a watched fd failed with something other than would-block or
    /// interrupted.
    #[error("fatal I/O on fd {fd}")]
    #[diagnostic(
        code(riptide::io),
        help("the handle has been closed and its handler detached")
    )]
    FatalIo {
        /// The descriptor the operation failed on.
        fd: RawFd,
        #[source]
        source: std::io::Error,
    },

    /// The poll backend itself failed (registration, deregistration, or wait).
    #[error("poll backend failure")]
    #[diagnostic(code(riptide::backend))]
    Backend(#[source] std::io::Error),

    /// A user callback returned an error. The inner [`miette::Report`] preserves the
    /// full chain from the callback.
    #[error("callback failed in {role} handler")]
    #[diagnostic(code(riptide::callback))]
    CallbackFailed {
        /// Role of the notifier (or `"io"` / `"timer"` / `"deferred"` for raw
        /// callbacks) whose callback raised.
        role: &'static str,
        report: miette::Report,
    },

    /// A per-signal callback raised while draining the signal queue. Remaining queued
    /// signals were still dispatched.
    #[error("signal dispatch failure for signal {signal}")]
    #[diagnostic(code(riptide::signal::dispatch))]
    SignalDispatch {
        signal: i32,
        report: miette::Report,
    },

    /// `sigprocmask` failed. Fatal: the reactor cannot guarantee signal-safe
    /// dispatch any longer, so the loop aborts with this error.
    #[error("sigprocmask failed")]
    #[diagnostic(
        code(riptide::signal::mask),
        help("signal delivery state is unknown; the reactor loop has aborted")
    )]
    SignalMask(#[source] std::io::Error),

    /// Forking a worker subprocess failed.
    #[error("failed to fork worker subprocess")]
    #[diagnostic(code(riptide::worker::fork))]
    WorkerFork(#[source] std::io::Error),

    /// Encoding a worker-call argument value failed. Reported before any frame is
    /// written, so the worker channel is untouched.
    #[error("failed to encode worker-call arguments")]
    #[diagnostic(code(riptide::worker::encode))]
    WorkerEncode {
        report: miette::Report,
    },
}

impl RuntimeError {
    /// Convenience constructor for configuration errors.
    pub fn config(message: impl Into<String>) -> Self {
        RuntimeError::Config {
            message: message.into(),
        }
    }

    /// Only [`RuntimeError::SignalMask`] aborts the dispatch loop.
    #[must_use]
    pub fn is_fatal(&self) -> bool { matches!(self, RuntimeError::SignalMask(_)) }
}
