// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words EPIPE fcntl socketpair

//! Buffered bidirectional bytestream over an arbitrary read/write fd pair.
//!
//! # Read path
//!
//! On read readiness the stream loops 8 KiB scratch reads into the input buffer
//! until would-block or EOF, running the [consumer protocol] after every append.
//! At EOF the consumer runs one final round with `eof = true`; bytes it leaves
//! behind are discarded and the close is reported as [`CloseReason::Truncated`].
//!
//! # Write path
//!
//! [`Reactor::stream_write`] appends to the outgoing buffer and flags write
//! interest; write interest is declared exactly while the outgoing buffer is
//! non-empty, a flush or deferred close is pending, or a non-blocking connect is
//! being probed. On readiness the whole buffer is offered to the kernel; partial
//! writes drop the written prefix and stay interested. Draining the buffer fires
//! queued flush callbacks in FIFO order.
//!
//! # Close discipline
//!
//! [`Reactor::stream_close_when_drained`] is idempotent: once the outgoing buffer
//! empties, the write descriptor is closed exactly once (a socket shared between
//! both directions gets `shutdown(Write)` so the peer sees EOF). When no open read
//! side remains, the stream fires its closed callback (also exactly once) and
//! detaches itself.
//!
//! Transient I/O errors (would-block, interrupted) are retried; anything else
//! closes the stream through the closed callback and detaches it.
//!
//! [consumer protocol]: crate::stream::consumer

use std::{collections::VecDeque,
          os::fd::{AsRawFd, OwnedFd}};

use super::{ConsumeOutcome, StreamConsumer, StreamContext};
use crate::{notifier::{HandlerContext, IoDirection, IoHandler, Notifier, NotifierId,
                       NotifierKind, io_shim},
            reactor::{CallbackResult, InterestMask, Reactor, RuntimeError, WatchSlots}};

/// Scratch-read chunk size for the read loop.
pub const READ_CHUNK_SIZE: usize = 8192;

/// Why a stream closed; handed to the closed callback exactly once.
#[derive(Debug, strum_macros::Display)]
pub enum CloseReason {
    /// Clean end-of-file with nothing left in the input buffer.
    Eof,
    /// End-of-file with unconsumed bytes, which were discarded.
    Truncated,
    /// The peer hung up and no hangup callback was registered.
    Hangup,
    /// A locally requested close-when-drained completed.
    LocalClose,
    /// A fatal I/O error.
    Io(std::io::Error),
}

type ClosedCallback = Box<dyn FnOnce(&mut Reactor, CloseReason) -> CallbackResult>;
type FlushCallback = Box<dyn FnOnce(&mut Reactor) -> CallbackResult>;
type HangupCallback = Box<dyn FnMut(&mut Reactor) -> CallbackResult>;

/// See the [module docs](self). Built with [`ByteStream::builder`], attached via
/// [`Reactor::attach`], and driven through [`Reactor::stream_write`] /
/// [`Reactor::stream_close_when_drained`] or a consumer's [`StreamContext`].
///
/// [`Reactor::attach`]: crate::Reactor::attach
pub struct ByteStream {
    read_fd: Option<OwnedFd>,
    write_fd: Option<OwnedFd>,
    /// Both fds are dups of one socket; half-close uses `shutdown(Write)`.
    shared_socket: bool,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    /// Consumer stack; index 0 is the base, the top is active (delegation).
    consumers: Vec<Box<dyn StreamConsumer>>,
    flush_queue: VecDeque<FlushCallback>,
    on_hangup_cb: Option<HangupCallback>,
    on_closed: Option<ClosedCallback>,
    close_when_drained: bool,
    probing_connect: bool,
    /// Mirror of the write slot registered in the watcher table.
    write_interested: bool,
    closed_fired: bool,
    /// Close reason parked while the outgoing buffer still drains after read EOF.
    pending_close_reason: Option<CloseReason>,
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("read_fd", &self.read_fd.as_ref().map(AsRawFd::as_raw_fd))
            .field("write_fd", &self.write_fd.as_ref().map(AsRawFd::as_raw_fd))
            .field("buffered_in", &self.in_buf.len())
            .field("buffered_out", &self.out_buf.len())
            .field("close_when_drained", &self.close_when_drained)
            .finish_non_exhaustive()
    }
}

impl ByteStream {
    #[must_use]
    pub fn builder() -> ByteStreamBuilder { ByteStreamBuilder::default() }

    // ── Validation & lifecycle hooks ────────────────────────────────────────

    pub(crate) fn validate(&self, reactor: &Reactor) -> Result<(), RuntimeError> {
        if self.read_fd.is_none() && self.write_fd.is_none() {
            return Err(RuntimeError::config("bytestream needs at least one fd"));
        }
        if self.read_fd.is_some() && self.consumers.is_empty() {
            return Err(RuntimeError::config(
                "bytestream with a read fd needs a consumer",
            ));
        }
        for fd in [&self.read_fd, &self.write_fd].into_iter().flatten() {
            if reactor.interest_mask(fd.as_raw_fd()).is_some() {
                return Err(RuntimeError::config(format!(
                    "fd {} is already watched",
                    fd.as_raw_fd()
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn on_attach(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
    ) -> Result<(), RuntimeError> {
        if let Some(fd) = self.read_fd.as_ref() {
            reactor.watch_internal(
                fd.as_raw_fd(),
                WatchSlots {
                    read: Some(io_shim(id, IoDirection::Read)),
                    hangup: Some(io_shim(id, IoDirection::Hangup)),
                    ..WatchSlots::default()
                },
            )?;
        } else if let Some(fd) = self.write_fd.as_ref() {
            // Write-only stream: hangup is observed on the write fd.
            reactor.watch_internal(
                fd.as_raw_fd(),
                WatchSlots {
                    hangup: Some(io_shim(id, IoDirection::Hangup)),
                    ..WatchSlots::default()
                },
            )?;
        }
        self.write_interested = false;
        self.sync_write_interest(reactor, id)
    }

    pub(crate) fn on_detach(&mut self, reactor: &mut Reactor, _id: NotifierId) {
        for fd in [&self.read_fd, &self.write_fd].into_iter().flatten() {
            reactor.forget_fd(fd.as_raw_fd());
        }
        self.write_interested = false;
    }

    // ── Operations (reached through Reactor / StreamContext) ────────────────

    fn write(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
        bytes: &[u8],
        flush: Option<FlushCallback>,
    ) -> Result<(), RuntimeError> {
        if self.closed_fired || self.close_when_drained || self.write_fd.is_none() {
            return Err(RuntimeError::config("stream is closed for writing"));
        }
        self.out_buf.extend_from_slice(bytes);
        if let Some(flush) = flush {
            self.flush_queue.push_back(flush);
        }
        self.sync_write_interest(reactor, id)
    }

    fn request_close_when_drained(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
    ) -> Result<(), RuntimeError> {
        if self.close_when_drained {
            // Idempotent by definition.
            return Ok(());
        }
        self.close_when_drained = true;
        if self.out_buf.is_empty() {
            self.complete_deferred_close(reactor, id)
        } else {
            self.sync_write_interest(reactor, id)
        }
    }

    // ── Internals ───────────────────────────────────────────────────────────

    /// Write interest is a pure function of stream state; this pushes it to the
    /// watcher table whenever it changes.
    fn sync_write_interest(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
    ) -> Result<(), RuntimeError> {
        let want = self.write_fd.is_some()
            && !self.closed_fired
            && (!self.out_buf.is_empty()
                || self.close_when_drained
                || self.probing_connect
                || !self.flush_queue.is_empty());
        if want == self.write_interested {
            return Ok(());
        }
        let Some(fd) = self.write_fd.as_ref().map(AsRawFd::as_raw_fd) else {
            self.write_interested = false;
            return Ok(());
        };
        if want {
            reactor.watch_internal(
                fd,
                WatchSlots {
                    write: Some(io_shim(id, IoDirection::Write)),
                    ..WatchSlots::default()
                },
            )?;
        } else {
            reactor.unwatch_io(
                fd,
                InterestMask {
                    write: true,
                    ..InterestMask::default()
                },
            );
        }
        self.write_interested = want;
        Ok(())
    }

    /// Runs the consumer stack until it pauses. Returns consumer failures as
    /// reactor-level errors (which close the stream via the dispatch policy).
    fn run_consumers(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
        eof: bool,
    ) -> Result<(), RuntimeError> {
        let mut consumers = std::mem::take(&mut self.consumers);
        let mut wrote = false;
        let mut close_requested = false;

        let result = loop {
            let Some(active) = consumers.last_mut() else {
                break Ok(());
            };
            let mut cx = StreamContext {
                reactor,
                stream: id,
                in_buf: &mut self.in_buf,
                out_buf: &mut self.out_buf,
                wrote: &mut wrote,
                close_requested: &mut close_requested,
            };
            match active.consume(&mut cx, eof) {
                Ok(ConsumeOutcome::Again) => continue,
                Ok(ConsumeOutcome::NeedMore) => break Ok(()),
                Ok(ConsumeOutcome::Delegate(next)) => {
                    consumers.push(next);
                    continue;
                }
                Ok(ConsumeOutcome::Revert) => {
                    if consumers.len() > 1 {
                        consumers.pop();
                        continue;
                    }
                    // The base consumer has nothing to revert to.
                    break Ok(());
                }
                Err(report) => {
                    break Err(RuntimeError::CallbackFailed {
                        role: "stream-consumer",
                        report,
                    });
                }
            }
        };

        self.consumers = consumers;
        if close_requested {
            self.request_close_when_drained(reactor, id)?;
        } else if wrote {
            self.sync_write_interest(reactor, id)?;
        }
        result
    }

    /// Closes the write side once the outgoing buffer is gone; full close follows
    /// when no read side remains open.
    fn complete_deferred_close(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
    ) -> Result<(), RuntimeError> {
        if let Some(fd) = self.write_fd.take() {
            reactor.forget_fd(fd.as_raw_fd());
            self.write_interested = false;
            if self.shared_socket {
                // Both directions share one socket: half-close so the peer sees
                // EOF while our read side keeps draining.
                if let Err(errno) = rustix::net::shutdown(&fd, rustix::net::Shutdown::Write) {
                    tracing::debug!(fd = fd.as_raw_fd(), %errno, "shutdown(Write) failed");
                }
            }
        }
        if self.read_fd.is_none() {
            let reason = self
                .pending_close_reason
                .take()
                .unwrap_or(CloseReason::LocalClose);
            self.shut_down(reactor, id, reason)?;
        }
        Ok(())
    }

    /// Full close: closed callback exactly once, fds dropped, detached.
    fn shut_down(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
        reason: CloseReason,
    ) -> Result<(), RuntimeError> {
        if self.closed_fired {
            return Ok(());
        }
        self.closed_fired = true;
        for fd in [self.read_fd.take(), self.write_fd.take()].into_iter().flatten() {
            reactor.forget_fd(fd.as_raw_fd());
        }
        self.write_interested = false;
        self.out_buf.clear();
        tracing::debug!(?id, %reason, "stream closed");
        if let Some(closed) = self.on_closed.take() {
            if let Err(report) = closed(reactor, reason) {
                reactor.report_error(&RuntimeError::CallbackFailed {
                    role: "stream-closed",
                    report,
                });
            }
        }
        reactor.request_detach(id);
        Ok(())
    }

    /// Handles read EOF: final consumer round, truncation accounting, read-side
    /// close, and either full close or drain-then-close.
    fn handle_eof(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
    ) -> Result<(), RuntimeError> {
        self.run_consumers(reactor, id, true)?;
        let reason = if self.in_buf.is_empty() {
            CloseReason::Eof
        } else {
            tracing::warn!(
                ?id,
                discarded = self.in_buf.len(),
                "stream truncated: unconsumed bytes at EOF"
            );
            self.in_buf.clear();
            CloseReason::Truncated
        };
        if let Some(fd) = self.read_fd.take() {
            reactor.forget_fd(fd.as_raw_fd());
        }
        if self.out_buf.is_empty() || self.write_fd.is_none() {
            self.shut_down(reactor, id, reason)
        } else {
            // Finish the outgoing buffer, then close.
            self.pending_close_reason = Some(reason);
            self.close_when_drained = true;
            self.sync_write_interest(reactor, id)
        }
    }
}

impl IoHandler for ByteStream {
    fn on_read_ready(&mut self, cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        let id = cx.id;
        let reactor = &mut *cx.reactor;
        let mut scratch = [0u8; READ_CHUNK_SIZE];
        loop {
            let Some(fd) = self.read_fd.as_ref() else {
                return Ok(());
            };
            match rustix::io::read(fd, &mut scratch) {
                Ok(0) => return self.handle_eof(reactor, id),
                Ok(count) => {
                    self.in_buf.extend_from_slice(&scratch[..count]);
                    self.run_consumers(reactor, id, false)?;
                }
                Err(rustix::io::Errno::WOULDBLOCK) => return Ok(()),
                Err(rustix::io::Errno::INTR) => continue,
                Err(errno) => {
                    let fd = fd.as_raw_fd();
                    tracing::debug!(fd, %errno, "fatal read error");
                    reactor.report_error(&RuntimeError::FatalIo {
                        fd,
                        source: errno.into(),
                    });
                    return self.shut_down(reactor, id, CloseReason::Io(errno.into()));
                }
            }
        }
    }

    fn on_write_ready(&mut self, cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        let id = cx.id;
        let reactor = &mut *cx.reactor;
        if self.probing_connect {
            // First writability after a non-blocking connect settles the probe; a
            // failed connect surfaces on the next write or as a hangup.
            self.probing_connect = false;
        }
        while !self.out_buf.is_empty() {
            let Some(fd) = self.write_fd.as_ref() else { break };
            match rustix::io::write(fd, &self.out_buf) {
                Ok(count) => {
                    self.out_buf.drain(..count);
                }
                Err(rustix::io::Errno::WOULDBLOCK) => break,
                Err(rustix::io::Errno::INTR) => continue,
                Err(errno) => {
                    let fd = fd.as_raw_fd();
                    tracing::debug!(fd, %errno, "fatal write error");
                    reactor.report_error(&RuntimeError::FatalIo {
                        fd,
                        source: errno.into(),
                    });
                    return self.shut_down(reactor, id, CloseReason::Io(errno.into()));
                }
            }
        }
        if self.out_buf.is_empty() {
            for flush in std::mem::take(&mut self.flush_queue) {
                if let Err(report) = flush(reactor) {
                    reactor.report_error(&RuntimeError::CallbackFailed {
                        role: "stream-flush",
                        report,
                    });
                }
            }
            if self.close_when_drained && self.write_fd.is_some() {
                return self.complete_deferred_close(reactor, id);
            }
        }
        self.sync_write_interest(reactor, id)
    }

    fn on_hangup(&mut self, cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        let id = cx.id;
        let reactor = &mut *cx.reactor;
        if let Some(cb) = self.on_hangup_cb.as_mut() {
            return cb(reactor).map_err(|report| RuntimeError::CallbackFailed {
                role: "stream-hangup",
                report,
            });
        }
        // No hangup callback: route to the close path.
        self.shut_down(reactor, id, CloseReason::Hangup)
    }
}

impl Reactor {
    /// Appends bytes to a stream's outgoing buffer and flags write interest.
    pub fn stream_write(&mut self, id: NotifierId, bytes: &[u8]) -> Result<(), RuntimeError> {
        self.with_stream(id, |reactor, stream| stream.write(reactor, id, bytes, None))
    }

    /// Like [`stream_write`](Self::stream_write), with a callback invoked (FIFO
    /// with other flush callbacks) when the outgoing buffer next drains.
    pub fn stream_write_with_flush(
        &mut self,
        id: NotifierId,
        bytes: &[u8],
        flush: impl FnOnce(&mut Reactor) -> CallbackResult + 'static,
    ) -> Result<(), RuntimeError> {
        self.with_stream(id, |reactor, stream| {
            stream.write(reactor, id, bytes, Some(Box::new(flush)))
        })
    }

    /// Requests the graceful close: once the outgoing buffer drains, the write
    /// descriptor closes (exactly once); the closed callback fires when no open
    /// side remains. Idempotent.
    pub fn stream_close_when_drained(&mut self, id: NotifierId) -> Result<(), RuntimeError> {
        self.with_stream(id, |reactor, stream| {
            stream.request_close_when_drained(reactor, id)
        })
    }

    /// Bytes currently queued on the stream's outgoing buffer.
    #[must_use]
    pub fn stream_pending_out(&self, id: NotifierId) -> Option<usize> {
        self.notifiers.get(id).and_then(|entry| match &entry.kind {
            NotifierKind::Stream(stream) => Some(stream.out_buf.len()),
            _ => None,
        })
    }

    fn with_stream<T>(
        &mut self,
        id: NotifierId,
        f: impl FnOnce(&mut Reactor, &mut ByteStream) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        self.with_entry(id, |reactor, entry| match &mut entry.kind {
            NotifierKind::Stream(stream) => f(reactor, stream),
            _ => Err(RuntimeError::config("notifier is not a bytestream")),
        })
        .unwrap_or_else(|| {
            Err(RuntimeError::config(
                "unknown stream, or stream is mid-dispatch (use the consumer context)",
            ))
        })
    }
}

/// Builder for [`ByteStream`], in the crate's usual chaining style. All fds are
/// owned by the stream and switched to non-blocking at build time.
#[derive(Default)]
pub struct ByteStreamBuilder {
    read_fd: Option<OwnedFd>,
    write_fd: Option<OwnedFd>,
    shared_socket: bool,
    consumer: Option<Box<dyn StreamConsumer>>,
    on_closed: Option<ClosedCallback>,
    on_hangup: Option<HangupCallback>,
    probe_connect: bool,
}

impl std::fmt::Debug for ByteStreamBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStreamBuilder")
            .field("read_fd", &self.read_fd.as_ref().map(AsRawFd::as_raw_fd))
            .field("write_fd", &self.write_fd.as_ref().map(AsRawFd::as_raw_fd))
            .finish_non_exhaustive()
    }
}

impl ByteStreamBuilder {
    /// Descriptor to read from (taking ownership).
    #[must_use]
    pub fn read_fd(mut self, fd: OwnedFd) -> Self {
        self.read_fd = Some(fd);
        self
    }

    /// Descriptor to write to (taking ownership).
    #[must_use]
    pub fn write_fd(mut self, fd: OwnedFd) -> Self {
        self.write_fd = Some(fd);
        self
    }

    /// One connected socket used for both directions. The fd is duplicated so the
    /// two sides close independently; the write side half-closes with
    /// `shutdown(Write)`.
    #[must_use]
    pub fn socket(mut self, fd: OwnedFd) -> Self {
        match fd.try_clone() {
            Ok(write_dup) => {
                self.read_fd = Some(fd);
                self.write_fd = Some(write_dup);
                self.shared_socket = true;
            }
            Err(err) => {
                // Surface at build(): a builder setter has nowhere to fail to.
                tracing::warn!(%err, "socket dup failed");
                self.read_fd = Some(fd);
                self.write_fd = None;
                self.shared_socket = true;
            }
        }
        self
    }

    /// Base consumer for the read side. Required when the stream can read.
    #[must_use]
    pub fn consumer(mut self, consumer: impl StreamConsumer + 'static) -> Self {
        self.consumer = Some(Box::new(consumer));
        self
    }

    /// Invoked exactly once when the stream fully closes.
    #[must_use]
    pub fn on_closed(
        mut self,
        cb: impl FnOnce(&mut Reactor, CloseReason) -> CallbackResult + 'static,
    ) -> Self {
        self.on_closed = Some(Box::new(cb));
        self
    }

    /// Overrides the default hangup handling (which closes the stream).
    #[must_use]
    pub fn on_hangup(mut self, cb: impl FnMut(&mut Reactor) -> CallbackResult + 'static) -> Self {
        self.on_hangup = Some(Box::new(cb));
        self
    }

    /// The write fd is a socket with a non-blocking connect in flight: hold write
    /// interest until the first writability settles it.
    #[must_use]
    pub fn probe_connect(mut self, probe: bool) -> Self {
        self.probe_connect = probe;
        self
    }

    /// Builds the detached stream notifier.
    pub fn build(self) -> Result<Notifier, RuntimeError> {
        if self.read_fd.is_none() && self.write_fd.is_none() {
            return Err(RuntimeError::config("bytestream needs at least one fd"));
        }
        if self.shared_socket && self.write_fd.is_none() {
            return Err(RuntimeError::config("socket fd could not be duplicated"));
        }
        if self.read_fd.is_some() && self.consumer.is_none() {
            return Err(RuntimeError::config(
                "bytestream with a read fd needs a consumer",
            ));
        }
        for fd in [&self.read_fd, &self.write_fd].into_iter().flatten() {
            set_nonblocking(fd)?;
        }
        Ok(Notifier::new(NotifierKind::Stream(ByteStream {
            read_fd: self.read_fd,
            write_fd: self.write_fd,
            shared_socket: self.shared_socket,
            in_buf: Vec::new(),
            out_buf: Vec::new(),
            consumers: self.consumer.into_iter().collect(),
            flush_queue: VecDeque::new(),
            on_hangup_cb: self.on_hangup,
            on_closed: self.on_closed,
            close_when_drained: false,
            probing_connect: self.probe_connect,
            write_interested: false,
            closed_fired: false,
            pending_close_reason: None,
        })))
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), RuntimeError> {
    let flags = rustix::fs::fcntl_getfl(fd).map_err(|errno| RuntimeError::Backend(errno.into()))?;
    rustix::fs::fcntl_setfl(fd, flags | rustix::fs::OFlags::NONBLOCK)
        .map_err(|errno| RuntimeError::Backend(errno.into()))
}
