// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The incremental consumer protocol for [`ByteStream`].
//!
//! A consumer is called with the stream's growing input buffer and drains what it
//! understands. The outcome steers the read loop:
//!
//! | Outcome | Meaning |
//! | :--- | :--- |
//! | [`Again`] | A complete unit was consumed; call the consumer again right away |
//! | [`NeedMore`] | The buffer holds no complete unit; wait for more bytes |
//! | [`Delegate`] | Transfer control: the given consumer becomes active |
//! | [`Revert`] | A delegated consumer is done; the previous one resumes |
//!
//! Delegation is how per-request response parsers are layered: a base protocol
//! consumer sees a request, delegates to a response parser, and resumes when that
//! parser reverts. Consumers form a stack; `Revert` from the base consumer is
//! treated as [`NeedMore`].
//!
//! [`Again`]: ConsumeOutcome::Again
//! [`NeedMore`]: ConsumeOutcome::NeedMore
//! [`Delegate`]: ConsumeOutcome::Delegate
//! [`Revert`]: ConsumeOutcome::Revert
//! [`ByteStream`]: crate::ByteStream

use crate::{notifier::NotifierId, reactor::Reactor};

/// What a [`StreamConsumer`] did with the buffer. See the [module docs](self).
pub enum ConsumeOutcome {
    Again,
    NeedMore,
    Delegate(Box<dyn StreamConsumer>),
    Revert,
}

impl std::fmt::Debug for ConsumeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConsumeOutcome::Again => "Again",
            ConsumeOutcome::NeedMore => "NeedMore",
            ConsumeOutcome::Delegate(_) => "Delegate",
            ConsumeOutcome::Revert => "Revert",
        };
        f.write_str(name)
    }
}

/// Incremental parser over a stream's input buffer. Closures of the right shape
/// implement this directly.
pub trait StreamConsumer {
    /// `eof` is true exactly once, after the read side reaches end-of-file; bytes
    /// left unconsumed at that point are discarded (and reported as truncation).
    fn consume(
        &mut self,
        cx: &mut StreamContext<'_>,
        eof: bool,
    ) -> miette::Result<ConsumeOutcome>;
}

impl<F> StreamConsumer for F
where
    F: FnMut(&mut StreamContext<'_>, bool) -> miette::Result<ConsumeOutcome>,
{
    fn consume(
        &mut self,
        cx: &mut StreamContext<'_>,
        eof: bool,
    ) -> miette::Result<ConsumeOutcome> {
        self(cx, eof)
    }
}

/// What a consumer sees while running: the input buffer to drain, the owning
/// stream's outgoing side, and the reactor (for timers, writes to other streams,
/// or detaching). The stream itself is mid-dispatch, so operations on it go
/// through this context rather than through [`Reactor`] stream methods.
pub struct StreamContext<'a> {
    pub(crate) reactor: &'a mut Reactor,
    pub(crate) stream: NotifierId,
    pub(crate) in_buf: &'a mut Vec<u8>,
    pub(crate) out_buf: &'a mut Vec<u8>,
    pub(crate) wrote: &'a mut bool,
    pub(crate) close_requested: &'a mut bool,
}

impl std::fmt::Debug for StreamContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamContext")
            .field("stream", &self.stream)
            .field("buffered", &self.in_buf.len())
            .finish_non_exhaustive()
    }
}

impl StreamContext<'_> {
    /// The input buffer. Drain consumed bytes from the front.
    pub fn buffer(&mut self) -> &mut Vec<u8> { self.in_buf }

    /// Queues bytes on this stream's outgoing buffer; write interest is flagged
    /// when the consumer returns.
    pub fn write(&mut self, bytes: &[u8]) {
        self.out_buf.extend_from_slice(bytes);
        *self.wrote = true;
    }

    /// Requests the graceful close-when-drained discipline on this stream.
    pub fn close_when_drained(&mut self) { *self.close_requested = true; }

    /// The reactor, for anything beyond this stream.
    pub fn reactor(&mut self) -> &mut Reactor { self.reactor }

    /// Id of the stream being consumed.
    #[must_use]
    pub fn stream_id(&self) -> NotifierId { self.stream }
}
