// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words ECONNABORTED accepter

//! Accepting listener: a notifier owning a listening socket, handing accepted
//! connections to a callback. The callback typically builds a [`ByteStream`] and
//! attaches it (often as a child of the listener, so the whole set detaches
//! together).
//!
//! [`ByteStream`]: crate::ByteStream

use std::os::fd::{AsRawFd, OwnedFd};

use rustix::net::SocketFlags;

use crate::{notifier::{HandlerContext, IoDirection, IoHandler, Notifier, NotifierId,
                       NotifierKind, io_shim},
            reactor::{CallbackResult, Reactor, RuntimeError, WatchSlots}};

type AcceptCallback = Box<dyn FnMut(&mut Reactor, OwnedFd) -> CallbackResult>;

/// See the [module docs](self).
pub struct Listener {
    fd: OwnedFd,
    on_accept: AcceptCallback,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("fd", &self.fd.as_raw_fd())
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// A detached listener over an already-listening socket. Accepted connections
    /// arrive at the callback as owned, non-blocking, close-on-exec fds.
    pub fn new(
        fd: OwnedFd,
        on_accept: impl FnMut(&mut Reactor, OwnedFd) -> CallbackResult + 'static,
    ) -> Notifier {
        Notifier::new(NotifierKind::Listener(Self {
            fd,
            on_accept: Box::new(on_accept),
        }))
    }

    pub(crate) fn validate(&self, reactor: &Reactor) -> Result<(), RuntimeError> {
        if reactor.interest_mask(self.fd.as_raw_fd()).is_some() {
            return Err(RuntimeError::config(format!(
                "fd {} is already watched",
                self.fd.as_raw_fd()
            )));
        }
        Ok(())
    }

    pub(crate) fn on_attach(
        &mut self,
        reactor: &mut Reactor,
        id: NotifierId,
    ) -> Result<(), RuntimeError> {
        // The accept loop runs until would-block, so the listening socket itself
        // must be non-blocking.
        let flags = rustix::fs::fcntl_getfl(&self.fd)
            .map_err(|errno| RuntimeError::Backend(errno.into()))?;
        rustix::fs::fcntl_setfl(&self.fd, flags | rustix::fs::OFlags::NONBLOCK)
            .map_err(|errno| RuntimeError::Backend(errno.into()))?;
        reactor.watch_internal(
            self.fd.as_raw_fd(),
            WatchSlots {
                read: Some(io_shim(id, IoDirection::Read)),
                hangup: Some(io_shim(id, IoDirection::Hangup)),
                ..WatchSlots::default()
            },
        )
    }

    pub(crate) fn on_detach(&mut self, reactor: &mut Reactor, _id: NotifierId) {
        reactor.forget_fd(self.fd.as_raw_fd());
    }
}

impl IoHandler for Listener {
    fn on_read_ready(&mut self, cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        let reactor = &mut *cx.reactor;
        loop {
            match rustix::net::accept_with(
                &self.fd,
                SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            ) {
                Ok(connection) => {
                    (self.on_accept)(reactor, connection).map_err(|report| {
                        RuntimeError::CallbackFailed {
                            role: "listener",
                            report,
                        }
                    })?;
                }
                Err(rustix::io::Errno::WOULDBLOCK) => return Ok(()),
                Err(rustix::io::Errno::INTR) => continue,
                // The connection died between arrival and accept; keep going.
                Err(rustix::io::Errno::CONNABORTED) => continue,
                Err(errno) => {
                    return Err(RuntimeError::FatalIo {
                        fd: self.fd.as_raw_fd(),
                        source: errno.into(),
                    });
                }
            }
        }
    }

    fn on_hangup(&mut self, _cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        Err(RuntimeError::FatalIo {
            fd: self.fd.as_raw_fd(),
            source: std::io::Error::other("listening socket hangup"),
        })
    }
}
