// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Plain notifier: watches an fd pair it does not own, routing readiness to user
//! callbacks. The building block for handlers that manage their own I/O.

use std::os::fd::RawFd;

use super::{HandlerContext, IoDirection, IoHandler, Notifier, NotifierId, NotifierKind,
            io_shim};
use crate::reactor::{CallbackResult, InterestMask, Reactor, RuntimeError, WatchSlots};

type PlainCallback = Box<dyn FnMut(&mut Reactor) -> CallbackResult>;

/// See the [module docs](self). Built with [`PlainNotifier::builder`].
pub struct PlainNotifier {
    read_fd: Option<RawFd>,
    write_fd: Option<RawFd>,
    want_write: bool,
    on_read: Option<PlainCallback>,
    on_write: Option<PlainCallback>,
    on_hangup: Option<PlainCallback>,
}

impl std::fmt::Debug for PlainNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainNotifier")
            .field("read_fd", &self.read_fd)
            .field("write_fd", &self.write_fd)
            .field("want_write", &self.want_write)
            .finish_non_exhaustive()
    }
}

impl PlainNotifier {
    #[must_use]
    pub fn builder() -> PlainNotifierBuilder { PlainNotifierBuilder::default() }

    pub(crate) fn validate(&self, reactor: &Reactor) -> Result<(), RuntimeError> {
        if self.read_fd.is_none() && self.write_fd.is_none() {
            return Err(RuntimeError::config("plain notifier needs at least one fd"));
        }
        if self.on_read.is_some() && self.read_fd.is_none() {
            return Err(RuntimeError::config("read callback without a read fd"));
        }
        if (self.on_write.is_some() || self.want_write) && self.write_fd.is_none() {
            return Err(RuntimeError::config(
                "write-ready interest without a write fd",
            ));
        }
        if self.on_read.is_none() && self.on_write.is_none() && self.on_hangup.is_none() {
            return Err(RuntimeError::config("plain notifier needs a callback"));
        }
        for fd in [self.read_fd, self.write_fd].into_iter().flatten() {
            if reactor.interest_mask(fd).is_some() {
                return Err(RuntimeError::config(format!("fd {fd} is already watched")));
            }
        }
        Ok(())
    }

    pub(crate) fn on_attach(&mut self, reactor: &mut Reactor, id: NotifierId) -> Result<(), RuntimeError> {
        if let Some(fd) = self.read_fd {
            let slots = WatchSlots {
                read: self.on_read.as_ref().map(|_| io_shim(id, IoDirection::Read)),
                hangup: self.on_hangup.as_ref().map(|_| io_shim(id, IoDirection::Hangup)),
                ..WatchSlots::default()
            };
            if slots.read.is_some() || slots.hangup.is_some() {
                reactor.watch_internal(fd, slots)?;
            }
        }
        if let Some(fd) = self.write_fd {
            let hangup_here = self.on_hangup.is_some() && self.read_fd.is_none();
            if self.want_write || hangup_here {
                reactor.watch_internal(
                    fd,
                    WatchSlots {
                        write: if self.want_write {
                            Some(io_shim(id, IoDirection::Write))
                        } else {
                            None
                        },
                        hangup: if hangup_here {
                            Some(io_shim(id, IoDirection::Hangup))
                        } else {
                            None
                        },
                        ..WatchSlots::default()
                    },
                )?;
            }
        }
        Ok(())
    }

    pub(crate) fn on_detach(&mut self, reactor: &mut Reactor, _id: NotifierId) {
        for fd in [self.read_fd, self.write_fd].into_iter().flatten() {
            reactor.forget_fd(fd);
        }
    }

    fn sync_want_write(&mut self, reactor: &mut Reactor, id: NotifierId) -> Result<(), RuntimeError> {
        let Some(fd) = self.write_fd else {
            return Err(RuntimeError::config(
                "write-ready interest without a write fd",
            ));
        };
        if self.want_write {
            reactor.watch_internal(
                fd,
                WatchSlots {
                    write: Some(io_shim(id, IoDirection::Write)),
                    ..WatchSlots::default()
                },
            )
        } else {
            reactor.unwatch_io(
                fd,
                InterestMask {
                    write: true,
                    ..InterestMask::default()
                },
            );
            Ok(())
        }
    }
}

impl IoHandler for PlainNotifier {
    fn on_read_ready(&mut self, cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        if let Some(cb) = self.on_read.as_mut() {
            cb(cx.reactor).map_err(|report| RuntimeError::CallbackFailed {
                role: "plain",
                report,
            })?;
        }
        Ok(())
    }

    fn on_write_ready(&mut self, cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        if let Some(cb) = self.on_write.as_mut() {
            cb(cx.reactor).map_err(|report| RuntimeError::CallbackFailed {
                role: "plain",
                report,
            })?;
        }
        Ok(())
    }

    fn on_hangup(&mut self, cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        if let Some(cb) = self.on_hangup.as_mut() {
            cb(cx.reactor).map_err(|report| RuntimeError::CallbackFailed {
                role: "plain",
                report,
            })?;
        }
        Ok(())
    }
}

impl Reactor {
    /// Declares (or withdraws) write-ready interest for a plain notifier. The
    /// change propagates to the backend immediately, except from within the
    /// notifier's own dispatch, where it is deferred to the end of the iteration.
    pub fn set_want_write(&mut self, id: NotifierId, want: bool) -> Result<(), RuntimeError> {
        let outcome = self.with_entry(id, |reactor, entry| match &mut entry.kind {
            NotifierKind::Plain(plain) => {
                plain.want_write = want;
                plain.sync_want_write(reactor, id)
            }
            _ => Err(RuntimeError::config("notifier is not a plain notifier")),
        });
        match outcome {
            Some(result) => result,
            None if self.notifiers.is_in_flight(id) => {
                self.defer(move |r| {
                    r.set_want_write(id, want).map_err(miette::Report::new)
                });
                Ok(())
            }
            None => Err(RuntimeError::config("unknown notifier")),
        }
    }
}

/// Builder for [`PlainNotifier`]. All fds are watched, never owned; the caller
/// keeps them open for the lifetime of the attachment.
#[derive(Default)]
pub struct PlainNotifierBuilder {
    read_fd: Option<RawFd>,
    write_fd: Option<RawFd>,
    want_write: bool,
    on_read: Option<PlainCallback>,
    on_write: Option<PlainCallback>,
    on_hangup: Option<PlainCallback>,
}

impl std::fmt::Debug for PlainNotifierBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainNotifierBuilder").finish_non_exhaustive()
    }
}

impl PlainNotifierBuilder {
    #[must_use]
    pub fn read_fd(mut self, fd: RawFd) -> Self {
        self.read_fd = Some(fd);
        self
    }

    #[must_use]
    pub fn write_fd(mut self, fd: RawFd) -> Self {
        self.write_fd = Some(fd);
        self
    }

    /// Declares write interest from the start.
    #[must_use]
    pub fn want_write(mut self, want: bool) -> Self {
        self.want_write = want;
        self
    }

    #[must_use]
    pub fn on_read(mut self, cb: impl FnMut(&mut Reactor) -> CallbackResult + 'static) -> Self {
        self.on_read = Some(Box::new(cb));
        self
    }

    #[must_use]
    pub fn on_write(mut self, cb: impl FnMut(&mut Reactor) -> CallbackResult + 'static) -> Self {
        self.on_write = Some(Box::new(cb));
        self
    }

    #[must_use]
    pub fn on_hangup(mut self, cb: impl FnMut(&mut Reactor) -> CallbackResult + 'static) -> Self {
        self.on_hangup = Some(Box::new(cb));
        self
    }

    /// Builds the detached notifier. Structural validation happens at attach time,
    /// against the reactor's current watches.
    #[must_use]
    pub fn build(self) -> Notifier {
        Notifier::new(NotifierKind::Plain(PlainNotifier {
            read_fd: self.read_fd,
            write_fd: self.write_fd,
            want_write: self.want_write,
            on_read: self.on_read,
            on_write: self.on_write,
            on_hangup: self.on_hangup,
        }))
    }
}
