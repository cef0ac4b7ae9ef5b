// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Signal notifier: holds a watch on one POSIX signal while attached.
//!
//! A thin composition wrapper over [`Reactor::watch_signal`]: attaching installs
//! the watch (through the process-wide signal proxy), detaching restores the saved
//! disposition. Useful when a signal watch should live and die with a subtree of
//! handlers rather than be managed by hand.
//!
//! [`Reactor::watch_signal`]: crate::Reactor::watch_signal

use std::{cell::RefCell, rc::Rc};

use super::{Notifier, NotifierId, NotifierKind};
use crate::reactor::{CallbackResult, Reactor, RuntimeError};

type SignalFn = Rc<RefCell<dyn FnMut(&mut Reactor, i32) -> CallbackResult>>;

pub struct SignalNotifier {
    signal: i32,
    callback: SignalFn,
}

impl std::fmt::Debug for SignalNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalNotifier")
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

impl SignalNotifier {
    /// A detached watch on `signal`. The callback runs on the reactor thread for
    /// each (possibly coalesced) delivery while attached.
    pub fn new(
        signal: i32,
        callback: impl FnMut(&mut Reactor, i32) -> CallbackResult + 'static,
    ) -> Notifier {
        Notifier::new(NotifierKind::Signal(Self {
            signal,
            callback: Rc::new(RefCell::new(callback)),
        }))
    }

    pub(crate) fn validate(&self, reactor: &Reactor) -> Result<(), RuntimeError> {
        if reactor.is_signal_watched(self.signal) {
            return Err(RuntimeError::config(format!(
                "signal {} is already watched",
                self.signal
            )));
        }
        Ok(())
    }

    pub(crate) fn on_attach(
        &mut self,
        reactor: &mut Reactor,
        _id: NotifierId,
    ) -> Result<(), RuntimeError> {
        let callback = Rc::clone(&self.callback);
        reactor.watch_signal(self.signal, move |r, signal| {
            (&mut *callback.borrow_mut())(r, signal)
        })
    }

    pub(crate) fn on_detach(&mut self, reactor: &mut Reactor, _id: NotifierId) {
        if let Err(err) = reactor.unwatch_signal(self.signal) {
            tracing::warn!(signal = self.signal, %err, "signal unwatch during detach failed");
        }
    }
}
