// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Notifier identity, roles, the detached handler value, and the capability trait
//! for fd-backed handlers.
//!
//! A [`Notifier`] is built detached (streams, listeners, timers, signal watches,
//! worker pools all construct one), may adopt children while detached, and is
//! consumed by [`Reactor::attach`] / [`Reactor::add_child`], which return a
//! [`NotifierId`]. Detaching returns the value, ready for re-parenting or
//! re-attachment. Parent links are ids (weak, lookup only); child links own.
//!
//! [`Reactor::attach`]: crate::Reactor::attach
//! [`Reactor::add_child`]: crate::Reactor::add_child

use crate::{notifier::{PlainNotifier, SignalNotifier, TimerNotifier},
            reactor::{Reactor, RuntimeError},
            stream::{ByteStream, Listener},
            worker::WorkerPool};

/// Opaque identity of an attached notifier. Stable for the lifetime of the
/// attachment; inert after detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotifierId(pub(crate) u64);

/// What a notifier is, as tracked in the reactor's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum NotifierRole {
    Plain,
    Stream,
    Listener,
    Signal,
    Timer,
    Worker,
}

/// The concrete handler behind a notifier entry. The tagged variant (rather than a
/// boxed trait object) keeps dispatch direct and lets each role expose exactly the
/// operations that make sense for it.
pub(crate) enum NotifierKind {
    Plain(PlainNotifier),
    Stream(ByteStream),
    Listener(Listener),
    Signal(SignalNotifier),
    Timer(TimerNotifier),
    Worker(WorkerPool),
}

impl NotifierKind {
    pub fn role(&self) -> NotifierRole {
        match self {
            NotifierKind::Plain(_) => NotifierRole::Plain,
            NotifierKind::Stream(_) => NotifierRole::Stream,
            NotifierKind::Listener(_) => NotifierRole::Listener,
            NotifierKind::Signal(_) => NotifierRole::Signal,
            NotifierKind::Timer(_) => NotifierRole::Timer,
            NotifierKind::Worker(_) => NotifierRole::Worker,
        }
    }
}

/// A detached handler, optionally carrying a subtree of children. See the
/// [module docs](self).
pub struct Notifier {
    pub(crate) kind: NotifierKind,
    pub(crate) children: Vec<Notifier>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("role", &self.kind.role())
            .field("children", &self.children.len())
            .finish()
    }
}

impl Notifier {
    pub(crate) fn new(kind: NotifierKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
        }
    }

    /// Role of this handler.
    #[must_use]
    pub fn role(&self) -> NotifierRole { self.kind.role() }

    /// Adopts `child`. Detached composition: when this notifier is later attached,
    /// the whole subtree attaches with it.
    pub fn add_child(&mut self, child: Notifier) { self.children.push(child); }

    /// Number of direct children.
    #[must_use]
    pub fn child_count(&self) -> usize { self.children.len() }
}

/// One entry in the reactor's notifier table.
pub(crate) struct NotifierEntry {
    /// Weak link: id lookup only, never ownership. Cycles are impossible because
    /// attach only ever links a parentless detached value.
    pub parent: Option<NotifierId>,
    /// Owning links to attached children.
    pub children: Vec<NotifierId>,
    pub kind: NotifierKind,
}

/// Context handed to [`IoHandler`] methods: the reactor plus the handler's own id
/// (the handle-to-self that callbacks use instead of owning `self`).
pub struct HandlerContext<'a> {
    pub(crate) reactor: &'a mut Reactor,
    pub(crate) id: NotifierId,
}

impl std::fmt::Debug for HandlerContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext").field("id", &self.id).finish()
    }
}

impl HandlerContext<'_> {
    #[must_use]
    pub fn id(&self) -> NotifierId { self.id }

    pub fn reactor(&mut self) -> &mut Reactor { self.reactor }
}

/// Capability set for fd-backed handlers. Concrete types implement the subset
/// relevant to them; the defaults ignore the event.
pub(crate) trait IoHandler {
    fn on_read_ready(&mut self, _cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn on_write_ready(&mut self, _cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn on_hangup(&mut self, _cx: &mut HandlerContext<'_>) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Which capability a readiness event maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoDirection {
    Read,
    Write,
    Hangup,
}
