// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The reactor's notifier table: an id-indexed arena of attached handlers with
//! weak parent ids and owning child-id lists, plus the take-out/reinsert dispatch
//! discipline that lets a handler borrow both itself and the reactor.
//!
//! # Dispatch discipline
//!
//! A handler cannot be invoked while it sits inside the reactor (that would alias
//! `&mut Reactor`). [`Reactor::with_entry`] removes the entry from the table,
//! pushes it on an in-flight stack, runs the closure with `(&mut Reactor,
//! &mut NotifierEntry)`, and reinserts afterwards. Detaching an in-flight notifier
//! (its own handler closing it, or an ancestor being detached) marks the in-flight
//! record; teardown runs when the dispatch unwinds. Nested dispatch of *different*
//! notifiers is routine (a stream consumer driving its worker pool); re-entering
//! the *same* notifier is refused as a configuration error.

use std::{cell::RefCell, rc::Rc};

use rustc_hash::FxHashMap;

use super::{HandlerContext, IoDirection, IoHandler, Notifier, NotifierEntry, NotifierId,
            NotifierKind, NotifierRole};
use crate::reactor::{IoCallback, Reactor, RuntimeError};

struct InFlight {
    id: NotifierId,
    detach_requested: bool,
}

/// Arena of attached notifiers. See the [module docs](self).
#[derive(Default)]
pub(crate) struct NotifierTable {
    entries: FxHashMap<NotifierId, NotifierEntry>,
    in_flight: Vec<InFlight>,
    next_id: u64,
}

impl NotifierTable {
    pub fn alloc_id(&mut self) -> NotifierId {
        let id = NotifierId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn insert(&mut self, id: NotifierId, entry: NotifierEntry) {
        self.entries.insert(id, entry);
    }

    pub fn remove(&mut self, id: NotifierId) -> Option<NotifierEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: NotifierId) -> Option<&NotifierEntry> { self.entries.get(&id) }

    pub fn get_mut(&mut self, id: NotifierId) -> Option<&mut NotifierEntry> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: NotifierId) -> bool { self.entries.contains_key(&id) }

    pub fn is_in_flight(&self, id: NotifierId) -> bool {
        self.in_flight.iter().any(|record| record.id == id)
    }

    /// Marks an in-flight notifier for teardown-on-unwind. Returns false when the
    /// id is not dispatching.
    pub fn mark_detach_if_in_flight(&mut self, id: NotifierId) -> bool {
        for record in &mut self.in_flight {
            if record.id == id {
                record.detach_requested = true;
                return true;
            }
        }
        false
    }

    fn begin_dispatch(&mut self, id: NotifierId) -> Option<NotifierEntry> {
        let entry = self.entries.remove(&id)?;
        self.in_flight.push(InFlight {
            id,
            detach_requested: false,
        });
        Some(entry)
    }

    /// Pops the in-flight record (dispatch is strictly LIFO) and reports whether a
    /// detach was requested meanwhile.
    fn end_dispatch(&mut self, id: NotifierId) -> bool {
        match self.in_flight.pop() {
            Some(record) if record.id == id => record.detach_requested,
            record => {
                // A non-LIFO unwind is a crate bug; recover by treating the entry
                // as detached rather than corrupting the stack.
                tracing::error!(?id, popped = ?record.map(|r| r.id), "non-LIFO dispatch unwind");
                true
            }
        }
    }

    pub fn len(&self) -> usize { self.entries.len() }
}

impl Reactor {
    // ── Public tree surface ─────────────────────────────────────────────────

    /// Attaches a detached handler (and its whole subtree) to this reactor.
    /// Validation runs first over the full subtree; on any configuration error
    /// nothing is mutated.
    pub fn attach(&mut self, notifier: Notifier) -> Result<NotifierId, RuntimeError> {
        self.validate_subtree(&notifier)?;
        self.attach_subtree(None, notifier)
    }

    /// Attaches `child` under an attached parent. The child must be a detached,
    /// parentless value, which the type enforces: a [`Notifier`] you still hold is
    /// exactly that.
    pub fn add_child(
        &mut self,
        parent: NotifierId,
        child: Notifier,
    ) -> Result<NotifierId, RuntimeError> {
        if !self.notifiers.contains(parent) {
            return Err(if self.notifiers.is_in_flight(parent) {
                RuntimeError::config("parent notifier is dispatching; add the child afterwards")
            } else {
                RuntimeError::config("unknown parent notifier")
            });
        }
        self.validate_subtree(&child)?;
        let id = self.attach_subtree(Some(parent), child)?;
        if let Some(entry) = self.notifiers.get_mut(parent) {
            entry.children.push(id);
        }
        Ok(id)
    }

    /// Detaches a notifier subtree and returns it as a detached value (children
    /// preserved), ready for re-parenting or re-attachment. Fails while the
    /// notifier is dispatching; handlers detach themselves with
    /// [`request_detach`](Self::request_detach) instead.
    pub fn detach(&mut self, id: NotifierId) -> Result<Notifier, RuntimeError> {
        if self.notifiers.is_in_flight(id) {
            return Err(RuntimeError::config(
                "notifier is dispatching; use request_detach",
            ));
        }
        if !self.notifiers.contains(id) {
            return Err(RuntimeError::config("unknown notifier"));
        }
        if let Some(parent) = self.notifiers.get(id).and_then(|entry| entry.parent) {
            if let Some(entry) = self.notifiers.get_mut(parent) {
                entry.children.retain(|child| *child != id);
            }
        }
        self.detach_collect(id)
            .ok_or_else(|| RuntimeError::config("unknown notifier"))
    }

    /// Detaches `child` from `parent`, verifying the relationship first.
    pub fn remove_child(
        &mut self,
        parent: NotifierId,
        child: NotifierId,
    ) -> Result<Notifier, RuntimeError> {
        let actual = self.notifiers.get(child).and_then(|entry| entry.parent);
        if actual != Some(parent) {
            return Err(RuntimeError::config("notifier is not a child of that parent"));
        }
        self.detach(child)
    }

    /// Detaches and drops a notifier, from anywhere, including from within its
    /// own dispatch, in which case teardown runs when the handler returns.
    pub fn request_detach(&mut self, id: NotifierId) {
        if self.notifiers.mark_detach_if_in_flight(id) {
            return;
        }
        if self.notifiers.contains(id) {
            drop(self.detach(id));
        }
    }

    /// True while `id` is attached (including mid-dispatch).
    #[must_use]
    pub fn is_attached(&self, id: NotifierId) -> bool {
        self.notifiers.contains(id) || self.notifiers.is_in_flight(id)
    }

    /// Role of an attached notifier.
    #[must_use]
    pub fn role_of(&self, id: NotifierId) -> Option<NotifierRole> {
        self.notifiers.get(id).map(|entry| entry.kind.role())
    }

    /// Weak parent link of an attached notifier.
    #[must_use]
    pub fn parent_of(&self, id: NotifierId) -> Option<NotifierId> {
        self.notifiers.get(id).and_then(|entry| entry.parent)
    }

    /// Ids of the attached children of `id`.
    #[must_use]
    pub fn children_of(&self, id: NotifierId) -> Vec<NotifierId> {
        self.notifiers
            .get(id)
            .map(|entry| entry.children.clone())
            .unwrap_or_default()
    }

    /// Number of attached notifiers (excluding any currently dispatching).
    #[must_use]
    pub fn notifier_count(&self) -> usize { self.notifiers.len() }

    // ── Dispatch plumbing ───────────────────────────────────────────────────

    /// Runs `f` with the entry taken out of the table; see the [module
    /// docs](self). `None` when the id is unknown or already dispatching.
    pub(crate) fn with_entry<T>(
        &mut self,
        id: NotifierId,
        f: impl FnOnce(&mut Reactor, &mut NotifierEntry) -> T,
    ) -> Option<T> {
        let mut entry = self.notifiers.begin_dispatch(id)?;
        let out = f(self, &mut entry);
        if self.notifiers.end_dispatch(id) {
            self.teardown_in_flight(id, entry);
        } else {
            // Children detached while we were out leave stale ids behind.
            entry
                .children
                .retain(|child| self.notifiers.contains(*child) || self.notifiers.is_in_flight(*child));
            let orphaned = entry
                .parent
                .is_some_and(|parent| !self.is_attached(parent));
            if orphaned {
                self.teardown_in_flight(id, entry);
            } else {
                self.notifiers.insert(id, entry);
            }
        }
        Some(out)
    }

    /// Routes one readiness event to the notifier's capability handler. Handler
    /// errors are reported to the sink and detach the offender; the loop never sees
    /// them.
    pub(crate) fn dispatch_io(
        &mut self,
        id: NotifierId,
        direction: IoDirection,
    ) -> Result<(), RuntimeError> {
        let outcome = self.with_entry(id, |reactor, entry| {
            let mut cx = HandlerContext { reactor, id };
            match &mut entry.kind {
                NotifierKind::Stream(stream) => match direction {
                    IoDirection::Read => stream.on_read_ready(&mut cx),
                    IoDirection::Write => stream.on_write_ready(&mut cx),
                    IoDirection::Hangup => stream.on_hangup(&mut cx),
                },
                NotifierKind::Listener(listener) => match direction {
                    IoDirection::Read => listener.on_read_ready(&mut cx),
                    IoDirection::Write => listener.on_write_ready(&mut cx),
                    IoDirection::Hangup => listener.on_hangup(&mut cx),
                },
                NotifierKind::Plain(plain) => match direction {
                    IoDirection::Read => plain.on_read_ready(&mut cx),
                    IoDirection::Write => plain.on_write_ready(&mut cx),
                    IoDirection::Hangup => plain.on_hangup(&mut cx),
                },
                // Signal, timer, and worker notifiers carry no direct fd interest.
                _ => Ok(()),
            }
        });
        if let Some(Err(err)) = outcome {
            self.report_error(&err);
            self.request_detach(id);
        }
        Ok(())
    }

    // ── Attach / detach internals ───────────────────────────────────────────

    pub(crate) fn attach_subtree(
        &mut self,
        parent: Option<NotifierId>,
        notifier: Notifier,
    ) -> Result<NotifierId, RuntimeError> {
        let Notifier { kind, children } = notifier;
        let id = self.notifiers.alloc_id();
        tracing::trace!(?id, role = %kind.role(), "attaching notifier");
        self.notifiers.insert(
            id,
            NotifierEntry {
                parent,
                children: Vec::new(),
                kind,
            },
        );

        if let Err(err) = self.run_attach_hook(id) {
            self.request_detach(id);
            return Err(err);
        }

        for child in children {
            match self.attach_subtree(Some(id), child) {
                Ok(child_id) => {
                    if let Some(entry) = self.notifiers.get_mut(id) {
                        entry.children.push(child_id);
                    }
                }
                Err(err) => {
                    self.request_detach(id);
                    return Err(err);
                }
            }
        }
        Ok(id)
    }

    fn run_attach_hook(&mut self, id: NotifierId) -> Result<(), RuntimeError> {
        self.with_entry(id, |reactor, entry| {
            let NotifierEntry { children, kind, .. } = entry;
            match kind {
                NotifierKind::Plain(plain) => plain.on_attach(reactor, id),
                NotifierKind::Stream(stream) => stream.on_attach(reactor, id),
                NotifierKind::Listener(listener) => listener.on_attach(reactor, id),
                NotifierKind::Signal(signal) => signal.on_attach(reactor, id),
                NotifierKind::Timer(timer) => timer.on_attach(reactor, id),
                NotifierKind::Worker(pool) => pool.on_attach(reactor, id, children),
            }
        })
        .unwrap_or_else(|| Err(RuntimeError::config("notifier vanished during attach")))
    }

    fn run_detach_hook(
        &mut self,
        id: NotifierId,
        kind: &mut NotifierKind,
        detached_children: &mut Vec<Notifier>,
    ) {
        tracing::trace!(?id, role = %kind.role(), "detaching notifier");
        match kind {
            NotifierKind::Plain(plain) => plain.on_detach(self, id),
            NotifierKind::Stream(stream) => stream.on_detach(self, id),
            NotifierKind::Listener(listener) => listener.on_detach(self, id),
            NotifierKind::Signal(signal) => signal.on_detach(self, id),
            NotifierKind::Timer(timer) => timer.on_detach(self, id),
            NotifierKind::Worker(pool) => pool.on_detach(self, id, detached_children),
        }
    }

    /// Children first, then fd/timer/signal interest, then the value itself.
    fn detach_collect(&mut self, id: NotifierId) -> Option<Notifier> {
        let mut entry = self.notifiers.remove(id)?;
        let mut detached_children = Vec::new();
        for child in entry.children.drain(..) {
            if self.notifiers.mark_detach_if_in_flight(child) {
                continue;
            }
            if let Some(value) = self.detach_collect(child) {
                detached_children.push(value);
            }
        }
        self.run_detach_hook(id, &mut entry.kind, &mut detached_children);
        Some(Notifier {
            kind: entry.kind,
            children: detached_children,
        })
    }

    /// Teardown for an entry whose dispatch just unwound with a detach request.
    /// The detached value is dropped (its resources close with it).
    fn teardown_in_flight(&mut self, id: NotifierId, mut entry: NotifierEntry) {
        let mut detached_children = Vec::new();
        for child in entry.children.drain(..) {
            if self.notifiers.mark_detach_if_in_flight(child) {
                continue;
            }
            if let Some(value) = self.detach_collect(child) {
                detached_children.push(value);
            }
        }
        self.run_detach_hook(id, &mut entry.kind, &mut detached_children);
        if let Some(parent) = entry.parent {
            if let Some(parent_entry) = self.notifiers.get_mut(parent) {
                parent_entry.children.retain(|child| *child != id);
            }
        }
    }

    fn validate_subtree(&self, notifier: &Notifier) -> Result<(), RuntimeError> {
        match &notifier.kind {
            NotifierKind::Plain(plain) => plain.validate(self)?,
            NotifierKind::Stream(stream) => stream.validate(self)?,
            NotifierKind::Listener(listener) => listener.validate(self)?,
            NotifierKind::Signal(signal) => signal.validate(self)?,
            NotifierKind::Timer(_) => {}
            NotifierKind::Worker(pool) => pool.validate(self)?,
        }
        for child in &notifier.children {
            self.validate_subtree(child)?;
        }
        Ok(())
    }
}

/// Builds the watcher-table callback that routes an fd event to a notifier.
pub(crate) fn io_shim(id: NotifierId, direction: IoDirection) -> IoCallback {
    Rc::new(RefCell::new(move |reactor: &mut Reactor| {
        reactor.dispatch_io(id, direction)
    }))
}
