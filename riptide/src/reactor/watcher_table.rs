// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-fd watcher records: up to three callbacks (read-ready, write-ready, hangup)
//! and the interest mask derived from them.
//!
//! Invariant: the mask handed to the poll backend exactly reflects which callbacks
//! are present. Every merge or clear recomputes the mask; the reactor eagerly pushes
//! the result to the backend, so a watcher is never polled for a condition it has no
//! callback for.

use std::{cell::RefCell, os::fd::RawFd, rc::Rc};

use rustc_hash::FxHashMap;

use super::{InterestMask, RuntimeError};
use crate::reactor::Reactor;

/// Internal shape of every callback the loop invokes for fd readiness. Shared
/// (`Rc`) so the dispatch pass can snapshot callbacks before invoking any of them:
/// a callback that unregisters another watcher must not corrupt the iteration.
pub(crate) type IoCallback = Rc<RefCell<dyn FnMut(&mut Reactor) -> Result<(), RuntimeError>>>;

/// Callback slots being installed by a `watch_io` call. Slots left `None` keep
/// whatever was previously registered.
#[derive(Default)]
pub(crate) struct WatchSlots {
    pub read: Option<IoCallback>,
    pub write: Option<IoCallback>,
    pub hangup: Option<IoCallback>,
}

pub(crate) struct Watcher {
    pub read_cb: Option<IoCallback>,
    pub write_cb: Option<IoCallback>,
    pub hangup_cb: Option<IoCallback>,
}

impl Watcher {
    pub fn mask(&self) -> InterestMask {
        InterestMask {
            read: self.read_cb.is_some(),
            write: self.write_cb.is_some(),
            hangup: self.hangup_cb.is_some(),
        }
    }
}

#[derive(Default)]
pub(crate) struct WatcherTable {
    map: FxHashMap<RawFd, Watcher>,
}

impl WatcherTable {
    /// Merges the given slots into the fd's watcher, creating it if absent.
    /// Returns the new mask (for the backend sync).
    pub fn merge(&mut self, fd: RawFd, slots: WatchSlots) -> InterestMask {
        let watcher = self.map.entry(fd).or_insert(Watcher {
            read_cb: None,
            write_cb: None,
            hangup_cb: None,
        });
        if let Some(cb) = slots.read {
            watcher.read_cb = Some(cb);
        }
        if let Some(cb) = slots.write {
            watcher.write_cb = Some(cb);
        }
        if let Some(cb) = slots.hangup {
            watcher.hangup_cb = Some(cb);
        }
        watcher.mask()
    }

    /// Clears the selected slots. When the mask becomes empty the fd is removed
    /// entirely. Returns the new mask.
    pub fn clear(&mut self, fd: RawFd, which: InterestMask) -> InterestMask {
        let Some(watcher) = self.map.get_mut(&fd) else {
            return InterestMask::default();
        };
        if which.read {
            watcher.read_cb = None;
        }
        if which.write {
            watcher.write_cb = None;
        }
        if which.hangup {
            watcher.hangup_cb = None;
        }
        let mask = watcher.mask();
        if mask.is_empty() {
            self.map.remove(&fd);
        }
        mask
    }

    /// Removes the fd outright. Returns true when it was present.
    pub fn remove(&mut self, fd: RawFd) -> bool { self.map.remove(&fd).is_some() }

    pub fn contains(&self, fd: RawFd) -> bool { self.map.contains_key(&fd) }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn get(&self, fd: RawFd) -> Option<&Watcher> { self.map.get(&fd) }

    pub fn mask_of(&self, fd: RawFd) -> Option<InterestMask> {
        self.map.get(&fd).map(Watcher::mask)
    }
}
