// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words waitpid WNOHANG SIGCHLD

//! Child-process completion: `waitpid(WNOHANG)` sweeps driven by `SIGCHLD`.
//!
//! The reactor lazily watches `SIGCHLD` through the signal proxy when the first
//! child watch is registered (see [`Reactor::watch_child`]) and releases the watch
//! when the last one is dispatched. Exit statuses for pids nobody watches are
//! logged and dropped.
//!
//! [`Reactor::watch_child`]: crate::Reactor::watch_child

use rustc_hash::FxHashMap;

use super::CallbackResult;
use crate::reactor::Reactor;

/// How a reaped child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// Normal exit with the given code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(i32),
}

/// Delivered to a child-watch callback exactly once.
#[derive(Debug, Clone, Copy)]
pub struct ChildExit {
    pub pid: i32,
    pub status: ChildStatus,
}

/// One-shot completion callback for a watched child pid.
pub(crate) type ChildCallback = Box<dyn FnOnce(&mut Reactor, ChildExit) -> CallbackResult>;

#[derive(Default)]
pub(crate) struct ChildWatchTable {
    map: FxHashMap<i32, ChildCallback>,
}

impl ChildWatchTable {
    pub fn insert(&mut self, pid: i32, callback: ChildCallback) -> bool {
        if self.map.contains_key(&pid) {
            return false;
        }
        self.map.insert(pid, callback);
        true
    }

    pub fn take(&mut self, pid: i32) -> Option<ChildCallback> { self.map.remove(&pid) }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

fn decode_status(raw: libc::c_int) -> ChildStatus {
    if libc::WIFSIGNALED(raw) {
        ChildStatus::Signaled(libc::WTERMSIG(raw))
    } else {
        ChildStatus::Exited(libc::WEXITSTATUS(raw))
    }
}

/// Reaps every child that has already exited. Never blocks.
pub(crate) fn reap_any() -> Vec<ChildExit> {
    let mut reaped = Vec::new();
    loop {
        let mut raw: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut raw, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        reaped.push(ChildExit {
            pid,
            status: decode_status(raw),
        });
    }
    reaped
}

/// Reaps one specific pid if it has already exited. Never blocks. `None` means the
/// child is still running or was already reaped elsewhere.
pub(crate) fn reap_pid(pid: i32) -> Option<ChildStatus> {
    let mut raw: libc::c_int = 0;
    let result = unsafe { libc::waitpid(pid, &mut raw, libc::WNOHANG) };
    if result == pid {
        Some(decode_status(raw))
    } else {
        None
    }
}
