// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words sigaction sigprocmask sigemptyset sigaddset SIGUSR errno trampoline

//! Self-pipe signal proxy: converts asynchronous POSIX signal delivery into
//! level-triggered reactor events.
//!
//! One proxy multiplexes every watched signal through a single non-blocking pipe.
//! The kernel-side handler (the *trampoline*) is the only code that ever runs in
//! async-signal context, and it does exactly two things: mark the signal pending in
//! a static atomic set, and, if the set was empty beforehand, write one byte into
//! the pipe, preserving `errno` around the write. No user callback runs there.
//!
//! The reactor-side drain ([`SignalProxy::collect_pending`]) blocks every watched
//! signal with `sigprocmask`, drains up to a page from the pipe (ignoring
//! would-block), swaps the pending set into a local list, and unblocks before
//! dispatch. The unblock is held by a guard so a panicking callback still restores
//! the mask.
//!
//! Two races are tolerated by design:
//! - a signal landing between the "was empty?" check and the `write` produces an
//!   extra byte; benign, since the reader is level-triggered and drains freely;
//! - a signal landing after the swap but before the unblock is left pending in the
//!   kernel and delivered on unblock, so the next drain cycle picks it up.
//!
//! Because the kernel has exactly one disposition table per process, the trampoline
//! state is process-global and at most one proxy may be live at a time. It is
//! created lazily on the first watch and fully torn down on the last unwatch,
//! restoring every saved disposition.

use std::{cell::RefCell,
          collections::BTreeMap,
          os::fd::{AsRawFd, OwnedFd, RawFd},
          rc::Rc,
          sync::atomic::{AtomicBool, AtomicI32, Ordering}};

use rustix::pipe::PipeFlags;

use super::{CallbackResult, RuntimeError};
use crate::reactor::Reactor;

/// Callback invoked on the reactor thread for each watched signal delivery.
pub(crate) type SignalCallback = Rc<RefCell<dyn FnMut(&mut Reactor, i32) -> CallbackResult>>;

/// Highest signal number the pending set can record (covers the classic and
/// realtime ranges on the supported platforms).
const MAX_SIGNAL: usize = 64;

const PENDING_INIT: AtomicBool = AtomicBool::new(false);

/// Per-signal "delivered since last drain" flags, written from signal context.
static PENDING: [AtomicBool; MAX_SIGNAL + 1] = [PENDING_INIT; MAX_SIGNAL + 1];

/// Whether any flag in [`PENDING`] is (possibly) set; gates the wake-byte write so
/// a burst of signals produces one byte, not thousands.
static PENDING_ANY: AtomicBool = AtomicBool::new(false);

/// Write end of the self-pipe, or -1 when no proxy is live.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Process-wide singleton guard.
static PROXY_LIVE: AtomicBool = AtomicBool::new(false);

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    unsafe { libc::__error() }
}

/// Runs in async-signal context. Record-and-wake only; `errno` is preserved.
extern "C" fn trampoline(signal: libc::c_int) {
    let saved_errno = unsafe { *errno_location() };

    let index = signal as usize;
    if index <= MAX_SIGNAL {
        PENDING[index].store(true, Ordering::SeqCst);
        if !PENDING_ANY.swap(true, Ordering::SeqCst) {
            let fd = WAKE_FD.load(Ordering::SeqCst);
            if fd >= 0 {
                let byte = [1u8];
                // A full pipe means the reader is already going to wake; the
                // short/failed write is ignored on purpose.
                let _ = unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
            }
        }
    }

    unsafe { *errno_location() = saved_errno };
}

/// Restores the previous thread signal mask on scope exit, panics included.
struct MaskGuard {
    previous: libc::sigset_t,
}

impl MaskGuard {
    /// Blocks every signal in `signals`, remembering the prior mask.
    fn block(signals: &[i32]) -> Result<Self, RuntimeError> {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            for &signal in signals {
                libc::sigaddset(&mut set, signal);
            }
            let mut previous: libc::sigset_t = std::mem::zeroed();
            if libc::sigprocmask(libc::SIG_BLOCK, &set, &mut previous) != 0 {
                return Err(RuntimeError::SignalMask(std::io::Error::last_os_error()));
            }
            Ok(Self { previous })
        }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        // Nothing sensible to do on failure here; delivery state was already
        // reported healthy when the guard was created.
        unsafe {
            libc::sigprocmask(libc::SIG_SETMASK, &self.previous, std::ptr::null_mut());
        }
    }
}

/// See the [module docs](self).
pub(crate) struct SignalProxy {
    pipe_read: OwnedFd,
    _pipe_write: OwnedFd,
    callbacks: BTreeMap<i32, SignalCallback>,
    saved: BTreeMap<i32, libc::sigaction>,
}

impl SignalProxy {
    /// Creates the process-wide proxy. Fails if another proxy (in this or another
    /// reactor) is already live.
    pub fn install() -> Result<Self, RuntimeError> {
        if PROXY_LIVE.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::config(
                "a signal proxy is already live in this process",
            ));
        }
        let (pipe_read, pipe_write) =
            match rustix::pipe::pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC) {
                Ok(pair) => pair,
                Err(errno) => {
                    PROXY_LIVE.store(false, Ordering::SeqCst);
                    return Err(RuntimeError::Backend(errno.into()));
                }
            };
        WAKE_FD.store(pipe_write.as_raw_fd(), Ordering::SeqCst);
        Ok(Self {
            pipe_read,
            _pipe_write: pipe_write,
            callbacks: BTreeMap::new(),
            saved: BTreeMap::new(),
        })
    }

    /// The fd the reactor registers for read readiness.
    pub fn wake_fd(&self) -> RawFd { self.pipe_read.as_raw_fd() }

    pub fn is_watching(&self, signal: i32) -> bool { self.callbacks.contains_key(&signal) }

    pub fn watch_count(&self) -> usize { self.callbacks.len() }

    /// Saves the current disposition for `signal`, installs the trampoline, and
    /// registers the callback.
    pub fn watch(&mut self, signal: i32, callback: SignalCallback) -> Result<(), RuntimeError> {
        if signal <= 0 || signal as usize > MAX_SIGNAL {
            return Err(RuntimeError::config(format!(
                "signal {signal} is out of range"
            )));
        }
        if self.callbacks.contains_key(&signal) {
            return Err(RuntimeError::config(format!(
                "signal {signal} is already watched"
            )));
        }

        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            let handler: extern "C" fn(libc::c_int) = trampoline;
            action.sa_sigaction = handler as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);

            let mut previous: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(signal, &action, &mut previous) != 0 {
                return Err(RuntimeError::config(format!(
                    "sigaction({signal}) failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            self.saved.insert(signal, previous);
        }

        self.callbacks.insert(signal, callback);
        tracing::debug!(signal, "signal watch installed");
        Ok(())
    }

    /// Restores the saved disposition and drops the callback. Returns true when the
    /// proxy has no watches left and should be torn down.
    pub fn unwatch(&mut self, signal: i32) -> Result<bool, RuntimeError> {
        if self.callbacks.remove(&signal).is_none() {
            return Err(RuntimeError::config(format!(
                "signal {signal} is not watched"
            )));
        }
        restore_disposition(signal, self.saved.remove(&signal));
        PENDING[signal as usize].store(false, Ordering::SeqCst);
        tracing::debug!(signal, "signal watch removed");
        Ok(self.callbacks.is_empty())
    }

    /// Drains the pipe and swaps out the pending set under a blocked signal mask.
    /// Returns the signals to dispatch, in ascending signal-number order (ordering
    /// across distinct signals is explicitly unspecified).
    pub fn collect_pending(&mut self) -> Result<Vec<i32>, RuntimeError> {
        let watched: Vec<i32> = self.callbacks.keys().copied().collect();
        let _mask = MaskGuard::block(&watched)?;

        // Drain up to a page; would-block means the pipe is empty, which is fine.
        let mut page = [0u8; 4096];
        match rustix::io::read(&self.pipe_read, &mut page) {
            Ok(_) => {}
            Err(rustix::io::Errno::WOULDBLOCK) | Err(rustix::io::Errno::INTR) => {}
            Err(errno) => return Err(RuntimeError::Backend(errno.into())),
        }

        // Reset the wake gate before sweeping the flags: a signal landing mid-sweep
        // re-arms the gate and writes a fresh byte, at worst a spurious wakeup.
        PENDING_ANY.store(false, Ordering::SeqCst);

        let mut delivered = Vec::new();
        for signal in watched {
            if PENDING[signal as usize].swap(false, Ordering::SeqCst) {
                delivered.push(signal);
            }
        }
        Ok(delivered)
        // _mask drops here: watched signals unblock before callbacks run.
    }

    /// Snapshot of the registered callback for one signal.
    pub fn callback_for(&self, signal: i32) -> Option<SignalCallback> {
        self.callbacks.get(&signal).map(Rc::clone)
    }
}

impl Drop for SignalProxy {
    fn drop(&mut self) {
        for (signal, saved) in std::mem::take(&mut self.saved) {
            restore_disposition(signal, Some(saved));
            PENDING[signal as usize].store(false, Ordering::SeqCst);
        }
        WAKE_FD.store(-1, Ordering::SeqCst);
        PENDING_ANY.store(false, Ordering::SeqCst);
        PROXY_LIVE.store(false, Ordering::SeqCst);
    }
}

/// Reinstates the disposition a signal had before it was watched, falling back to
/// the system default.
fn restore_disposition(signal: i32, saved: Option<libc::sigaction>) {
    unsafe {
        match saved {
            Some(previous) => {
                libc::sigaction(signal, &previous, std::ptr::null_mut());
            }
            None => {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigemptyset(&mut action.sa_mask);
                libc::sigaction(signal, &action, std::ptr::null_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use signal_hook::consts::SIGUSR2;

    use super::*;

    fn noop_callback() -> SignalCallback {
        Rc::new(RefCell::new(|_: &mut Reactor, _signal: i32| Ok(())))
    }

    fn current_handler(signal: i32) -> usize {
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            libc::sigaction(signal, std::ptr::null(), &mut action);
            action.sa_sigaction
        }
    }

    #[test]
    #[serial]
    fn test_watch_then_unwatch_restores_disposition() {
        let before = current_handler(SIGUSR2);

        let mut proxy = SignalProxy::install().unwrap();
        proxy.watch(SIGUSR2, noop_callback()).unwrap();
        assert_ne!(current_handler(SIGUSR2), before);

        let now_empty = proxy.unwatch(SIGUSR2).unwrap();
        assert!(now_empty);
        assert_eq!(current_handler(SIGUSR2), before);
        drop(proxy);
        assert!(!PROXY_LIVE.load(Ordering::SeqCst));
    }

    #[test]
    #[serial]
    fn test_raise_marks_pending_and_wakes_pipe() {
        let mut proxy = SignalProxy::install().unwrap();
        proxy.watch(SIGUSR2, noop_callback()).unwrap();

        signal_hook::low_level::raise(SIGUSR2).unwrap();

        let mut byte = [0u8; 16];
        let drained = rustix::io::read(
            unsafe { std::os::fd::BorrowedFd::borrow_raw(proxy.wake_fd()) },
            &mut byte,
        )
        .unwrap();
        assert!(drained >= 1);

        // Re-deliver so collect_pending (which drains itself) sees it.
        signal_hook::low_level::raise(SIGUSR2).unwrap();
        let pending = proxy.collect_pending().unwrap();
        assert_eq!(pending, vec![SIGUSR2]);

        // Nothing pending afterwards.
        assert!(proxy.collect_pending().unwrap().is_empty());
        proxy.unwatch(SIGUSR2).unwrap();
    }

    #[test]
    #[serial]
    fn test_burst_coalesces_to_single_delivery() {
        let mut proxy = SignalProxy::install().unwrap();
        proxy.watch(SIGUSR2, noop_callback()).unwrap();

        for _ in 0..1000 {
            signal_hook::low_level::raise(SIGUSR2).unwrap();
        }

        let pending = proxy.collect_pending().unwrap();
        assert_eq!(pending, vec![SIGUSR2]);
        assert!(proxy.collect_pending().unwrap().is_empty());
        proxy.unwatch(SIGUSR2).unwrap();
    }

    #[test]
    #[serial]
    fn test_second_proxy_is_refused() {
        let proxy = SignalProxy::install().unwrap();
        assert!(SignalProxy::install().is_err());
        drop(proxy);
        // Teardown releases the singleton slot.
        let again = SignalProxy::install().unwrap();
        drop(again);
    }

    #[test]
    #[serial]
    fn test_duplicate_watch_is_config_error() {
        let mut proxy = SignalProxy::install().unwrap();
        proxy.watch(SIGUSR2, noop_callback()).unwrap();
        assert!(proxy.watch(SIGUSR2, noop_callback()).is_err());
        proxy.unwatch(SIGUSR2).unwrap();
    }
}
