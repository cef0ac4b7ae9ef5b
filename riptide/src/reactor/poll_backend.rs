// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words epoll kqueue revents EPOLLPRI fstat

//! Readiness-polling backend over [`mio::Poll`].
//!
//! The reactor consumes exactly three operations from this type: [`set_mask`],
//! [`clear`], and [`wait`]. Everything platform-shaped is encapsulated here:
//!
//! - **Regular files**: `epoll`/`kqueue` refuse (or lie about) plain files, so fds
//!   that `fstat` as regular files never enter the mio registry. They are tracked in
//!   a synthetic set, force the wait timeout to zero while they carry interest, and
//!   are reported ready for whatever their mask asks.
//! - **Failed non-blocking connect**: some platforms report it only via the
//!   priority bit, so write interest always includes `PRIORITY` where mio offers it.
//! - **Hangup-only interest**: mio cannot register an empty interest set, so a
//!   hangup-only mask registers as readable; hangup and error conditions are
//!   reported regardless of the requested set.
//!
//! [`set_mask`]: PollBackend::set_mask
//! [`clear`]: PollBackend::clear
//! [`wait`]: PollBackend::wait

use std::{os::fd::{BorrowedFd, RawFd},
          time::Duration};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use rustc_hash::FxHashMap;

/// How many readiness events one wait can report.
const EVENTS_CAPACITY: usize = 1024;

/// The set of readiness conditions a watcher is interested in. The watcher table
/// keeps this exactly in sync with which callbacks are registered for the fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestMask {
    pub read: bool,
    pub write: bool,
    pub hangup: bool,
}

impl InterestMask {
    #[must_use]
    pub fn is_empty(&self) -> bool { !(self.read || self.write || self.hangup) }
}

/// Readiness conditions reported for one fd by one wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub priority: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    /// Read callbacks fire on readable data, hangup, or error.
    #[must_use]
    pub fn triggers_read(&self) -> bool { self.readable || self.hangup || self.error }

    /// Write callbacks fire on writable, priority (connect completion), hangup, or
    /// error.
    #[must_use]
    pub fn triggers_write(&self) -> bool {
        self.writable || self.priority || self.hangup || self.error
    }

    /// Hangup callbacks fire on hangup or error only.
    #[must_use]
    pub fn triggers_hangup(&self) -> bool { self.hangup || self.error }
}

/// One `(fd, revents)` pair out of [`PollBackend::wait`].
#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    pub fd: RawFd,
    pub readiness: Readiness,
}

/// See the [module docs](self).
#[derive(Debug)]
pub struct PollBackend {
    poll: Poll,
    events: Events,
    /// fds registered with mio, with their current mask.
    registered: FxHashMap<RawFd, InterestMask>,
    /// Regular-file fds: kept out of the mio set, readiness synthesized.
    synthetic: FxHashMap<RawFd, InterestMask>,
}

impl PollBackend {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registered: FxHashMap::default(),
            synthetic: FxHashMap::default(),
        })
    }

    /// Sets the interest mask for `fd`, registering, re-registering, or removing it
    /// as needed. An empty mask is equivalent to [`clear`](Self::clear).
    pub fn set_mask(&mut self, fd: RawFd, mask: InterestMask) -> std::io::Result<()> {
        if mask.is_empty() {
            return self.clear(fd);
        }

        if self.synthetic.contains_key(&fd) || is_regular_file(fd) {
            self.synthetic.insert(fd, mask);
            return Ok(());
        }

        let interest = to_interest(mask);
        let mut source = SourceFd(&fd);
        if self.registered.contains_key(&fd) {
            self.poll
                .registry()
                .reregister(&mut source, Token(fd as usize), interest)?;
        } else {
            self.poll
                .registry()
                .register(&mut source, Token(fd as usize), interest)?;
        }
        self.registered.insert(fd, mask);
        Ok(())
    }

    /// Removes all interest for `fd`. Unknown fds are ignored.
    pub fn clear(&mut self, fd: RawFd) -> std::io::Result<()> {
        if self.synthetic.remove(&fd).is_some() {
            return Ok(());
        }
        if self.registered.remove(&fd).is_some() {
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
        }
        Ok(())
    }

    /// True when nothing at all is being watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registered.is_empty() && self.synthetic.is_empty()
    }

    /// Current mask for a watched fd, real or synthetic.
    #[must_use]
    pub fn mask_of(&self, fd: RawFd) -> Option<InterestMask> {
        self.registered
            .get(&fd)
            .or_else(|| self.synthetic.get(&fd))
            .copied()
    }

    /// Blocks until readiness or timeout, returning `(fd, revents)` pairs.
    ///
    /// `None` blocks indefinitely. Interrupted waits surface as
    /// [`std::io::ErrorKind::Interrupted`]; the reactor decides whether to retry.
    pub fn wait(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<IoEvent>> {
        // Synthesized-ready fds must not let the real poll sleep.
        let timeout = if self.synthetic.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        self.poll.poll(&mut self.events, timeout)?;

        let mut out = Vec::with_capacity(self.events.iter().count() + self.synthetic.len());
        for event in self.events.iter() {
            out.push(IoEvent {
                fd: event.token().0 as RawFd,
                readiness: Readiness {
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                    priority: event.is_priority(),
                    hangup: event.is_read_closed() || event.is_write_closed(),
                    error: event.is_error(),
                },
            });
        }

        for (&fd, &mask) in &self.synthetic {
            out.push(IoEvent {
                fd,
                readiness: Readiness {
                    readable: mask.read,
                    writable: mask.write,
                    ..Readiness::default()
                },
            });
        }

        Ok(out)
    }
}

fn to_interest(mask: InterestMask) -> Interest {
    let mut interest: Option<Interest> = None;
    let mut add = |bit: Interest| {
        interest = Some(match interest {
            Some(existing) => existing.add(bit),
            None => bit,
        });
    };

    if mask.read {
        add(Interest::READABLE);
    }
    if mask.write {
        add(Interest::WRITABLE);
        // Failed non-blocking connects may only raise the priority bit.
        #[cfg(any(target_os = "linux", target_os = "android"))]
        add(Interest::PRIORITY);
    }

    // Hangup-only: epoll/kqueue report HUP/ERR unconditionally, mio just needs a
    // non-empty registration.
    interest.unwrap_or(Interest::READABLE)
}

fn is_regular_file(fd: RawFd) -> bool {
    // The watcher table only hands us fds it currently watches, so borrowing the
    // raw fd for the duration of one fstat is sound.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    rustix::fs::fstat(borrowed)
        .map(|stat| rustix::fs::FileType::from_raw_mode(stat.st_mode).is_file())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, os::fd::AsRawFd};

    use super::*;

    #[test]
    fn test_writable_pipe_end_reports_ready() {
        let mut backend = PollBackend::new().unwrap();
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();

        backend
            .set_mask(
                write_end.as_raw_fd(),
                InterestMask {
                    write: true,
                    ..InterestMask::default()
                },
            )
            .unwrap();

        let events = backend.wait(Some(Duration::from_millis(100))).unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.fd == write_end.as_raw_fd() && e.readiness.triggers_write())
        );

        backend.clear(write_end.as_raw_fd()).unwrap();
        assert!(backend.is_empty());
        drop(read_end);
    }

    #[test]
    fn test_readable_pipe_end_waits_for_data() {
        let mut backend = PollBackend::new().unwrap();
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();

        backend
            .set_mask(
                read_end.as_raw_fd(),
                InterestMask {
                    read: true,
                    ..InterestMask::default()
                },
            )
            .unwrap();

        let events = backend.wait(Some(Duration::ZERO)).unwrap();
        assert!(events.is_empty());

        rustix::io::write(&write_end, b"x").unwrap();
        let events = backend.wait(Some(Duration::from_millis(100))).unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.fd == read_end.as_raw_fd() && e.readiness.triggers_read())
        );
    }

    #[test]
    fn test_regular_file_gets_synthetic_readiness() {
        let mut backend = PollBackend::new().unwrap();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"contents").unwrap();
        let fd = file.as_raw_fd();

        backend
            .set_mask(
                fd,
                InterestMask {
                    read: true,
                    write: true,
                    ..InterestMask::default()
                },
            )
            .unwrap();

        // A one-hour timeout must not actually block: synthetic readiness forces a
        // zero-timeout poll.
        let start = std::time::Instant::now();
        let events = backend.wait(Some(Duration::from_secs(3600))).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        let synthesized = events.iter().find(|e| e.fd == fd).unwrap();
        assert!(synthesized.readiness.readable);
        assert!(synthesized.readiness.writable);

        backend.clear(fd).unwrap();
        assert!(backend.is_empty());
    }

    #[test]
    fn test_mask_of_reflects_registration() {
        let mut backend = PollBackend::new().unwrap();
        let (read_end, _write_end) = rustix::pipe::pipe().unwrap();
        let fd = read_end.as_raw_fd();

        assert!(backend.mask_of(fd).is_none());
        let mask = InterestMask {
            read: true,
            hangup: true,
            ..InterestMask::default()
        };
        backend.set_mask(fd, mask).unwrap();
        assert_eq!(backend.mask_of(fd), Some(mask));

        backend.set_mask(fd, InterestMask::default()).unwrap();
        assert!(backend.mask_of(fd).is_none());
    }
}
