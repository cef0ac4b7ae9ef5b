// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words unwind

//! The child side of a worker: a receive–compute–reply loop over the two
//! inherited pipes.
//!
//! Runs immediately after `fork()` and never returns. The child's pipe ends stay
//! blocking, stdin/stdout/stderr are deliberately left alone (they belong to the
//! user function), and exit is always through `_exit` so no parent-owned state is
//! dropped in the child.
//!
//! Exit codes: `0` after clean end-of-input on the argument pipe, `1` on a
//! truncated frame or an unwritable result pipe.

use std::{os::fd::OwnedFd, rc::Rc};

use super::frame::{LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE, encode_frame};

/// Child-side service function: full payload in, tagged reply payload out. Built
/// by the pool builder around the user's typed function.
pub(crate) type ServeFn = Rc<dyn Fn(&[u8]) -> Vec<u8>>;

/// Optional hook run in the child before the serve loop (closing inherited
/// descriptors, dropping privileges, and the like).
pub(crate) type SetupFn = Rc<dyn Fn()>;

const EXIT_CLEAN: i32 = 0;
const EXIT_IO: i32 = 1;

/// The worker main loop. Never returns.
pub(crate) fn run_child(
    args_read: OwnedFd,
    results_write: OwnedFd,
    serve: &ServeFn,
    setup: Option<&SetupFn>,
) -> ! {
    if let Some(setup) = setup {
        setup();
    }
    loop {
        let payload = match read_frame(&args_read) {
            Ok(Some(payload)) => payload,
            // End-of-input: the pool closed the argument channel.
            Ok(None) => exit(EXIT_CLEAN),
            Err(()) => exit(EXIT_IO),
        };
        let reply = serve(&payload);
        if write_all(&results_write, &encode_frame(&reply)).is_err() {
            exit(EXIT_IO);
        }
    }
}

fn exit(code: i32) -> ! {
    // _exit, not exit: no atexit handlers, no buffered stdio flush, no drops of
    // state forked from the parent.
    unsafe { libc::_exit(code) }
}

/// Blocking frame read. `Ok(None)` is clean EOF at a frame boundary; `Err` is a
/// truncated frame or a read failure.
fn read_frame(fd: &OwnedFd) -> Result<Option<Vec<u8>>, ()> {
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    match read_exact(fd, &mut prefix) {
        ReadOutcome::Done => {}
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Failed => return Err(()),
    }
    let length = u32::from_le_bytes(prefix);
    if length > MAX_FRAME_SIZE {
        return Err(());
    }
    let mut payload = vec![0u8; length as usize];
    match read_exact(fd, &mut payload) {
        ReadOutcome::Done => Ok(Some(payload)),
        // EOF inside a frame is truncation either way.
        ReadOutcome::Eof | ReadOutcome::Failed => Err(()),
    }
}

enum ReadOutcome {
    Done,
    /// EOF before the first byte.
    Eof,
    Failed,
}

fn read_exact(fd: &OwnedFd, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match rustix::io::read(fd, &mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 { ReadOutcome::Eof } else { ReadOutcome::Failed };
            }
            Ok(count) => filled += count,
            Err(rustix::io::Errno::INTR) => {}
            Err(_) => return ReadOutcome::Failed,
        }
    }
    ReadOutcome::Done
}

fn write_all(fd: &OwnedFd, mut bytes: &[u8]) -> Result<(), ()> {
    while !bytes.is_empty() {
        match rustix::io::write(fd, bytes) {
            Ok(0) => return Err(()),
            Ok(count) => bytes = &bytes[count..],
            Err(rustix::io::Errno::INTR) => {}
            Err(_) => return Err(()),
        }
    }
    Ok(())
}
