// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words bytestream bytestreams sigaction waitpid

//! # riptide
//!
//! A single-threaded asynchronous I/O reactor for Unix. One dispatching thread
//! multiplexes:
//!
//! - **fd readiness** via a poll backend built on [`mio`],
//! - **monotonic timers** in a min-heap time queue with cancellation by handle,
//! - **POSIX signal delivery**, converted into in-loop events by a self-pipe proxy,
//! - **child-process completion**, swept with `waitpid` on `SIGCHLD`,
//! - **buffered bytestreams** with an incremental consumer protocol and a
//!   close-when-drained discipline,
//! - **worker-function pools**: forked subprocesses hosting a long-lived user
//!   function, spoken to over length-prefixed bincode frames.
//!
//! A program composes a tree of [`Notifier`] handlers (streams, listeners, timers,
//! signal watches, worker pools) and attaches it to a [`Reactor`]. All callbacks run
//! on the reactor thread; the only asynchronous intrusion is the signal trampoline,
//! which does nothing beyond recording the signal and waking the loop.
//!
//! ```no_run
//! use riptide::{ByteStream, ConsumeOutcome, Reactor};
//!
//! fn main() -> miette::Result<()> {
//!     let mut reactor = Reactor::new()?;
//!     # let socket: std::os::fd::OwnedFd = todo!();
//!     let echo = ByteStream::builder()
//!         .socket(socket)
//!         .consumer(|cx: &mut riptide::StreamContext<'_>, _eof: bool| {
//!             match cx.buffer().iter().position(|&b| b == b'\n') {
//!                 Some(at) => {
//!                     let line: Vec<u8> = cx.buffer().drain(..=at).collect();
//!                     cx.write(&line);
//!                     Ok(ConsumeOutcome::Again)
//!                 }
//!                 None => Ok(ConsumeOutcome::NeedMore),
//!             }
//!         })
//!         .build()?;
//!     reactor.attach(echo)?;
//!     reactor.run()?;
//!     Ok(())
//! }
//! ```
//!
//! [`Notifier`]: crate::Notifier
//! [`Reactor`]: crate::Reactor

// Connect to source file.
pub mod log;
pub mod notifier;
pub mod reactor;
pub mod stream;
pub mod worker;

// Re-export.
pub use log::*;
pub use notifier::*;
pub use reactor::*;
pub use stream::*;
pub use worker::*;
