// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The reactor core: poll backend, fd watcher table, time queue, signal proxy,
//! child-process watch, and the dispatch loop that ties them together.

// Connect to source file.
pub mod child_watch;
pub mod poll_backend;
pub mod reactor_core;
pub mod reactor_error;
pub mod signal_proxy;
pub mod time_queue;
pub mod watcher_table;

// Re-export.
pub use child_watch::*;
pub use poll_backend::*;
pub use reactor_core::*;
pub use reactor_error::*;
pub use signal_proxy::*;
pub use time_queue::*;
pub use watcher_table::*;
