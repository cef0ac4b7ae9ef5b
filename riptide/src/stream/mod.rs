// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Buffered bytestreams: bidirectional byte buffering over an arbitrary fd pair,
//! the incremental consumer protocol, and the accepting listener.

// Connect to source file.
pub mod byte_stream;
pub mod consumer;
pub mod listener;

// Re-export.
pub use byte_stream::*;
pub use consumer::*;
pub use listener::*;
