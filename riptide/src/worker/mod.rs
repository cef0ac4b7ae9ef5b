// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Worker-function pool: forked subprocesses hosting a long-lived user function,
//! spoken to over length-prefixed bincode frames on dedicated pipes.

// Connect to source file.
pub mod frame;
pub mod pool_builder;
pub mod worker_child;
pub mod worker_pool;

// Re-export.
pub use frame::*;
pub use pool_builder::*;
pub use worker_child::*;
pub use worker_pool::*;
