// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Tracing bootstrap for binaries and tests embedding the reactor.

// Connect to source file.
pub mod tracing_config;
pub mod tracing_init;

// Re-export.
pub use tracing_config::*;
pub use tracing_init::*;
