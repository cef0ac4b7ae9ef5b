// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Layer construction behind [`TracingConfig`]. Split from the config so hosts
//! that compose their own `tracing_subscriber::registry()` can reuse the layers.

use tracing_subscriber::{Layer, registry::LookupSpan};

use super::{TracingConfig, WriterConfig};

/// Type alias for a boxed layer.
pub type DynLayer<S> = dyn Layer<S> + Send + Sync + 'static;

/// Returns the layers for the given config. This does not initialize the tracing
/// system; callers hand the layers to their own registry (see
/// [`TracingConfig::install_global`] / [`TracingConfig::install_thread_local`]).
pub fn try_create_layers<S>(
    config: &TracingConfig,
) -> miette::Result<Vec<Box<DynLayer<S>>>>
where
    S: tracing_core::Subscriber + for<'span> LookupSpan<'span>,
{
    let mut layers: Vec<Box<DynLayer<S>>> = vec![Box::new(config.level_filter)];
    match config.writer_config {
        WriterConfig::None => {}
        WriterConfig::Stdout => {
            layers.push(Box::new(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stdout)
                    .with_target(false),
            ));
        }
        WriterConfig::Stderr => {
            layers.push(Box::new(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            ));
        }
    }
    Ok(layers)
}
