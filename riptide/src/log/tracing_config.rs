// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Configure the tracing logging to suit your needs: choose a writer, set a level
//! filter, then install globally or per thread.

use tracing::dispatcher;
use tracing_core::LevelFilter;

use super::try_create_layers;

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterConfig {
    /// Level filtering only; no output layer (useful when the host installs its
    /// own).
    None,
    Stdout,
    Stderr,
}

/// The crate never installs a subscriber on its own: reactor internals emit
/// `tracing` events and stay silent unless the host (or a test) installs one,
/// e.g. through this config.
///
/// 1. [`Self::install_global`]: process-wide, can only be done once. For apps.
/// 2. [`Self::install_thread_local`]: scoped to the current thread via the
///    returned guard. For tests, where each test wants its own subscriber.
#[derive(Debug)]
pub struct TracingConfig {
    pub writer_config: WriterConfig,
    pub level_filter: LevelFilter,
}

impl TracingConfig {
    /// Stderr at the given level; the common case for command-line hosts.
    #[must_use]
    pub fn stderr(level_filter: LevelFilter) -> Self {
        Self {
            writer_config: WriterConfig::Stderr,
            level_filter,
        }
    }

    /// Installs the global tracing subscriber. Once set it cannot be unset or
    /// changed.
    ///
    /// # Errors
    ///
    /// Returns an error if a global subscriber has already been set.
    pub fn install_global(self) -> miette::Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
        tracing_subscriber::registry()
            .with(try_create_layers(&self)?)
            .try_init()
            .map_err(|err| miette::miette!("failed to install global subscriber: {err}"))
    }

    /// Installs a subscriber for the current thread. Drop the returned guard to
    /// restore the previous subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if the layers cannot be created.
    pub fn install_thread_local(self) -> miette::Result<dispatcher::DefaultGuard> {
        use tracing_subscriber::layer::SubscriberExt;
        let subscriber = tracing_subscriber::registry().with(try_create_layers(&self)?);
        Ok(tracing::subscriber::set_default(subscriber))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_local_subscriber_scopes_events() {
        let config = TracingConfig {
            writer_config: WriterConfig::None,
            level_filter: LevelFilter::DEBUG,
        };
        let guard = config.install_thread_local().unwrap();
        tracing::debug!("captured by the thread-local subscriber");
        drop(guard);
    }
}
