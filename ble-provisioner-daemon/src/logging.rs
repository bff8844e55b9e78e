use ble_provisioner_core::traits::LogControl;
use ble_provisioner_core::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

const VERBOSE_FILTER: &str = "debug";

/// Log filter that can be swapped at runtime from `POST /api/logging`.
pub struct ReloadLogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    base_filter: String,
    verbose: AtomicBool,
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_filter`.
pub fn init(default_filter: &str) -> ReloadLogControl {
    let base_filter = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| default_filter.to_string());
    let filter = EnvFilter::try_new(&base_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    ReloadLogControl {
        handle,
        base_filter,
        verbose: AtomicBool::new(false),
    }
}

impl LogControl for ReloadLogControl {
    fn set_verbose(&self, enabled: bool) -> Result<()> {
        let directives: &str = if enabled { VERBOSE_FILTER } else { self.base_filter.as_str() };
        let filter = EnvFilter::try_new(directives)
            .map_err(|e| Error::Config(format!("Invalid log filter '{directives}': {e}")))?;
        self.handle
            .reload(filter)
            .map_err(|e| Error::Config(format!("Failed to reload log filter: {e}")))?;
        self.verbose.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "verbose logging toggled");
        Ok(())
    }

    fn is_verbose(&self) -> bool {
        self.verbose.load(Ordering::SeqCst)
    }
}
