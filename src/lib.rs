pub mod config;
pub mod core;
pub mod utils;

use tracing_subscriber::EnvFilter;

// Re-export commonly used items for convenience
pub use config::{ConfigError, EngineConfig};
pub use crate::core::*;

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set, so embedding apps that
/// configure their own tracing are left alone.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
