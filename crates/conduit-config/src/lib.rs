//! Configuration for Conduit
//!
//! Covers the gateway TOML file (logging plus one table per provider) and the
//! per-provider connection settings consumed by the runtime registry.

#![allow(clippy::must_use_candidate)]

mod env;
mod loader;
pub mod log;
pub mod provider;

use indexmap::IndexMap;
use serde::Deserialize;

pub use log::{LogConfig, LogFormat};
pub use provider::{CompatibleProtocol, MAX_RETRIES_LIMIT, ProviderConfig};

/// Top-level Conduit configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Provider configurations keyed by name
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,
}

impl GatewayConfig {
    /// Look up a provider configuration by its table name
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}
