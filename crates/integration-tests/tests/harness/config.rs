//! Provider configuration helpers for integration tests

use std::time::Duration;

use conduit_config::ProviderConfig;
use conduit_runtime::{ProviderRegistry, Runtime};
use url::Url;

/// Config for a built-in provider pointed at a mock upstream
pub fn provider(id: &str, base_url: &str) -> ProviderConfig {
    ProviderConfig::new(id)
        .with_api_key("test-key")
        .with_base_url(Url::parse(base_url).expect("valid mock url"))
        .with_timeout(Duration::from_secs(10))
}

/// Runtime for a built-in provider pointed at a mock upstream
pub fn runtime(id: &str, base_url: &str) -> Runtime {
    runtime_with(id, provider(id, base_url))
}

/// Runtime built from an explicit provider config
pub fn runtime_with(id: &str, config: ProviderConfig) -> Runtime {
    ProviderRegistry::builtin()
        .create(id, &config)
        .expect("runtime should build")
}
