//! Provider registry and runtime factory
//!
//! Maps provider ids to descriptors and builds ready-to-use [`Runtime`]s.
//! Required configuration is checked here, so a runtime that was created
//! can always attempt a call.

use std::sync::Arc;

use conduit_config::{CompatibleProtocol, GatewayConfig, ProviderConfig};
use indexmap::IndexMap;
use secrecy::ExposeSecret;
use tracing::debug;

use crate::advisory::RateLimitBook;
use crate::descriptor::{Protocol, ProviderDescriptor, builtin_descriptors};
use crate::error::{CanonicalError, classify};
use crate::router::{Route, RouterRuntime};
use crate::runtime::Runtime;
use crate::transport::Transport;

/// One sub-runtime of a router: a provider, its settings and the models it serves
#[derive(Debug, Clone)]
pub struct RouterEntry {
    pub provider: String,
    pub config: ProviderConfig,
    pub models: Vec<String>,
}

/// Known providers plus the rate-limit book their runtimes share
#[derive(Debug)]
pub struct ProviderRegistry {
    descriptors: IndexMap<String, Arc<ProviderDescriptor>>,
    rate_limits: Arc<RateLimitBook>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProviderRegistry {
    /// Registry holding the built-in providers
    pub fn builtin() -> Self {
        Self {
            descriptors: builtin_descriptors()
                .iter()
                .map(|d| (d.id.clone(), Arc::new(d.clone())))
                .collect(),
            rate_limits: Arc::new(RateLimitBook::new()),
        }
    }

    /// Built-ins plus the custom compatible providers a config declares
    ///
    /// # Errors
    ///
    /// `MalformedRequest` when a provider table names an unknown descriptor
    /// or a compatible table has no base URL.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, CanonicalError> {
        let mut registry = Self::builtin();

        for (name, provider) in &config.providers {
            if let Some(compatible) = provider.compatible {
                let base_url = provider.base_url.as_ref().ok_or_else(|| {
                    classify::malformed_request(format!("compatible provider '{name}' needs a base_url"))
                })?;
                registry.register(ProviderDescriptor::compatible(
                    name,
                    protocol(compatible),
                    base_url,
                    provider.keyless,
                ));
            }
        }

        for (name, provider) in &config.providers {
            let id = provider.provider_id(name);
            if registry.descriptor(id).is_none() {
                return Err(classify::malformed_request(format!(
                    "provider '{name}' refers to unknown provider id '{id}'"
                )));
            }
        }

        Ok(registry)
    }

    /// Add or replace a descriptor
    pub fn register(&mut self, descriptor: ProviderDescriptor) {
        debug!(provider = %descriptor.id, protocol = ?descriptor.protocol, "registering provider");
        self.descriptors.insert(descriptor.id.clone(), Arc::new(descriptor));
    }

    pub fn descriptor(&self, id: &str) -> Option<&ProviderDescriptor> {
        self.descriptors.get(id).map(AsRef::as_ref)
    }

    /// All descriptors, in registration order
    pub fn descriptors(&self) -> impl Iterator<Item = &ProviderDescriptor> {
        self.descriptors.values().map(AsRef::as_ref)
    }

    /// Build a runtime for a provider
    ///
    /// # Errors
    ///
    /// `MalformedRequest` for an unknown id or unusable connection settings,
    /// `InvalidCredentials` when a provider that needs a key has none.
    pub fn create(&self, provider_id: &str, config: &ProviderConfig) -> Result<Runtime, CanonicalError> {
        let descriptor = self
            .descriptors
            .get(provider_id)
            .cloned()
            .ok_or_else(|| classify::malformed_request(format!("unknown provider '{provider_id}'")))?;

        let has_key = config
            .api_key
            .as_ref()
            .is_some_and(|key| !key.expose_secret().trim().is_empty());
        if !descriptor.keyless && !has_key {
            return Err(classify::invalid_credentials(format!("provider '{provider_id}' requires an API key"))
                .for_provider(provider_id));
        }

        let transport = Transport::new(Arc::clone(&descriptor), config).map_err(|e| e.for_provider(provider_id))?;
        let models_fallback_empty = config
            .models_fallback_empty
            .unwrap_or(descriptor.models_fallback_empty);

        debug!(provider = %provider_id, retries = transport.max_retries(), "runtime created");
        Ok(Runtime::new(
            descriptor,
            transport,
            Arc::clone(&self.rate_limits),
            models_fallback_empty,
        ))
    }

    /// Build a router fronting one runtime per entry, in priority order
    ///
    /// # Errors
    ///
    /// `MalformedRequest` when `entries` is empty; any error from
    /// [`Self::create`] for an entry.
    pub fn create_router(&self, id: &str, entries: Vec<RouterEntry>) -> Result<RouterRuntime, CanonicalError> {
        let routes = entries
            .into_iter()
            .map(|entry| Ok(Route::new(self.create(&entry.provider, &entry.config)?, entry.models)))
            .collect::<Result<Vec<_>, CanonicalError>>()?;
        RouterRuntime::new(id, routes)
    }

    /// Build the runtime for a named table of a gateway config
    ///
    /// # Errors
    ///
    /// `MalformedRequest` when the table does not exist; see [`Self::create`].
    pub fn create_named(&self, config: &GatewayConfig, name: &str) -> Result<Runtime, CanonicalError> {
        let provider = config
            .provider(name)
            .ok_or_else(|| classify::malformed_request(format!("no provider named '{name}' in config")))?;
        self.create(provider.provider_id(name), provider)
    }
}

const fn protocol(compatible: CompatibleProtocol) -> Protocol {
    match compatible {
        CompatibleProtocol::Openai => Protocol::OpenAi,
        CompatibleProtocol::Anthropic => Protocol::Anthropic,
        CompatibleProtocol::Google => Protocol::Google,
        CompatibleProtocol::Ollama => Protocol::Ollama,
    }
}
