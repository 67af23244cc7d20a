use std::time::Duration;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use url::Url;

/// Upper bound on automatic retries of transient failures
pub const MAX_RETRIES_LIMIT: u32 = 2;

/// Connection settings for a single provider
///
/// Everything except the provider id is optional; unset fields fall back to
/// the provider descriptor's defaults when the runtime is created.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Descriptor id this table targets (defaults to the table name)
    #[serde(default)]
    pub provider: Option<String>,
    /// Wire protocol for a provider that has no built-in descriptor
    #[serde(default)]
    pub compatible: Option<CompatibleProtocol>,
    /// Whether a custom provider accepts requests without an API key
    #[serde(default)]
    pub keyless: bool,
    /// API key for authentication
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Base URL override
    #[serde(default)]
    pub base_url: Option<Url>,
    /// HTTP(S) proxy for all upstream traffic
    #[serde(default)]
    pub proxy_url: Option<Url>,
    /// Extra headers sent with every upstream request
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    /// Overall per-call timeout (e.g. "30s", "2m")
    #[serde(default, deserialize_with = "deserialize_timeout")]
    pub timeout: Option<Duration>,
    /// Automatic retries of transient failures for non-streaming calls
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Return an empty list instead of an error when model listing fails
    #[serde(default)]
    pub models_fallback_empty: Option<bool>,
}

impl ProviderConfig {
    /// Create a configuration targeting the given descriptor id
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            ..Self::default()
        }
    }

    /// Set the API key
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::from(key.into()));
        self
    }

    /// Override the base URL
    #[must_use]
    pub fn with_base_url(mut self, url: Url) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set the per-call timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry count for transient failures
    #[must_use]
    pub const fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Add an extra request header
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Descriptor id for this configuration, falling back to the table name
    pub fn provider_id<'a>(&'a self, table_name: &'a str) -> &'a str {
        self.provider.as_deref().unwrap_or(table_name)
    }
}

/// Wire protocol families a custom provider can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompatibleProtocol {
    /// OpenAI chat completions
    Openai,
    /// Anthropic Messages API
    Anthropic,
    /// Google Generative Language API
    Google,
    /// Ollama native chat API
    Ollama,
}

fn deserialize_timeout<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };

    duration_str::parse(&raw)
        .map(Some)
        .map_err(|e| serde::de::Error::custom(format!("invalid timeout '{raw}': {e}")))
}
