use std::path::Path;

use secrecy::ExposeSecret;

use crate::{GatewayConfig, MAX_RETRIES_LIMIT, ProviderConfig};

impl GatewayConfig {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, environment variable
    /// expansion fails, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        let config = Self::parse(&raw)?;
        tracing::debug!(path = %path.display(), providers = config.providers.len(), "loaded configuration");

        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing, or validation fails
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that every provider table is internally consistent
    ///
    /// Descriptor ids are resolved later by the runtime registry, which owns
    /// the table of known providers.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending provider table
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, provider) in &self.providers {
            validate_provider(name, provider)?;
        }
        Ok(())
    }
}

fn validate_provider(name: &str, provider: &ProviderConfig) -> anyhow::Result<()> {
    if let Some(retries) = provider.max_retries
        && retries > MAX_RETRIES_LIMIT
    {
        anyhow::bail!("provider '{name}': max_retries must be at most {MAX_RETRIES_LIMIT}, got {retries}");
    }

    if provider.timeout.is_some_and(|t| t.is_zero()) {
        anyhow::bail!("provider '{name}': timeout must be greater than zero");
    }

    if provider.compatible.is_some() && provider.base_url.is_none() {
        anyhow::bail!("provider '{name}': a compatible provider requires base_url");
    }

    if provider.keyless && provider.compatible.is_none() {
        anyhow::bail!("provider '{name}': keyless only applies to compatible providers");
    }

    if let Some(key) = &provider.api_key
        && key.expose_secret().trim().is_empty()
    {
        anyhow::bail!("provider '{name}': api_key must not be empty");
    }

    for (header, value) in &provider.headers {
        if header.trim().is_empty() || header.contains(char::is_whitespace) {
            anyhow::bail!("provider '{name}': invalid header name '{header}'");
        }
        if value.contains(['\r', '\n']) {
            anyhow::bail!("provider '{name}': header '{header}' contains a line break");
        }
    }

    Ok(())
}
