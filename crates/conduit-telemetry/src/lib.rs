//! Logging setup for Conduit
//!
//! Installs a `tracing-subscriber` registry with an env-filter and either a
//! text or JSON formatting layer.

use conduit_config::{LogConfig, LogFormat};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Build the env-filter for a configuration
///
/// `RUST_LOG` wins over the configured directive when set. An invalid
/// directive falls back to `info` rather than aborting startup.
pub fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(filter(config));

    let result = match config.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    result.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_directive_falls_back() {
        let config = LogConfig {
            filter: "=[broken".to_owned(),
            format: LogFormat::Text,
        };
        let filter = filter(&config);
        assert!(!filter.to_string().is_empty());
    }

    #[test]
    fn second_init_fails() {
        let config = LogConfig::default();
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
