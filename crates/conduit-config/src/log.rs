use serde::Deserialize;

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// `tracing` env-filter directive (e.g. `info,conduit_runtime=debug`)
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
        }
    }
}

fn default_filter() -> String {
    "info".to_owned()
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_info_text() {
        let config: LogConfig = toml::from_str("").unwrap();
        assert_eq!(config.filter, "info");
        assert_eq!(config.format, LogFormat::Text);
    }

    #[test]
    fn json_format() {
        let config: LogConfig = toml::from_str("filter = \"debug\"\nformat = \"json\"").unwrap();
        assert_eq!(config.filter, "debug");
        assert_eq!(config.format, LogFormat::Json);
    }
}
