//! Structured logging setup.
//!
//! The protocol core logs through `tracing`; embedders call
//! [`init_tracing`] once to install a formatted subscriber.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logger configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `iicp=debug`
    pub filter: String,
    pub format: LogFormat,
    /// Include module targets in output
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Text,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        EnvFilter::try_new(&self.filter)
            .map(|_| ())
            .map_err(|e| Error::Config(format!("invalid log filter '{}': {}", self.filter, e)))
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the configured
/// filter. Fails if a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| Error::Config(format!("invalid log filter '{}': {}", config.filter, e)))?,
    };
    let subscriber = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_target(config.with_target))
            .try_init(),
        LogFormat::Text => subscriber
            .with(fmt::layer().with_target(config.with_target))
            .try_init(),
    };
    result.map_err(|e| Error::Config(format!("tracing already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parsing() {
        let config: LoggingConfig =
            serde_json::from_str(r#"{"filter":"iicp=debug","format":"json"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.with_target);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_filter() {
        let config = LoggingConfig {
            filter: "iicp=loud[".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_second_init_fails_cleanly() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
