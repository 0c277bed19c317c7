//! Node configuration.
//!
//! Every section has defaults, so a config file only needs the fields it
//! changes.

use crate::core::{Error, Result};
use crate::intent::{RegistryConfig, ResolverWeights};
use crate::node::NodeConfig;
use crate::observability::LoggingConfig;
use crate::qos::QosConfig;
use crate::security::SecurityConfig;
use crate::transport::{RetryPolicy, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete configuration of a protocol node.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub node: NodeConfig,
    pub registry: RegistryConfig,
    pub resolver: ResolverWeights,
    pub qos: QosConfig,
    pub transport: TransportConfig,
    pub retry: RetryPolicy,
    pub security: SecurityConfig,
    pub logging: LoggingConfig,
}

impl ProtocolConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.registry.validate()?;
        let weights = &self.resolver;
        if [weights.trust, weights.latency, weights.headroom]
            .iter()
            .any(|w| !w.is_finite())
        {
            return Err(Error::Config("resolver weights must be finite".into()));
        }
        self.qos.validate()?;
        if self.qos.class(&self.node.control_class).is_none() {
            return Err(Error::Config(format!(
                "control class {} is not a configured QoS class",
                self.node.control_class
            )));
        }
        self.transport.validate()?;
        self.retry.validate()?;
        if self.security.handshake_timeout_ms == 0 || self.security.session_lease_ms == 0 {
            return Err(Error::Config("security timeouts must be positive".into()));
        }
        self.logging.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::qos::OverflowPolicy;

    #[test]
    fn test_defaults_validate() {
        assert!(ProtocolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let config = ProtocolConfig::from_json_str(
            r#"{
                "registry": { "expiry_ms": 5000 },
                "retry": { "max_attempts": 5 },
                "logging": { "format": "json" }
            }"#,
        )
        .unwrap();
        assert_eq!(config.registry.expiry_ms, 5_000);
        assert_eq!(config.registry.max_records, RegistryConfig::default().max_records);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.qos.class("batch").unwrap().overflow, OverflowPolicy::Backpressure);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ProtocolConfig::from_json_str(r#"{ "retry": { "max_attempts": 0 } }"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = ProtocolConfig::from_json_str("{ not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = ProtocolConfig::from_json_str(r#"{ "node": { "control_class": "bulk" } }"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_file_round_trip() {
        let path = std::env::temp_dir().join(format!("iicp-config-{}.json", uuid::Uuid::new_v4()));
        let mut config = ProtocolConfig::default();
        config.transport.tcp_listen = Some("127.0.0.1:0".into());
        std::fs::write(&path, config.to_json().unwrap()).unwrap();
        let loaded = ProtocolConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.transport, config.transport);
        assert!(ProtocolConfig::from_file(&path).is_err());
    }
}
