//! QoS class definitions.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What happens when a class queue is full.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Fail fast with `Overloaded`
    Reject,
    /// Suspend the producer until space frees
    Backpressure,
}

/// One priority class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QosClassConfig {
    pub name: String,
    /// Default time to live for envelopes in this class
    pub target_deadline_ms: u64,
    /// Relative share of dispatch decisions under contention
    pub priority_weight: u32,
    /// Concurrent in-flight dispatches
    pub max_concurrency: usize,
    /// Guaranteed fraction of dispatch decisions over the fairness window
    pub min_share: f64,
    pub queue_bound: usize,
    /// Expected time to serve one message
    pub service_estimate_ms: u64,
    pub overflow: OverflowPolicy,
}

impl QosClassConfig {
    pub fn realtime() -> Self {
        Self {
            name: "realtime".to_string(),
            target_deadline_ms: 1_000,
            priority_weight: 8,
            max_concurrency: 8,
            min_share: 0.1,
            queue_bound: 128,
            service_estimate_ms: 50,
            overflow: OverflowPolicy::Reject,
        }
    }

    pub fn interactive() -> Self {
        Self {
            name: "interactive".to_string(),
            target_deadline_ms: 5_000,
            priority_weight: 4,
            max_concurrency: 8,
            min_share: 0.2,
            queue_bound: 256,
            service_estimate_ms: 150,
            overflow: OverflowPolicy::Reject,
        }
    }

    pub fn batch() -> Self {
        Self {
            name: "batch".to_string(),
            target_deadline_ms: 60_000,
            priority_weight: 1,
            max_concurrency: 16,
            min_share: 0.1,
            queue_bound: 4_096,
            service_estimate_ms: 200,
            overflow: OverflowPolicy::Backpressure,
        }
    }

    /// Earliest plausible completion of a message queued behind `depth`
    /// others.
    pub fn projected_completion_ms(&self, now_ms: u64, depth: usize) -> u64 {
        let rounds = depth.div_ceil(self.max_concurrency.max(1)) as u64;
        now_ms.saturating_add(rounds.saturating_mul(self.service_estimate_ms))
    }

    /// Projected wait of the last entry a full queue admits.
    pub fn full_queue_wait_ms(&self) -> u64 {
        self.projected_completion_ms(0, self.queue_bound.saturating_sub(1))
    }
}

/// Scheduler configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    pub classes: Vec<QosClassConfig>,
    /// Number of recent dispatch decisions minimum shares are measured over
    pub fairness_window: usize,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            classes: vec![
                QosClassConfig::realtime(),
                QosClassConfig::interactive(),
                QosClassConfig::batch(),
            ],
            fairness_window: 100,
        }
    }
}

impl QosConfig {
    pub fn class(&self, name: &str) -> Option<&QosClassConfig> {
        self.classes.iter().find(|c| c.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.classes.is_empty() {
            return Err(Error::Config("at least one QoS class is required".into()));
        }
        let mut names = HashSet::new();
        let mut total_share = 0.0;
        for class in &self.classes {
            if class.name.is_empty() || class.name.len() > 255 {
                return Err(Error::Config("QoS class names must be 1-255 bytes".into()));
            }
            if !names.insert(class.name.as_str()) {
                return Err(Error::Config(format!("duplicate QoS class '{}'", class.name)));
            }
            if class.priority_weight == 0 || class.max_concurrency == 0 || class.queue_bound == 0 {
                return Err(Error::Config(format!(
                    "QoS class '{}' needs positive weight, concurrency and queue bound",
                    class.name
                )));
            }
            if !(0.0..=1.0).contains(&class.min_share) {
                return Err(Error::Config(format!(
                    "QoS class '{}' min_share must be within [0, 1]",
                    class.name
                )));
            }
            if class.full_queue_wait_ms() > class.target_deadline_ms {
                return Err(Error::Config(format!(
                    "QoS class '{}' queue bound {} is unreachable: a full queue waits {} ms, deadline is {} ms",
                    class.name,
                    class.queue_bound,
                    class.full_queue_wait_ms(),
                    class.target_deadline_ms
                )));
            }
            total_share += class.min_share;
        }
        if total_share > 1.0 + f64::EPSILON {
            return Err(Error::Config(format!(
                "minimum shares sum to {:.2}, above 1.0",
                total_share
            )));
        }
        if self.fairness_window < self.classes.len() {
            return Err(Error::Config(
                "fairness window must cover at least one decision per class".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = QosConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.class("batch").unwrap().overflow, OverflowPolicy::Backpressure);
        assert_eq!(config.class("realtime").unwrap().service_estimate_ms, 50);
        assert_eq!(config.class("interactive").unwrap().service_estimate_ms, 150);
    }

    #[test]
    fn test_rejects_oversubscribed_shares() {
        let mut config = QosConfig::default();
        config.classes[0].min_share = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_bounds_are_reachable() {
        for class in QosConfig::default().classes {
            assert!(
                class.full_queue_wait_ms() <= class.target_deadline_ms,
                "class {} cannot fill its queue within its deadline",
                class.name
            );
        }
    }

    #[test]
    fn test_rejects_unreachable_bound() {
        let mut config = QosConfig::default();
        config.classes[2].service_estimate_ms = 500;
        config.classes[2].max_concurrency = 4;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unreachable"), "{}", err);

        config.classes[2].queue_bound = 480;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_duplicates() {
        let mut config = QosConfig::default();
        config.classes.push(QosClassConfig::batch());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_projected_completion() {
        let class = QosClassConfig::interactive();
        assert_eq!(class.projected_completion_ms(1_000, 0), 1_000);
        assert_eq!(class.projected_completion_ms(1_000, 8), 1_150);
        assert_eq!(class.projected_completion_ms(1_000, 9), 1_300);
    }

    #[test]
    fn test_overflow_policy_serde() {
        let class: QosClassConfig = serde_json::from_value(serde_json::json!({
            "name": "bulk",
            "target_deadline_ms": 1000,
            "priority_weight": 1,
            "max_concurrency": 1,
            "min_share": 0.0,
            "queue_bound": 4,
            "service_estimate_ms": 10,
            "overflow": "backpressure"
        }))
        .unwrap();
        assert_eq!(class.overflow, OverflowPolicy::Backpressure);
    }
}
