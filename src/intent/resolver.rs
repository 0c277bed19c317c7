//! Intent resolver for capability-based routing.
//!
//! Maps an intent pattern and version constraint to a ranked list of capable
//! agents. Resolution is a pure function of a [`RegistrySnapshot`]: it never
//! mutates the registry, so equal inputs always produce equal routes.

use crate::core::{Error, Result};
use crate::intent::identifier::IntentPattern;
use crate::intent::registry::{CapabilityRecord, RegistrySnapshot};
use crate::intent::version::VersionConstraint;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Weights of the composite ranking score
/// `trust * w1 - estimated_latency_ms * w2 + capacity_headroom * w3`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverWeights {
    pub trust: f64,
    /// Per millisecond of estimated latency
    pub latency: f64,
    pub headroom: f64,
}

impl Default for ResolverWeights {
    fn default() -> Self {
        Self {
            trust: 1.0,
            latency: 0.002,
            headroom: 0.5,
        }
    }
}

/// Caller-supplied QoS context for a resolution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QosHint {
    /// Requested QoS class name, informational
    pub class: Option<String>,
    /// Drop candidates whose estimated latency exceeds this budget
    pub latency_budget_ms: Option<f64>,
}

impl QosHint {
    pub fn for_class(class: &str) -> Self {
        Self {
            class: Some(class.to_string()),
            latency_budget_ms: None,
        }
    }

    pub fn with_latency_budget(mut self, budget_ms: f64) -> Self {
        self.latency_budget_ms = Some(budget_ms);
        self
    }
}

/// A candidate with its ranking score.
#[derive(Clone, Debug, PartialEq)]
pub struct RankedCandidate {
    pub record: CapabilityRecord,
    pub score: f64,
}

/// Ordered candidates for one (intent, constraint) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Route {
    pub intent: IntentPattern,
    pub constraint: VersionConstraint,
    /// Version of the snapshot this route was computed from
    pub snapshot_version: u64,
    pub candidates: Vec<RankedCandidate>,
}

impl Route {
    /// Best-ranked candidate. Routes are never empty.
    pub fn best(&self) -> &CapabilityRecord {
        &self.candidates[0].record
    }

    /// Records in rank order.
    pub fn records(&self) -> Vec<&CapabilityRecord> {
        self.candidates.iter().map(|c| &c.record).collect()
    }

    /// Agent ids in rank order.
    pub fn agent_ids(&self) -> Vec<&str> {
        self.candidates
            .iter()
            .map(|c| c.record.agent_id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Stateless resolver holding only its ranking weights.
#[derive(Clone, Debug, Default)]
pub struct IntentResolver {
    weights: ResolverWeights,
}

impl IntentResolver {
    /// Create a resolver with the given weights.
    pub fn new(weights: ResolverWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ResolverWeights {
        &self.weights
    }

    /// Composite score of a record.
    pub fn score(&self, record: &CapabilityRecord) -> f64 {
        record.trust_score * self.weights.trust
            - record.estimated_latency_ms * self.weights.latency
            + record.capacity_headroom * self.weights.headroom
    }

    /// Resolve an intent against a snapshot.
    ///
    /// 1. keep records whose advertised pattern matches `intent`,
    /// 2. keep those with a version range admitted by `constraint`,
    /// 3. drop those over the hint's latency budget,
    /// 4. rank by score, ties broken by the smallest agent id.
    pub fn resolve(
        &self,
        intent: &IntentPattern,
        constraint: &VersionConstraint,
        hint: &QosHint,
        snapshot: &RegistrySnapshot,
    ) -> Result<Route> {
        let mut candidates: Vec<RankedCandidate> = snapshot
            .records()
            .filter(|record| record.serves(intent, constraint))
            .filter(|record| match hint.latency_budget_ms {
                Some(budget) => record.estimated_latency_ms <= budget,
                None => true,
            })
            .map(|record| RankedCandidate {
                score: self.score(record),
                record: record.clone(),
            })
            .collect();

        if candidates.is_empty() {
            return Err(Error::NoCapableAgent {
                correlation_id: None,
                intent: format!("{} ({})", intent, constraint),
            });
        }

        candidates.sort_by(|a, b| rank_order(a, b));

        Ok(Route {
            intent: intent.clone(),
            constraint: constraint.clone(),
            snapshot_version: snapshot.version(),
            candidates,
        })
    }
}

/// Resolve with default weights.
pub fn resolve(
    intent: &IntentPattern,
    constraint: &VersionConstraint,
    hint: &QosHint,
    snapshot: &RegistrySnapshot,
) -> Result<Route> {
    IntentResolver::default().resolve(intent, constraint, hint, snapshot)
}

// Higher score first, then lexicographically smallest agent id.
fn rank_order(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.record.agent_id.cmp(&b.record.agent_id))
}
