//! Capability registry.
//!
//! A time-bounded index of what remote agents can serve. Writes happen on
//! advertisement, heartbeat, delivery outcome and eviction; reads take an
//! immutable, versioned [`RegistrySnapshot`] so every resolution observes one
//! consistent view.
//!
//! Trust and latency are not taken on an agent's word. A first advertisement
//! seeds trust at most at `max_advertised_trust`; after that only locally
//! observed delivery outcomes move it, and a measured round trip replaces
//! any latency the agent claims about itself.

use crate::core::{Endpoint, Error, Result, TransportKind};
use crate::intent::identifier::IntentPattern;
use crate::intent::version::{VersionConstraint, VersionRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// One (intent pattern, version range) pair an agent can serve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    pub pattern: IntentPattern,
    pub versions: VersionRange,
}

impl CapabilityEntry {
    pub fn new(pattern: IntentPattern, versions: VersionRange) -> Self {
        Self { pattern, versions }
    }

    /// Whether this entry serves `pattern` under `constraint`.
    pub fn serves(&self, pattern: &IntentPattern, constraint: &VersionConstraint) -> bool {
        self.pattern.matches(pattern) && constraint.admits(&self.versions)
    }
}

/// Registry entry describing what an agent can serve and how to reach it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    /// Agent DID
    pub agent_id: String,
    /// Served intents
    pub capabilities: Vec<CapabilityEntry>,
    /// Reachable endpoints
    pub endpoints: Vec<Endpoint>,
    /// Trust score (0.0 - 1.0)
    pub trust_score: f64,
    /// Spare capacity (0.0 = saturated, 1.0 = idle)
    pub capacity_headroom: f64,
    /// Observed round-trip estimate in milliseconds
    pub estimated_latency_ms: f64,
    /// Whether `estimated_latency_ms` comes from local measurement
    #[serde(default)]
    pub latency_measured: bool,
    /// Last advertisement or heartbeat, unix ms
    pub last_seen_ms: u64,
}

impl CapabilityRecord {
    /// Create an empty record for an agent.
    pub fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            capabilities: Vec::new(),
            endpoints: Vec::new(),
            trust_score: 0.5,
            capacity_headroom: 1.0,
            estimated_latency_ms: 0.0,
            latency_measured: false,
            last_seen_ms: 0,
        }
    }

    pub fn with_capability(mut self, pattern: IntentPattern, versions: VersionRange) -> Self {
        self.capabilities.push(CapabilityEntry::new(pattern, versions));
        self
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_trust(mut self, trust: f64) -> Self {
        self.trust_score = unit(trust);
        self
    }

    pub fn with_headroom(mut self, headroom: f64) -> Self {
        self.capacity_headroom = unit(headroom);
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.estimated_latency_ms = non_negative(latency_ms);
        self
    }

    pub fn with_last_seen(mut self, last_seen_ms: u64) -> Self {
        self.last_seen_ms = last_seen_ms;
        self
    }

    /// Whether any capability serves `pattern` under `constraint`.
    pub fn serves(&self, pattern: &IntentPattern, constraint: &VersionConstraint) -> bool {
        self.capabilities
            .iter()
            .any(|entry| entry.serves(pattern, constraint))
    }

    /// First endpoint on the given transport family.
    pub fn endpoint(&self, kind: TransportKind) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.kind == kind)
    }

    pub fn is_directly_reachable(&self) -> bool {
        self.endpoint(TransportKind::Direct).is_some()
    }

    /// Whether the record is older than `expiry_ms` at `now_ms`.
    pub fn is_expired(&self, now_ms: u64, expiry_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) > expiry_ms
    }

    fn sanitize(mut self) -> Self {
        self.trust_score = unit(self.trust_score);
        self.capacity_headroom = unit(self.capacity_headroom);
        self.estimated_latency_ms = non_negative(self.estimated_latency_ms);
        self
    }
}

/// Payload of an `Advertise` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityAdvertisement {
    pub agent_id: String,
    pub capabilities: Vec<CapabilityEntry>,
    pub endpoints: Vec<Endpoint>,
    pub trust_score: f64,
    pub capacity_headroom: f64,
    pub estimated_latency_ms: f64,
}

impl CapabilityAdvertisement {
    /// Advertisement describing `record` (its timestamp is dropped).
    pub fn from_record(record: &CapabilityRecord) -> Self {
        Self {
            agent_id: record.agent_id.clone(),
            capabilities: record.capabilities.clone(),
            endpoints: record.endpoints.clone(),
            trust_score: record.trust_score,
            capacity_headroom: record.capacity_headroom,
            estimated_latency_ms: record.estimated_latency_ms,
        }
    }

    pub fn into_record(self, now_ms: u64) -> CapabilityRecord {
        CapabilityRecord {
            agent_id: self.agent_id,
            capabilities: self.capabilities,
            endpoints: self.endpoints,
            trust_score: self.trust_score,
            capacity_headroom: self.capacity_headroom,
            estimated_latency_ms: self.estimated_latency_ms,
            latency_measured: false,
            last_seen_ms: now_ms,
        }
        .sanitize()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::malformed(format!("bad advertisement: {}", e)))
    }
}

/// Payload of an `Observe`/`Heartbeat` envelope: a liveness refresh with
/// optional load updates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityObservation {
    pub agent_id: String,
    pub capacity_headroom: Option<f64>,
    pub estimated_latency_ms: Option<f64>,
}

impl CapabilityObservation {
    pub fn heartbeat(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            capacity_headroom: None,
            estimated_latency_ms: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::malformed(format!("bad observation: {}", e)))
    }
}

/// Locally observed result of one delivery attempt to an agent.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { round_trip_ms: f64 },
    Failed,
}

/// Registry configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Records not refreshed within this window are evicted
    pub expiry_ms: u64,
    /// Hard cap on records; the stalest is evicted beyond it
    pub max_records: usize,
    /// Ceiling on the trust an agent can claim for itself
    pub max_advertised_trust: f64,
    /// Weight of each new delivery outcome in the trust and latency averages
    pub outcome_weight: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 30_000,
            max_records: 10_000,
            max_advertised_trust: 0.5,
            outcome_weight: 0.2,
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_records == 0 {
            return Err(Error::Config("registry max_records must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.max_advertised_trust) {
            return Err(Error::Config(
                "registry max_advertised_trust must be within [0, 1]".into(),
            ));
        }
        if !(self.outcome_weight > 0.0 && self.outcome_weight <= 1.0) {
            return Err(Error::Config(
                "registry outcome_weight must be within (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Immutable view of the registry at one version.
#[derive(Clone, Debug, Default)]
pub struct RegistrySnapshot {
    version: u64,
    records: BTreeMap<String, CapabilityRecord>,
}

impl RegistrySnapshot {
    /// Build a snapshot directly, e.g. to inject a fixed view into resolution.
    pub fn from_records(version: u64, records: impl IntoIterator<Item = CapabilityRecord>) -> Self {
        Self {
            version,
            records: records
                .into_iter()
                .map(|r| (r.agent_id.clone(), r.sanitize()))
                .collect(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Records ordered by agent id.
    pub fn records(&self) -> impl Iterator<Item = &CapabilityRecord> {
        self.records.values()
    }

    pub fn get(&self, agent_id: &str) -> Option<&CapabilityRecord> {
        self.records.get(agent_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Concurrent capability registry with copy-on-write snapshots.
pub struct CapabilityRegistry {
    config: RegistryConfig,
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            current: RwLock::new(Arc::new(RegistrySnapshot::default())),
        }
    }

    /// Current consistent snapshot. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&current)
    }

    /// Insert or replace a record from an advertisement. Returns `true` when
    /// the agent was not previously known.
    ///
    /// Claimed trust is capped for a new agent and ignored for a known one;
    /// a measured latency survives re-advertisement.
    pub fn apply_advertisement(&self, advertisement: CapabilityAdvertisement, now_ms: u64) -> bool {
        let mut record = advertisement.into_record(now_ms);
        record.trust_score = record.trust_score.min(self.config.max_advertised_trust);
        let agent_id = record.agent_id.clone();
        self.update(|snapshot| {
            if let Some(known) = snapshot.records.get(&agent_id) {
                record.trust_score = known.trust_score;
                if known.latency_measured {
                    record.estimated_latency_ms = known.estimated_latency_ms;
                    record.latency_measured = true;
                }
            }
            let inserted = snapshot.records.insert(agent_id.clone(), record).is_none();
            while snapshot.records.len() > self.config.max_records {
                let stalest = snapshot
                    .records
                    .values()
                    .filter(|r| r.agent_id != agent_id)
                    .min_by(|a, b| {
                        a.last_seen_ms
                            .cmp(&b.last_seen_ms)
                            .then_with(|| a.agent_id.cmp(&b.agent_id))
                    })
                    .map(|r| r.agent_id.clone());
                match stalest {
                    Some(id) => {
                        debug!(agent = %id, "registry full, evicting stalest record");
                        snapshot.records.remove(&id);
                    }
                    None => break,
                }
            }
            inserted
        })
    }

    /// Refresh liveness for a known agent. Unknown agents are ignored and
    /// `false` is returned: a heartbeat never creates a record.
    pub fn heartbeat(&self, observation: &CapabilityObservation, now_ms: u64) -> bool {
        if self.snapshot().get(&observation.agent_id).is_none() {
            return false;
        }
        self.update(|snapshot| match snapshot.records.get_mut(&observation.agent_id) {
            Some(record) => {
                record.last_seen_ms = record.last_seen_ms.max(now_ms);
                if let Some(headroom) = observation.capacity_headroom {
                    record.capacity_headroom = unit(headroom);
                }
                match observation.estimated_latency_ms {
                    Some(latency) if !record.latency_measured => {
                        record.estimated_latency_ms = non_negative(latency);
                    }
                    _ => {}
                }
                true
            }
            None => false,
        })
    }

    /// Fold a delivery outcome into the agent's trust and, when measured,
    /// its latency. Returns `false` for an unknown agent.
    pub fn record_outcome(&self, agent_id: &str, outcome: DeliveryOutcome) -> bool {
        if self.snapshot().get(agent_id).is_none() {
            return false;
        }
        let weight = self.config.outcome_weight;
        self.update(|snapshot| match snapshot.records.get_mut(agent_id) {
            Some(record) => {
                let target = match outcome {
                    DeliveryOutcome::Delivered { round_trip_ms } => {
                        let sample = non_negative(round_trip_ms);
                        record.estimated_latency_ms = if record.latency_measured {
                            record.estimated_latency_ms + weight * (sample - record.estimated_latency_ms)
                        } else {
                            sample
                        };
                        record.latency_measured = true;
                        1.0
                    }
                    DeliveryOutcome::Failed => 0.0,
                };
                record.trust_score = unit(record.trust_score + weight * (target - record.trust_score));
                true
            }
            None => false,
        })
    }

    /// Drop every record whose last-seen exceeds the expiry window.
    pub fn evict_expired(&self, now_ms: u64) -> Vec<String> {
        let expiry = self.config.expiry_ms;
        let has_expired = self
            .snapshot()
            .records()
            .any(|r| r.is_expired(now_ms, expiry));
        if !has_expired {
            return Vec::new();
        }
        let evicted = self.update(|snapshot| {
            let expired: Vec<String> = snapshot
                .records
                .values()
                .filter(|r| r.is_expired(now_ms, expiry))
                .map(|r| r.agent_id.clone())
                .collect();
            for id in &expired {
                snapshot.records.remove(id);
            }
            expired
        });
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted expired capability records");
        }
        evicted
    }

    /// Remove an agent explicitly.
    pub fn remove(&self, agent_id: &str) -> Option<CapabilityRecord> {
        self.snapshot().get(agent_id)?;
        self.update(|snapshot| snapshot.records.remove(agent_id))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Single-writer mutation: holds the write lock, clones the snapshot only
    /// if readers still hold it, and bumps the version.
    fn update<T>(&self, f: impl FnOnce(&mut RegistrySnapshot) -> T) -> T {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let snapshot = Arc::make_mut(&mut current);
        let out = f(snapshot);
        snapshot.version += 1;
        out
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

fn unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.max(0.0)
    }
}
