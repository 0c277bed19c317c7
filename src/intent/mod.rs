//! Intent Resolver.
//!
//! Parses intent identifiers, keeps the capability registry of known agents
//! and resolves an intent plus version constraint to ranked candidates.

pub mod identifier;
pub mod registry;
pub mod resolver;
pub mod version;

pub use identifier::{parse_version_lenient, IntentIdentifier, IntentPattern, WILDCARD};
pub use registry::{
    CapabilityAdvertisement, CapabilityEntry, CapabilityObservation, CapabilityRecord,
    CapabilityRegistry, DeliveryOutcome, RegistryConfig, RegistrySnapshot,
};
pub use resolver::{resolve, IntentResolver, QosHint, RankedCandidate, ResolverWeights, Route};
pub use version::{VersionConstraint, VersionRange};
