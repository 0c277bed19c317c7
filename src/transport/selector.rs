//! Transport selection policy.
//!
//! Selection is a pure function of the candidate's reachability, the QoS
//! tier, the security requirement and the peer's announced transport
//! preference; it never touches the network.

use crate::core::{Endpoint, Error, Result, TransportHint, TransportKind};
use crate::envelope::EnvelopeFlags;
use crate::intent::CapabilityRecord;
use serde::{Deserialize, Serialize};

/// Latency tier derived from the QoS class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QosTier {
    Realtime,
    Interactive,
    Bulk,
}

impl QosTier {
    pub fn from_class(class: &str) -> Self {
        match class {
            "realtime" => QosTier::Realtime,
            "interactive" => QosTier::Interactive,
            _ => QosTier::Bulk,
        }
    }

    pub fn is_latency_sensitive(self) -> bool {
        matches!(self, QosTier::Realtime | QosTier::Interactive)
    }
}

/// What the sender requires from the path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SecurityRequirement {
    /// Hide the sender from the receiver's network view
    pub anonymous: bool,
    /// Survive single-path failures
    pub resilient: bool,
}

impl SecurityRequirement {
    pub fn from_flags(flags: EnvelopeFlags) -> Self {
        Self {
            anonymous: flags.contains(EnvelopeFlags::ANONYMOUS),
            resilient: flags.contains(EnvelopeFlags::RESILIENT),
        }
    }
}

/// Inputs of one selection.
#[derive(Clone, Copy, Debug)]
pub struct SelectionContext<'a> {
    pub candidate: &'a CapabilityRecord,
    pub tier: QosTier,
    pub security: SecurityRequirement,
    /// Wildcard or broadcast intent
    pub broadcast: bool,
    /// Preference the peer announced when it opened a session with us
    pub hint: TransportHint,
}

impl<'a> SelectionContext<'a> {
    pub fn new(candidate: &'a CapabilityRecord, class: &str) -> Self {
        Self {
            candidate,
            tier: QosTier::from_class(class),
            security: SecurityRequirement::default(),
            broadcast: false,
            hint: TransportHint::Dual,
        }
    }

    pub fn with_hint(mut self, hint: TransportHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn with_security(mut self, security: SecurityRequirement) -> Self {
        self.security = security;
        self
    }

    pub fn with_broadcast(mut self, broadcast: bool) -> Self {
        self.broadcast = broadcast;
        self
    }
}

/// A chosen path to a peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransportHandle {
    pub peer: String,
    pub endpoint: Endpoint,
}

impl TransportHandle {
    pub fn new(peer: &str, endpoint: Endpoint) -> Self {
        Self {
            peer: peer.to_string(),
            endpoint,
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.endpoint.kind
    }
}

/// Ranks the paths to a candidate, best first.
pub trait SelectionPolicy: Send + Sync {
    fn rank(&self, ctx: &SelectionContext<'_>) -> Vec<TransportHandle>;
}

/// Direct first for latency-sensitive traffic to directly reachable peers;
/// overlay first for bulk traffic, broadcast and anonymity or resilience
/// requirements. Anonymous and broadcast traffic never goes direct. Otherwise
/// a peer's own transport preference decides, unless the sender requires
/// resilience.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSelectionPolicy;

impl SelectionPolicy for DefaultSelectionPolicy {
    fn rank(&self, ctx: &SelectionContext<'_>) -> Vec<TransportHandle> {
        let record = ctx.candidate;
        let direct = record.endpoint(TransportKind::Direct);
        let overlay = record.endpoint(TransportKind::Overlay);

        let order: [Option<&Endpoint>; 2] = if ctx.broadcast || ctx.security.anonymous {
            [overlay, None]
        } else if ctx.security.resilient {
            [overlay, direct]
        } else {
            match ctx.hint.preferred() {
                Some(TransportKind::Direct) => [direct, overlay],
                Some(TransportKind::Overlay) => [overlay, direct],
                None if ctx.tier.is_latency_sensitive() => [direct, overlay],
                None => [overlay, direct],
            }
        };

        order
            .into_iter()
            .flatten()
            .map(|endpoint| TransportHandle::new(&record.agent_id, endpoint.clone()))
            .collect()
    }
}

/// Best path under `policy`, failing with `TransportUnavailable` when the
/// candidate has no usable endpoint.
pub fn select_transport(policy: &dyn SelectionPolicy, ctx: &SelectionContext<'_>) -> Result<TransportHandle> {
    policy.rank(ctx).into_iter().next().ok_or_else(|| {
        Error::unavailable(format!(
            "no usable endpoint for {}",
            ctx.candidate.agent_id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both() -> CapabilityRecord {
        CapabilityRecord::new("did:iicp:0000000000000001")
            .with_endpoint(Endpoint::direct("10.0.0.1:7400"))
            .with_endpoint(Endpoint::overlay("topic/a"))
    }

    fn kinds(policy: &DefaultSelectionPolicy, ctx: SelectionContext<'_>) -> Vec<TransportKind> {
        policy.rank(&ctx).iter().map(|h| h.kind()).collect()
    }

    #[test]
    fn test_direct_preferred_for_interactive() {
        let record = both();
        let ranked = kinds(&DefaultSelectionPolicy, SelectionContext::new(&record, "interactive"));
        assert_eq!(ranked, vec![TransportKind::Direct, TransportKind::Overlay]);
        let ranked = kinds(&DefaultSelectionPolicy, SelectionContext::new(&record, "realtime"));
        assert_eq!(ranked[0], TransportKind::Direct);
    }

    #[test]
    fn test_overlay_when_direct_unreachable() {
        let record = CapabilityRecord::new("did:iicp:0000000000000002")
            .with_endpoint(Endpoint::overlay("topic/b"));
        let handle =
            select_transport(&DefaultSelectionPolicy, &SelectionContext::new(&record, "realtime")).unwrap();
        assert_eq!(handle.kind(), TransportKind::Overlay);
    }

    #[test]
    fn test_broadcast_and_anonymous_stay_on_overlay() {
        let record = both();
        let ctx = SelectionContext::new(&record, "realtime").with_broadcast(true);
        assert_eq!(kinds(&DefaultSelectionPolicy, ctx), vec![TransportKind::Overlay]);

        let ctx = SelectionContext::new(&record, "realtime").with_security(
            SecurityRequirement::from_flags(EnvelopeFlags::ANONYMOUS),
        );
        assert_eq!(kinds(&DefaultSelectionPolicy, ctx), vec![TransportKind::Overlay]);
    }

    #[test]
    fn test_resilient_and_bulk_prefer_overlay() {
        let record = both();
        let ctx = SelectionContext::new(&record, "interactive")
            .with_security(SecurityRequirement { anonymous: false, resilient: true });
        assert_eq!(
            kinds(&DefaultSelectionPolicy, ctx),
            vec![TransportKind::Overlay, TransportKind::Direct]
        );
        let ctx = SelectionContext::new(&record, "batch");
        assert_eq!(kinds(&DefaultSelectionPolicy, ctx)[0], TransportKind::Overlay);
    }

    #[test]
    fn test_peer_hint_reorders_paths() {
        let record = both();
        let ctx = SelectionContext::new(&record, "interactive").with_hint(TransportHint::Overlay);
        assert_eq!(
            kinds(&DefaultSelectionPolicy, ctx),
            vec![TransportKind::Overlay, TransportKind::Direct]
        );
        let ctx = SelectionContext::new(&record, "batch").with_hint(TransportHint::Direct);
        assert_eq!(kinds(&DefaultSelectionPolicy, ctx)[0], TransportKind::Direct);

        // Sender requirements still win.
        let ctx = SelectionContext::new(&record, "batch")
            .with_hint(TransportHint::Direct)
            .with_security(SecurityRequirement { anonymous: false, resilient: true });
        assert_eq!(kinds(&DefaultSelectionPolicy, ctx)[0], TransportKind::Overlay);
        let ctx = SelectionContext::new(&record, "realtime")
            .with_hint(TransportHint::Direct)
            .with_broadcast(true);
        assert_eq!(kinds(&DefaultSelectionPolicy, ctx), vec![TransportKind::Overlay]);
    }

    #[test]
    fn test_no_endpoints() {
        let record = CapabilityRecord::new("did:iicp:0000000000000003");
        let err = select_transport(&DefaultSelectionPolicy, &SelectionContext::new(&record, "batch"))
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
