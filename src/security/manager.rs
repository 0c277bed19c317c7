//! Security/Identity Manager.
//!
//! Owns the local identity, runs handshakes, signs every outbound envelope
//! and verifies, replay-checks and session-checks every inbound one.
//! Sessions live in a sharded map so unrelated sessions never contend on a
//! single lock.

use crate::core::{now_millis, Endpoint, Error, Result, SessionId, TransportHint};
use crate::envelope::{codec, Envelope, EnvelopeHeader, MessageType, SecurityTrailer};
use crate::security::crypto::{random_nonce, verify};
use crate::security::handshake::{transcript, HandshakeAccept, HandshakeOffer, SUPPORTED_SCHEME};
use crate::security::identity::{AgentIdentity, KeyResolver};
use crate::security::replay::{CorrelationCache, ReplayScope, SequenceWindow};
use crate::security::session::{Session, SessionRole, SessionState};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Security configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Upper bound for a complete handshake round trip
    pub handshake_timeout_ms: u64,
    /// Idle time after which an established session expires
    pub session_lease_ms: u64,
    /// How long correlation ids are remembered
    pub correlation_ttl_ms: u64,
    /// Hard cap on remembered correlation ids
    pub correlation_capacity: usize,
    /// Accepted age of a handshake offer
    pub max_clock_skew_ms: u64,
    /// How long closed/expired session ids are remembered
    pub tombstone_retention_ms: u64,
    /// Transport this node asks peers to reach it through
    pub transport_hint: TransportHint,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            session_lease_ms: 300_000,
            correlation_ttl_ms: 120_000,
            correlation_capacity: 65_536,
            max_clock_skew_ms: 30_000,
            tombstone_retention_ms: 600_000,
            transport_hint: TransportHint::Dual,
        }
    }
}

/// Carries a handshake offer to the remote side and returns its answer.
#[async_trait]
pub trait HandshakeExchange: Send + Sync {
    async fn exchange(&self, offer: HandshakeOffer) -> Result<HandshakeAccept>;
}

/// A signed envelope and its wire frame.
#[derive(Clone, Debug)]
pub struct Sealed {
    pub envelope: Envelope,
    pub frame: Vec<u8>,
}

/// Replay window of one session-less signer.
#[derive(Debug, Default)]
struct SignerWindow {
    window: SequenceWindow,
    last_seen_ms: u64,
}

/// Security/Identity Manager.
pub struct SecurityManager {
    identity: AgentIdentity,
    resolver: Arc<dyn KeyResolver>,
    config: SecurityConfig,
    sessions: DashMap<SessionId, Session>,
    /// Remote DID to its most recent established session
    peers: DashMap<String, SessionId>,
    /// Retired session ids with their final state and retirement time
    tombstones: DashMap<SessionId, (SessionState, u64)>,
    /// Per-signer windows for session-less traffic
    signer_windows: DashMap<String, SignerWindow>,
    /// Session-less sequence space, seeded from the clock so a restarted
    /// identity starts above anything it sent before
    broadcast_sequence: AtomicU64,
    correlations: Mutex<CorrelationCache>,
}

impl SecurityManager {
    pub fn new(
        identity: AgentIdentity,
        resolver: Arc<dyn KeyResolver>,
        config: SecurityConfig,
    ) -> Self {
        let correlations =
            CorrelationCache::new(config.correlation_ttl_ms, config.correlation_capacity);
        Self {
            identity,
            resolver,
            config,
            sessions: DashMap::new(),
            peers: DashMap::new(),
            tombstones: DashMap::new(),
            signer_windows: DashMap::new(),
            broadcast_sequence: AtomicU64::new(session_less_seed(now_millis())),
            correlations: Mutex::new(correlations),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn did(&self) -> &str {
        self.identity.did()
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Start a handshake towards `remote_did`: creates a `HANDSHAKING`
    /// session and returns the signed offer to send.
    pub fn initiate(
        &self,
        remote_did: &str,
        reply_endpoint: Option<Endpoint>,
        now_ms: u64,
    ) -> Result<HandshakeOffer> {
        let id = SessionId::new();
        let mut session = Session::new(
            id,
            SessionRole::Initiator,
            self.did(),
            remote_did,
            SUPPORTED_SCHEME,
            self.config.session_lease_ms,
            now_ms,
        );
        session.transition(SessionState::Handshaking)?;
        session.local_nonce = random_nonce();
        let offer = HandshakeOffer::signed(
            &self.identity,
            id,
            remote_did,
            session.local_nonce,
            reply_endpoint,
            now_ms,
        )?
        .with_transport_hint(&self.identity, self.config.transport_hint)?;
        self.sessions.insert(id, session);
        debug!(session = %id, peer = %remote_did, "handshake initiated");
        Ok(offer)
    }

    /// Responder side: verify an offer and establish the session.
    pub fn accept(
        &self,
        offer: &HandshakeOffer,
        reply_endpoint: Option<Endpoint>,
        now_ms: u64,
    ) -> Result<HandshakeAccept> {
        if offer.responder_did != self.did() {
            return Err(Error::auth(format!(
                "handshake addressed to {}, not {}",
                offer.responder_did,
                self.did()
            )));
        }
        if offer.timestamp_ms.saturating_add(self.config.max_clock_skew_ms) < now_ms {
            return Err(Error::auth("stale handshake offer"));
        }
        if self.sessions.contains_key(&offer.session_id)
            || self.tombstones.contains_key(&offer.session_id)
        {
            return Err(Error::auth(format!(
                "session id {} already used",
                offer.session_id
            )));
        }
        let version = offer.negotiate_version()?;
        let key = offer.verify(self.resolver.as_ref())?;

        let mut session = Session::new(
            offer.session_id,
            SessionRole::Responder,
            self.did(),
            &offer.initiator_did,
            &offer.scheme,
            self.config.session_lease_ms,
            now_ms,
        );
        session.transition(SessionState::Handshaking)?;
        session.local_nonce = random_nonce();
        let accept =
            HandshakeAccept::signed(&self.identity, offer, session.local_nonce, reply_endpoint)?;
        session.remote_key = Some(key);
        session.remote_endpoint = offer.reply_endpoint.clone();
        session.protocol_version = version;
        session.transport_hint = offer.transport_hint;
        session.transcript = transcript(
            offer.session_id,
            &offer.initiator_did,
            self.did(),
            &offer.nonce,
            &session.local_nonce,
        );
        session.transition(SessionState::Established)?;
        self.install(session);
        Ok(accept)
    }

    /// Initiator side: verify the answer and establish the session. A failed
    /// verification aborts the pending handshake.
    pub fn complete(&self, accept: &HandshakeAccept, now_ms: u64) -> Result<SessionId> {
        let result = self.try_complete(accept, now_ms);
        if result.is_err() {
            self.abort(accept.session_id, now_ms);
        }
        result
    }

    fn try_complete(&self, accept: &HandshakeAccept, now_ms: u64) -> Result<SessionId> {
        let id = accept.session_id;
        let remote_did = {
            let Some(mut entry) = self.sessions.get_mut(&id) else {
                return Err(Error::auth(format!("no pending handshake for {}", id)));
            };
            let session = entry.value_mut();
            if session.state() != SessionState::Handshaking || session.role != SessionRole::Initiator
            {
                return Err(Error::auth(format!("unexpected handshake answer for {}", id)));
            }
            if accept.responder_did != session.remote_did {
                return Err(Error::auth(format!(
                    "expected {}, answered by {}",
                    session.remote_did, accept.responder_did
                )));
            }
            if accept.initiator_nonce != session.local_nonce {
                return Err(Error::auth("handshake nonce mismatch"));
            }
            let key = accept.verify(self.resolver.as_ref())?;
            session.remote_key = Some(key);
            session.remote_endpoint = accept.reply_endpoint.clone();
            session.protocol_version = accept.version;
            session.transcript = transcript(
                id,
                &session.local_did,
                &session.remote_did,
                &session.local_nonce,
                &accept.nonce,
            );
            session.transition(SessionState::Established)?;
            session.touch(now_ms);
            session.remote_did.clone()
        };
        info!(session = %id, peer = %remote_did, "session established");
        self.peers.insert(remote_did, id);
        Ok(id)
    }

    /// Full initiator handshake bounded by the configured timeout. Reuses a
    /// live session to the same peer.
    pub async fn handshake(
        &self,
        remote_did: &str,
        reply_endpoint: Option<Endpoint>,
        exchange: &dyn HandshakeExchange,
    ) -> Result<SessionId> {
        if let Some(id) = self.session_for_peer(remote_did) {
            return Ok(id);
        }
        let offer = self.initiate(remote_did, reply_endpoint, now_millis())?;
        let id = offer.session_id;
        let timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let accept = match tokio::time::timeout(timeout, exchange.exchange(offer)).await {
            Ok(Ok(accept)) => accept,
            Ok(Err(e)) => {
                self.abort(id, now_millis());
                return Err(e);
            }
            Err(_) => {
                warn!(session = %id, peer = %remote_did, "handshake timed out");
                self.abort(id, now_millis());
                return Err(Error::auth(format!(
                    "handshake with {} timed out after {} ms",
                    remote_did, self.config.handshake_timeout_ms
                )));
            }
        };
        self.complete(&accept, now_millis())
    }

    /// Sign an envelope inside an established session.
    pub fn seal(&self, mut envelope: Envelope, session_id: SessionId, now_ms: u64) -> Result<Sealed> {
        let correlation_id = envelope.correlation_id();
        let outcome = {
            let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                return Err(self.missing_session(session_id).with_correlation(correlation_id));
            };
            let session = entry.value_mut();
            session.require_established(now_ms).map(|_| {
                session.touch(now_ms);
                session.next_sequence()
            })
        };
        let sequence = match outcome {
            Ok(sequence) => sequence,
            Err(e) => {
                self.retire_if_expired(session_id, now_ms);
                return Err(e.with_correlation(correlation_id));
            }
        };
        envelope.header.session_id = session_id;
        envelope.header.sequence = sequence;
        self.sign(envelope)
    }

    /// Sign session-less traffic (handshakes, advertisements, heartbeats and
    /// broadcasts) in this signer's own sequence space.
    pub fn seal_session_less(&self, mut envelope: Envelope) -> Result<Sealed> {
        if envelope.header.message_type.requires_session() && !envelope.header.is_broadcast() {
            return Err(Error::InvalidSessionState {
                correlation_id: Some(envelope.correlation_id()),
                session: SessionId::nil(),
                state: format!("NONE ({} requires a session)", envelope.header.message_type),
            });
        }
        envelope.header.session_id = SessionId::nil();
        envelope.header.sequence = self.broadcast_sequence.fetch_add(1, Ordering::SeqCst);
        self.sign(envelope)
    }

    fn sign(&self, mut envelope: Envelope) -> Result<Sealed> {
        let signed = envelope.signing_bytes()?;
        envelope.trailer = SecurityTrailer {
            key_id: self.did().to_string(),
            signature: self.identity.sign(&signed),
            encrypted_key: envelope.trailer.encrypted_key.take(),
        };
        let frame = codec::assemble(&signed, &envelope.trailer)?;
        Ok(Sealed { envelope, frame })
    }

    /// Verify and admit an inbound frame.
    ///
    /// The signature over the raw signed region is checked against the
    /// independently resolved key of the signer before any header field is
    /// decoded, then expiry, session state, sequence window and correlation
    /// uniqueness are enforced. Nothing is returned unless every check passes.
    pub fn open(&self, frame: &[u8], now_ms: u64) -> Result<Envelope> {
        let split = codec::split_frame(frame)?;
        if !split.trailer.is_signed() {
            return Err(Error::auth("unsigned envelope"));
        }
        let key = self.resolver.resolve_key(&split.trailer.key_id)?;
        verify(&key, split.signed, &split.trailer.signature)?;

        let (header, payload) = codec::decode_signed(split.signed)?;
        let correlation_id = header.correlation_id;
        let envelope = Envelope {
            header,
            payload,
            trailer: split.trailer,
        };
        self.admit_inbound(&envelope, now_ms)
            .map_err(|e| e.with_correlation(correlation_id))?;
        Ok(envelope)
    }

    fn admit_inbound(&self, envelope: &Envelope, now_ms: u64) -> Result<()> {
        let header = &envelope.header;
        let signer = &envelope.trailer.key_id;
        if header.is_expired(now_ms) {
            return Err(Error::DeadlineExceeded {
                correlation_id: None,
                class: header.qos_class.clone(),
                reason: "expired in transit".to_string(),
            });
        }

        let scope = if header.session_id.is_nil() {
            if header.message_type.requires_session() && !header.is_broadcast() {
                return Err(Error::InvalidSessionState {
                    correlation_id: None,
                    session: SessionId::nil(),
                    state: format!("NONE ({} requires a session)", header.message_type),
                });
            }
            self.check_replay_horizon(header, now_ms)?;
            let fresh = {
                let mut entry = self.signer_windows.entry(signer.clone()).or_default();
                let fresh = entry.window.accept(header.sequence);
                if fresh {
                    entry.last_seen_ms = entry.last_seen_ms.max(now_ms);
                }
                fresh
            };
            if !fresh {
                return Err(replay(header));
            }
            ReplayScope::Signer(signer.clone())
        } else {
            let id = header.session_id;
            let outcome = {
                let Some(mut entry) = self.sessions.get_mut(&id) else {
                    return Err(self.missing_session(id));
                };
                check_session(entry.value_mut(), signer, header, now_ms)
            };
            if let Err(e) = outcome {
                self.retire_if_expired(id, now_ms);
                return Err(e);
            }
            ReplayScope::Session(id)
        };

        let fresh = self
            .correlations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(scope, header.message_type.code(), header.correlation_id, now_ms);
        if !fresh {
            return Err(replay(header));
        }

        if header.message_type == MessageType::Close && !header.session_id.is_nil() {
            self.close(header.session_id, now_ms)?;
        }
        Ok(())
    }

    /// Session-less frames carry no session to bind them, so they are only
    /// admitted while their signer's window is guaranteed to be retained.
    fn check_replay_horizon(&self, header: &EnvelopeHeader, now_ms: u64) -> Result<()> {
        if header.timestamp_ms.saturating_add(self.config.correlation_ttl_ms) < now_ms {
            return Err(Error::DeadlineExceeded {
                correlation_id: None,
                class: header.qos_class.clone(),
                reason: "older than the replay horizon".to_string(),
            });
        }
        if header.timestamp_ms > now_ms.saturating_add(self.config.max_clock_skew_ms) {
            return Err(Error::auth(format!(
                "{} timestamp is {} ms ahead",
                header.message_type,
                header.timestamp_ms - now_ms
            )));
        }
        Ok(())
    }

    /// Close a session locally: `ESTABLISHED -> CLOSING -> CLOSED`. The id
    /// is tombstoned and never accepted again.
    pub fn close(&self, session_id: SessionId, now_ms: u64) -> Result<()> {
        {
            let Some(mut entry) = self.sessions.get_mut(&session_id) else {
                return Err(self.missing_session(session_id));
            };
            let session = entry.value_mut();
            if session.state() == SessionState::Handshaking {
                session.transition(SessionState::Closed)?;
            } else {
                session.transition(SessionState::Closing)?;
                session.transition(SessionState::Closed)?;
            }
        }
        info!(session = %session_id, "session closed");
        self.retire(session_id, now_ms);
        Ok(())
    }

    /// Expire idle sessions and abandoned handshakes, and forget session-less
    /// signers quiet for longer than the replay horizon. Returns retired ids.
    pub fn expire_idle(&self, now_ms: u64) -> Vec<SessionId> {
        let handshake_deadline = self.config.handshake_timeout_ms;
        let mut retired = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            let next = match session.state() {
                SessionState::Established if session.is_lease_expired(now_ms) => {
                    Some(SessionState::Expired)
                }
                SessionState::Handshaking
                    if now_ms.saturating_sub(session.created_ms) > handshake_deadline =>
                {
                    Some(SessionState::Closed)
                }
                _ => None,
            };
            if let Some(next) = next {
                if session.transition(next).is_ok() {
                    retired.push(session.id);
                }
            }
        }
        for id in &retired {
            debug!(session = %id, "session retired on idle");
            self.retire(*id, now_ms);
        }
        let retention = self.config.tombstone_retention_ms;
        self.tombstones
            .retain(|_, (_, at)| now_ms.saturating_sub(*at) <= retention);
        let horizon = self.signer_horizon_ms();
        self.signer_windows
            .retain(|_, w| now_ms.saturating_sub(w.last_seen_ms) <= horizon);
        retired
    }

    /// Live established session to `remote_did`, if any.
    pub fn session_for_peer(&self, remote_did: &str) -> Option<SessionId> {
        let id = *self.peers.get(remote_did)?;
        let live = self
            .sessions
            .get(&id)
            .map(|s| s.state() == SessionState::Established && !s.is_lease_expired(now_millis()))
            .unwrap_or(false);
        if live {
            Some(id)
        } else {
            self.peers.remove_if(remote_did, |_, current| *current == id);
            None
        }
    }

    /// Transport preference of `remote_did` from the handshake it opened.
    pub fn transport_hint_for(&self, remote_did: &str) -> TransportHint {
        let Some(id) = self.peers.get(remote_did).map(|id| *id) else {
            return TransportHint::Dual;
        };
        self.sessions
            .get(&id)
            .map(|s| s.transport_hint)
            .unwrap_or_default()
    }

    /// Current state, including retired sessions still tombstoned.
    pub fn session_state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions
            .get(&id)
            .map(|s| s.state())
            .or_else(|| self.tombstones.get(&id).map(|t| t.0))
    }

    /// Copy of a live session.
    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session-less signers currently tracked for replay.
    pub fn signer_count(&self) -> usize {
        self.signer_windows.len()
    }

    /// How long a quiet signer's window is kept.
    fn signer_horizon_ms(&self) -> u64 {
        self.config
            .correlation_ttl_ms
            .saturating_add(self.config.max_clock_skew_ms)
    }

    fn install(&self, session: Session) {
        info!(session = %session.id, peer = %session.remote_did, "session established");
        self.peers.insert(session.remote_did.clone(), session.id);
        self.sessions.insert(session.id, session);
    }

    fn abort(&self, id: SessionId, now_ms: u64) {
        let aborted = self
            .sessions
            .get_mut(&id)
            .map(|mut s| {
                s.state() == SessionState::Handshaking && s.transition(SessionState::Closed).is_ok()
            })
            .unwrap_or(false);
        if aborted {
            debug!(session = %id, "handshake aborted");
            self.retire(id, now_ms);
        }
    }

    fn retire_if_expired(&self, id: SessionId, now_ms: u64) {
        if self.sessions.get(&id).map(|s| s.state()) == Some(SessionState::Expired) {
            info!(session = %id, "session lease expired");
            self.retire(id, now_ms);
        }
    }

    fn retire(&self, id: SessionId, now_ms: u64) {
        if let Some((_, session)) = self.sessions.remove(&id) {
            self.peers
                .remove_if(&session.remote_did, |_, current| *current == id);
            self.tombstones.insert(id, (session.state(), now_ms));
            self.correlations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .forget_scope(&ReplayScope::Session(id));
        }
    }

    fn missing_session(&self, id: SessionId) -> Error {
        let state = self
            .tombstones
            .get(&id)
            .map(|t| t.0.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        Error::InvalidSessionState {
            correlation_id: None,
            session: id,
            state,
        }
    }
}

#[async_trait]
impl HandshakeExchange for SecurityManager {
    async fn exchange(&self, offer: HandshakeOffer) -> Result<HandshakeAccept> {
        self.accept(&offer, None, now_millis())
    }
}

fn check_session(
    session: &mut Session,
    signer: &str,
    header: &EnvelopeHeader,
    now_ms: u64,
) -> Result<()> {
    if session.remote_did != signer {
        return Err(Error::auth(format!(
            "{} signed traffic for a session with {}",
            signer, session.remote_did
        )));
    }
    session.require_established(now_ms)?;
    if !session.accept_sequence(header.sequence) {
        return Err(replay(header));
    }
    session.touch(now_ms);
    Ok(())
}

/// First session-less sequence number: unix ms in the high bits leaves 2^16
/// numbers per millisecond of uptime before a restart could overlap.
fn session_less_seed(now_ms: u64) -> u64 {
    now_ms.saturating_mul(1 << 16).max(1)
}

fn replay(header: &EnvelopeHeader) -> Error {
    Error::ReplayDetected {
        correlation_id: Some(header.correlation_id),
        session: header.session_id,
        sequence: header.sequence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::envelope::{EnvelopeFlags, PREFIX_LEN};
    use crate::security::handshake::MAX_PROTOCOL_VERSION;
    use crate::security::identity::DidDirectory;

    fn pair_with(config: SecurityConfig) -> (SecurityManager, SecurityManager) {
        let a = AgentIdentity::generate();
        let b = AgentIdentity::generate();
        let directory = Arc::new(DidDirectory::new());
        directory.register(a.document()).unwrap();
        directory.register(b.document()).unwrap();
        (
            SecurityManager::new(a, directory.clone(), config.clone()),
            SecurityManager::new(b, directory, config),
        )
    }

    fn pair() -> (SecurityManager, SecurityManager) {
        pair_with(SecurityConfig::default())
    }

    fn request() -> Envelope {
        Envelope::request("code:lint:run@1.4.2", "interactive")
            .unwrap()
            .with_payload(b"fn main() {}".to_vec())
    }

    #[tokio::test]
    async fn test_handshake_establishes_both_sides() {
        let (a, b) = pair();
        let id = a.handshake(b.did(), None, &b).await.unwrap();

        assert_eq!(a.session_state(id), Some(SessionState::Established));
        assert_eq!(b.session_state(id), Some(SessionState::Established));
        assert_eq!(b.session_for_peer(a.did()), Some(id));
        assert_eq!(a.session(id).unwrap().transcript, b.session(id).unwrap().transcript);

        let again = a.handshake(b.did(), None, &b).await.unwrap();
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn test_seal_open_and_replay() {
        let (a, b) = pair();
        let id = a.handshake(b.did(), None, &b).await.unwrap();
        let sealed = a.seal(request(), id, now_millis()).unwrap();

        let opened = b.open(&sealed.frame, now_millis()).unwrap();
        assert_eq!(opened, sealed.envelope);
        assert_eq!(opened.header.sequence, 1);

        let err = b.open(&sealed.frame, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReplayDetected);
        assert_eq!(err.correlation_id(), Some(sealed.envelope.correlation_id()));
    }

    #[tokio::test]
    async fn test_any_bit_flip_in_signed_region_fails_authentication() {
        let (a, b) = pair();
        let id = a.handshake(b.did(), None, &b).await.unwrap();
        let sealed = a.seal(request(), id, now_millis()).unwrap();
        let prefix = codec::read_prefix(&sealed.frame).unwrap().unwrap();

        for index in PREFIX_LEN..PREFIX_LEN + prefix.signed_len {
            for bit in [0x01u8, 0x80] {
                let mut frame = sealed.frame.clone();
                frame[index] ^= bit;
                let err = b.open(&frame, now_millis()).unwrap_err();
                assert_eq!(err.kind(), ErrorKind::AuthenticationFailed, "byte {}", index);
            }
        }
        assert!(b.open(&sealed.frame, now_millis()).is_ok());
    }

    #[tokio::test]
    async fn test_reordered_delivery_accepted_once() {
        let (a, b) = pair();
        let id = a.handshake(b.did(), None, &b).await.unwrap();
        let frames: Vec<_> = (0..3)
            .map(|_| a.seal(request(), id, now_millis()).unwrap().frame)
            .collect();
        for frame in [&frames[2], &frames[0], &frames[1]] {
            assert!(b.open(frame, now_millis()).is_ok());
        }
        assert!(b.open(&frames[0], now_millis()).is_err());
    }

    #[tokio::test]
    async fn test_unknown_signer_rejected() {
        let (a, b) = pair();
        let id = a.handshake(b.did(), None, &b).await.unwrap();
        let sealed = a.seal(request(), id, now_millis()).unwrap();

        let outsider = SecurityManager::new(
            AgentIdentity::generate(),
            Arc::new(DidDirectory::new()),
            SecurityConfig::default(),
        );
        let err = outsider.open(&sealed.frame, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_traffic() {
        let (a, b) = pair();
        let id = a.handshake(b.did(), None, &b).await.unwrap();
        let pending = a.seal(request(), id, now_millis()).unwrap();

        let close = a.seal(request().reply(MessageType::Close), id, now_millis()).unwrap();
        b.open(&close.frame, now_millis()).unwrap();
        a.close(id, now_millis()).unwrap();

        assert_eq!(b.session_state(id), Some(SessionState::Closed));
        assert_eq!(a.session_state(id), Some(SessionState::Closed));

        let err = b.open(&pending.frame, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSessionState);
        let err = a.seal(request(), id, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSessionState);
    }

    #[tokio::test]
    async fn test_lease_expiry() {
        let (a, b) = pair_with(SecurityConfig {
            session_lease_ms: 1_000,
            ..Default::default()
        });
        let id = a.handshake(b.did(), None, &b).await.unwrap();

        let err = a.seal(request(), id, now_millis() + 2_000).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSessionState);
        assert_eq!(a.session_state(id), Some(SessionState::Expired));

        assert_eq!(b.expire_idle(now_millis() + 2_000), vec![id]);
        assert_eq!(b.session_state(id), Some(SessionState::Expired));
    }

    struct Silent;

    #[async_trait]
    impl HandshakeExchange for Silent {
        async fn exchange(&self, _offer: HandshakeOffer) -> Result<HandshakeAccept> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(Error::unavailable("never answered"))
        }
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (a, b) = pair_with(SecurityConfig {
            handshake_timeout_ms: 50,
            ..Default::default()
        });
        let err = a.handshake(b.did(), None, &Silent).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(a.session_count(), 0);
    }

    #[test]
    fn test_unsupported_scheme_creates_no_session() {
        let (a, b) = pair();
        let mut offer = a.initiate(b.did(), None, now_millis()).unwrap();
        offer.scheme = "rsa-md5".into();
        let err = b.accept(&offer, None, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(b.session_count(), 0);
    }

    #[test]
    fn test_disjoint_version_range_creates_no_session() {
        let (a, b) = pair();
        let mut offer = a.initiate(b.did(), None, now_millis()).unwrap();
        offer.min_version = MAX_PROTOCOL_VERSION + 1;
        offer.max_version = MAX_PROTOCOL_VERSION + 3;
        offer.sign(a.identity()).unwrap();
        let err = b.accept(&offer, None, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(b.session_count(), 0);

        let offer = a.initiate(b.did(), None, now_millis()).unwrap();
        b.accept(&offer, None, now_millis()).unwrap();
        let session = b.session(offer.session_id).unwrap();
        assert_eq!(session.protocol_version, MAX_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_initiator_transport_hint_recorded() {
        let (a, b) = pair_with(SecurityConfig {
            transport_hint: TransportHint::Overlay,
            ..Default::default()
        });
        a.handshake(b.did(), None, &b).await.unwrap();
        assert_eq!(b.transport_hint_for(a.did()), TransportHint::Overlay);
        assert_eq!(b.transport_hint_for("did:iicp:unknown"), TransportHint::Dual);
    }

    #[test]
    fn test_answer_from_wrong_identity_aborts() {
        let (a, b) = pair();
        let offer = a.initiate(b.did(), None, now_millis()).unwrap();
        let mut accept = b.accept(&offer, None, now_millis()).unwrap();
        accept.initiator_nonce = [0u8; 32];
        assert!(a.complete(&accept, now_millis()).is_err());
        assert_eq!(a.session_state(offer.session_id), Some(SessionState::Closed));
    }

    #[test]
    fn test_broadcast_is_signed_session_less() {
        let (a, b) = pair();
        let sealed = a
            .seal_session_less(request().with_flag(EnvelopeFlags::BROADCAST))
            .unwrap();
        assert!(sealed.envelope.header.session_id.is_nil());
        assert!(b.open(&sealed.frame, now_millis()).is_ok());
        assert_eq!(
            b.open(&sealed.frame, now_millis()).unwrap_err().kind(),
            ErrorKind::ReplayDetected
        );

        let err = a.seal_session_less(request()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSessionState);
    }

    fn heartbeat_from(did: &str) -> Envelope {
        Envelope::new(
            MessageType::Heartbeat,
            crate::intent::IntentIdentifier::parse("iicp:registry:heartbeat@1.0.0").unwrap(),
            "batch",
        )
        .with_payload(
            crate::intent::CapabilityObservation::heartbeat(did)
                .to_bytes()
                .unwrap(),
        )
    }

    #[test]
    fn test_restarted_identity_is_not_replay_locked() {
        let secret = [7u8; 32];
        let directory = Arc::new(DidDirectory::new());
        let before = AgentIdentity::from_secret(&secret);
        let receiver = AgentIdentity::generate();
        directory.register(before.document()).unwrap();
        directory.register(receiver.document()).unwrap();
        let b = SecurityManager::new(receiver, directory.clone(), SecurityConfig::default());

        let a = SecurityManager::new(before, directory.clone(), SecurityConfig::default());
        for _ in 0..100 {
            let sealed = a.seal_session_less(heartbeat_from(a.did())).unwrap();
            b.open(&sealed.frame, now_millis()).unwrap();
        }
        drop(a);
        std::thread::sleep(Duration::from_millis(2));

        let restarted = SecurityManager::new(
            AgentIdentity::from_secret(&secret),
            directory,
            SecurityConfig::default(),
        );
        let sealed = restarted
            .seal_session_less(heartbeat_from(restarted.did()))
            .unwrap();
        assert!(b.open(&sealed.frame, now_millis()).is_ok());
    }

    #[test]
    fn test_quiet_signers_are_forgotten() {
        let directory = Arc::new(DidDirectory::new());
        let receiver = AgentIdentity::generate();
        directory.register(receiver.document()).unwrap();
        let b = SecurityManager::new(receiver, directory.clone(), SecurityConfig::default());

        let senders: Vec<_> = (0..500)
            .map(|_| {
                let identity = AgentIdentity::generate();
                directory.register(identity.document()).unwrap();
                SecurityManager::new(identity, directory.clone(), SecurityConfig::default())
            })
            .collect();
        let now = now_millis();
        for sender in &senders {
            let sealed = sender.seal_session_less(heartbeat_from(sender.did())).unwrap();
            b.open(&sealed.frame, now).unwrap();
        }
        assert_eq!(b.signer_count(), 500);

        b.expire_idle(now + 1_000);
        assert_eq!(b.signer_count(), 500);
        b.expire_idle(now + 100_000_000);
        assert_eq!(b.signer_count(), 0);
    }

    #[test]
    fn test_session_less_outside_horizon_rejected() {
        let (a, b) = pair();
        let config = SecurityConfig::default();

        let stale = a
            .seal_session_less(
                heartbeat_from(a.did())
                    .with_timestamp(now_millis() - config.correlation_ttl_ms - 1_000)
                    .with_ttl(u32::MAX),
            )
            .unwrap();
        let err = b.open(&stale.frame, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);

        let ahead = a
            .seal_session_less(
                heartbeat_from(a.did()).with_timestamp(now_millis() + config.max_clock_skew_ms + 5_000),
            )
            .unwrap();
        let err = b.open(&ahead.frame, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
        assert_eq!(b.signer_count(), 0);
    }

    #[test]
    fn test_expired_envelope_dropped() {
        let (a, b) = pair();
        let sealed = a
            .seal_session_less(
                Envelope::new(
                    MessageType::Heartbeat,
                    crate::intent::IntentIdentifier::parse("iicp:registry:heartbeat@1.0.0").unwrap(),
                    "batch",
                )
                .with_timestamp(1_000)
                .with_ttl(10),
            )
            .unwrap();
        let err = b.open(&sealed.frame, now_millis()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeadlineExceeded);
    }
}
