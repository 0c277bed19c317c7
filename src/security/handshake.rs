//! Handshake messages.
//!
//! The initiator sends a signed [`HandshakeOffer`] carrying its DID, key,
//! scheme and a fresh nonce. The responder verifies it and answers with a
//! signed [`HandshakeAccept`] that echoes the initiator nonce. Both sides
//! derive the same transcript hash.
//!
//! The offer also carries the protocol version range the initiator speaks
//! and its transport preference; the answer names the version both sides
//! settled on.

use crate::core::{Endpoint, Error, Hash256, Result, SessionId, TransportHint};
use crate::envelope::WIRE_VERSION;
use crate::security::crypto::{sha3_256_multi, verify, verifying_key_from_bytes};
use crate::security::identity::{is_bound, AgentIdentity, KeyResolver};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

/// The only key-exchange scheme this implementation speaks.
pub const SUPPORTED_SCHEME: &str = "ed25519-sha3";

/// Oldest protocol version this implementation negotiates.
pub const MIN_PROTOCOL_VERSION: u8 = 1;
/// Newest protocol version this implementation negotiates.
pub const MAX_PROTOCOL_VERSION: u8 = WIRE_VERSION;

/// First handshake message, carried in a `Handshake` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeOffer {
    pub session_id: SessionId,
    pub initiator_did: String,
    pub initiator_key: [u8; 32],
    /// DID the initiator expects to reach
    pub responder_did: String,
    pub scheme: String,
    pub min_version: u8,
    pub max_version: u8,
    pub transport_hint: TransportHint,
    pub nonce: [u8; 32],
    pub reply_endpoint: Option<Endpoint>,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

impl HandshakeOffer {
    /// Build and sign an offer.
    pub fn signed(
        identity: &AgentIdentity,
        session_id: SessionId,
        responder_did: &str,
        nonce: [u8; 32],
        reply_endpoint: Option<Endpoint>,
        timestamp_ms: u64,
    ) -> Result<Self> {
        let mut offer = Self {
            session_id,
            initiator_did: identity.did().to_string(),
            initiator_key: identity.public_key_bytes(),
            responder_did: responder_did.to_string(),
            scheme: SUPPORTED_SCHEME.to_string(),
            min_version: MIN_PROTOCOL_VERSION,
            max_version: MAX_PROTOCOL_VERSION,
            transport_hint: TransportHint::Dual,
            nonce,
            reply_endpoint,
            timestamp_ms,
            signature: Vec::new(),
        };
        offer.sign(identity)?;
        Ok(offer)
    }

    /// Announce a transport preference. Re-signs the offer.
    pub fn with_transport_hint(mut self, identity: &AgentIdentity, hint: TransportHint) -> Result<Self> {
        self.transport_hint = hint;
        self.sign(identity)?;
        Ok(self)
    }

    /// (Re-)sign after editing fields.
    pub fn sign(&mut self, identity: &AgentIdentity) -> Result<()> {
        self.signature = identity.sign(&self.signable()?);
        Ok(())
    }

    /// Highest version inside both the offered and the supported range.
    pub fn negotiate_version(&self) -> Result<u8> {
        if self.min_version > self.max_version {
            return Err(Error::auth(format!(
                "empty protocol version range {}-{}",
                self.min_version, self.max_version
            )));
        }
        let low = self.min_version.max(MIN_PROTOCOL_VERSION);
        let high = self.max_version.min(MAX_PROTOCOL_VERSION);
        if low > high {
            return Err(Error::auth(format!(
                "no common protocol version: offered {}-{}, supported {}-{}",
                self.min_version, self.max_version, MIN_PROTOCOL_VERSION, MAX_PROTOCOL_VERSION
            )));
        }
        Ok(high)
    }

    fn signable(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(
            "iicp-handshake-offer",
            &self.session_id,
            &self.initiator_did,
            &self.initiator_key,
            &self.responder_did,
            &self.scheme,
            (self.min_version, self.max_version, self.transport_hint),
            &self.nonce,
            &self.reply_endpoint,
            self.timestamp_ms,
        ))?)
    }

    /// Verify scheme, DID binding, resolved key and signature. Returns the
    /// initiator's key.
    pub fn verify(&self, resolver: &dyn KeyResolver) -> Result<VerifyingKey> {
        check_scheme(&self.scheme)?;
        let key = verify_claim(&self.initiator_did, &self.initiator_key, resolver)?;
        verify(&key, &self.signable()?, &self.signature)?;
        Ok(key)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::malformed(format!("bad handshake offer: {}", e)))
    }
}

/// Second handshake message, carried in a `HandshakeAck` envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAccept {
    pub session_id: SessionId,
    pub responder_did: String,
    pub responder_key: [u8; 32],
    pub scheme: String,
    /// Negotiated protocol version
    pub version: u8,
    /// Echo of the offer nonce
    pub initiator_nonce: [u8; 32],
    pub nonce: [u8; 32],
    pub reply_endpoint: Option<Endpoint>,
    pub signature: Vec<u8>,
}

impl HandshakeAccept {
    /// Build and sign an acceptance of `offer`. Fails when the version
    /// ranges do not overlap.
    pub fn signed(
        identity: &AgentIdentity,
        offer: &HandshakeOffer,
        nonce: [u8; 32],
        reply_endpoint: Option<Endpoint>,
    ) -> Result<Self> {
        let mut accept = Self {
            session_id: offer.session_id,
            responder_did: identity.did().to_string(),
            responder_key: identity.public_key_bytes(),
            scheme: offer.scheme.clone(),
            version: offer.negotiate_version()?,
            initiator_nonce: offer.nonce,
            nonce,
            reply_endpoint,
            signature: Vec::new(),
        };
        accept.signature = identity.sign(&accept.signable()?);
        Ok(accept)
    }

    fn signable(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(
            "iicp-handshake-accept",
            &self.session_id,
            &self.responder_did,
            &self.responder_key,
            &self.scheme,
            self.version,
            &self.initiator_nonce,
            &self.nonce,
            &self.reply_endpoint,
        ))?)
    }

    /// Verify scheme, version, DID binding, resolved key and signature.
    /// Returns the responder's key.
    pub fn verify(&self, resolver: &dyn KeyResolver) -> Result<VerifyingKey> {
        check_scheme(&self.scheme)?;
        if !(MIN_PROTOCOL_VERSION..=MAX_PROTOCOL_VERSION).contains(&self.version) {
            return Err(Error::auth(format!(
                "answer settled on unsupported protocol version {}",
                self.version
            )));
        }
        let key = verify_claim(&self.responder_did, &self.responder_key, resolver)?;
        verify(&key, &self.signable()?, &self.signature)?;
        Ok(key)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::malformed(format!("bad handshake accept: {}", e)))
    }
}

/// Transcript hash binding both identities and nonces to the session.
pub fn transcript(
    session_id: SessionId,
    initiator_did: &str,
    responder_did: &str,
    initiator_nonce: &[u8; 32],
    responder_nonce: &[u8; 32],
) -> Hash256 {
    sha3_256_multi(&[
        session_id.as_bytes(),
        initiator_did.as_bytes(),
        responder_did.as_bytes(),
        initiator_nonce,
        responder_nonce,
    ])
}

fn check_scheme(scheme: &str) -> Result<()> {
    if scheme != SUPPORTED_SCHEME {
        return Err(Error::auth(format!(
            "unsupported key-exchange scheme '{}'",
            scheme
        )));
    }
    Ok(())
}

/// The claimed key must hash to the DID and equal the independently
/// resolved key.
fn verify_claim(did: &str, claimed: &[u8; 32], resolver: &dyn KeyResolver) -> Result<VerifyingKey> {
    let key = verifying_key_from_bytes(claimed)?;
    if !is_bound(did, &key) {
        return Err(Error::auth(format!("claimed key does not match {}", did)));
    }
    let resolved = resolver.resolve_key(did)?;
    if resolved != key {
        return Err(Error::auth(format!("claimed key for {} differs from resolved key", did)));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::crypto::random_nonce;
    use crate::security::identity::DidDirectory;

    fn setup() -> (AgentIdentity, AgentIdentity, DidDirectory) {
        let a = AgentIdentity::generate();
        let b = AgentIdentity::generate();
        let directory = DidDirectory::new();
        directory.register(a.document()).unwrap();
        directory.register(b.document()).unwrap();
        (a, b, directory)
    }

    #[test]
    fn test_offer_and_accept_verify() {
        let (a, b, directory) = setup();
        let offer =
            HandshakeOffer::signed(&a, SessionId::new(), b.did(), random_nonce(), None, 1).unwrap();
        let offer = HandshakeOffer::from_bytes(&offer.to_bytes().unwrap()).unwrap();
        assert_eq!(offer.verify(&directory).unwrap(), a.verifying_key());

        let accept = HandshakeAccept::signed(&b, &offer, random_nonce(), None).unwrap();
        assert_eq!(accept.verify(&directory).unwrap(), b.verifying_key());
        assert_eq!(accept.initiator_nonce, offer.nonce);
    }

    #[test]
    fn test_tampered_offer_fails() {
        let (a, b, directory) = setup();
        let mut offer =
            HandshakeOffer::signed(&a, SessionId::new(), b.did(), random_nonce(), None, 1).unwrap();
        offer.timestamp_ms += 1;
        assert!(offer.verify(&directory).is_err());
    }

    #[test]
    fn test_unsupported_scheme() {
        let (a, b, directory) = setup();
        let mut offer =
            HandshakeOffer::signed(&a, SessionId::new(), b.did(), random_nonce(), None, 1).unwrap();
        offer.scheme = "x25519-kyber".into();
        let err = offer.verify(&directory).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn test_identity_mismatch() {
        let (a, b, directory) = setup();
        let mut offer =
            HandshakeOffer::signed(&a, SessionId::new(), b.did(), random_nonce(), None, 1).unwrap();
        offer.initiator_did = b.did().to_string();
        assert!(offer.verify(&directory).is_err());
    }

    #[test]
    fn test_unresolvable_initiator() {
        let (_, b, directory) = setup();
        let stranger = AgentIdentity::generate();
        let offer =
            HandshakeOffer::signed(&stranger, SessionId::new(), b.did(), random_nonce(), None, 1)
                .unwrap();
        assert!(offer.verify(&directory).is_err());
    }

    #[test]
    fn test_version_negotiation() {
        let (a, b, directory) = setup();
        let mut offer =
            HandshakeOffer::signed(&a, SessionId::new(), b.did(), random_nonce(), None, 1).unwrap();
        assert_eq!(offer.negotiate_version().unwrap(), MAX_PROTOCOL_VERSION);

        offer.min_version = MIN_PROTOCOL_VERSION;
        offer.max_version = MAX_PROTOCOL_VERSION + 4;
        offer.sign(&a).unwrap();
        assert!(offer.verify(&directory).is_ok());
        let accept = HandshakeAccept::signed(&b, &offer, random_nonce(), None).unwrap();
        assert_eq!(accept.version, MAX_PROTOCOL_VERSION);

        offer.min_version = MAX_PROTOCOL_VERSION + 1;
        offer.sign(&a).unwrap();
        let err = HandshakeAccept::signed(&b, &offer, random_nonce(), None).unwrap_err();
        assert!(err.to_string().contains("no common protocol version"), "{}", err);

        offer.min_version = 3;
        offer.max_version = 2;
        assert!(offer.negotiate_version().is_err());
    }

    #[test]
    fn test_transport_hint_is_signed() {
        let (a, b, directory) = setup();
        let offer = HandshakeOffer::signed(&a, SessionId::new(), b.did(), random_nonce(), None, 1)
            .unwrap()
            .with_transport_hint(&a, TransportHint::Overlay)
            .unwrap();
        assert!(offer.verify(&directory).is_ok());

        let mut forged = offer.clone();
        forged.transport_hint = TransportHint::Direct;
        assert!(forged.verify(&directory).is_err());
    }

    #[test]
    fn test_transcript_is_symmetric_input() {
        let id = SessionId::new();
        let t1 = transcript(id, "did:iicp:a", "did:iicp:b", &[1; 32], &[2; 32]);
        let t2 = transcript(id, "did:iicp:a", "did:iicp:b", &[1; 32], &[2; 32]);
        let t3 = transcript(id, "did:iicp:a", "did:iicp:b", &[2; 32], &[1; 32]);
        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
    }
}
