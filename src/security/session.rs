//! Session state machine.
//!
//! ```text
//! INIT -> HANDSHAKING -> ESTABLISHED -> CLOSING -> CLOSED
//!              |              |
//!              +-> CLOSED     +-> EXPIRED (lease timeout)
//! ```
//!
//! `CLOSED` and `EXPIRED` are terminal.

use crate::core::{Endpoint, Error, Hash256, Result, SessionId, TransportHint};
use crate::security::replay::SequenceWindow;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Init,
    Handshaking,
    Established,
    Closing,
    Closed,
    Expired,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Expired)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Handshaking)
                | (Handshaking, Established)
                | (Handshaking, Closed)
                | (Established, Closing)
                | (Established, Expired)
                | (Closing, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Handshaking => "HANDSHAKING",
            SessionState::Established => "ESTABLISHED",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
            SessionState::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// Which side opened the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// An authenticated association between two identities.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub role: SessionRole,
    pub local_did: String,
    pub remote_did: String,
    /// Known once the handshake completes
    pub remote_key: Option<VerifyingKey>,
    /// Where the peer accepts replies
    pub remote_endpoint: Option<Endpoint>,
    pub scheme: String,
    /// Protocol version settled in the handshake
    pub protocol_version: u8,
    /// Transport the initiator asked to be reached through
    pub transport_hint: TransportHint,
    /// Local handshake nonce
    pub local_nonce: [u8; 32],
    /// Hash over both nonces and identities, equal on both sides
    pub transcript: Hash256,
    state: SessionState,
    next_sequence: u64,
    inbound: SequenceWindow,
    pub created_ms: u64,
    pub lease_ms: u64,
    lease_expires_ms: u64,
}

impl Session {
    /// A session in `INIT`.
    pub fn new(
        id: SessionId,
        role: SessionRole,
        local_did: &str,
        remote_did: &str,
        scheme: &str,
        lease_ms: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            id,
            role,
            local_did: local_did.to_string(),
            remote_did: remote_did.to_string(),
            remote_key: None,
            remote_endpoint: None,
            scheme: scheme.to_string(),
            protocol_version: 0,
            transport_hint: TransportHint::Dual,
            local_nonce: [0u8; 32],
            transcript: Hash256::zero(),
            state: SessionState::Init,
            next_sequence: 1,
            inbound: SequenceWindow::new(),
            created_ms: now_ms,
            lease_ms,
            lease_expires_ms: now_ms.saturating_add(lease_ms),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(Error::InvalidSessionState {
                correlation_id: None,
                session: self.id,
                state: format!("{} (cannot move to {})", self.state, next),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Fail unless the session is `ESTABLISHED` and its lease is live.
    /// A lapsed lease moves the session to `EXPIRED`.
    pub fn require_established(&mut self, now_ms: u64) -> Result<()> {
        if self.state == SessionState::Established && self.is_lease_expired(now_ms) {
            self.state = SessionState::Expired;
        }
        if self.state != SessionState::Established {
            return Err(Error::InvalidSessionState {
                correlation_id: None,
                session: self.id,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Next outbound sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Record an inbound sequence; `false` means replay.
    pub fn accept_sequence(&mut self, sequence: u64) -> bool {
        self.inbound.accept(sequence)
    }

    /// Renew the lease on activity.
    pub fn touch(&mut self, now_ms: u64) {
        self.lease_expires_ms = self
            .lease_expires_ms
            .max(now_ms.saturating_add(self.lease_ms));
    }

    pub fn is_lease_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.lease_expires_ms
    }

    pub fn lease_expires_ms(&self) -> u64 {
        self.lease_expires_ms
    }
}
