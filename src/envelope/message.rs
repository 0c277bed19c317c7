//! Envelope data model.
//!
//! Defines the fixed message catalog, header flags, the security trailer and
//! the [`Envelope`] itself.

use crate::core::{now_millis, CorrelationId, Error, Result, SessionId};
use crate::envelope::compression::{compress_payload, decompress_payload};
use crate::intent::IntentIdentifier;
use serde::{Deserialize, Serialize};

/// The message catalog, fixed for wire version 1.
///
/// Kinds that also appear in the IICP 1.4 opcode table keep its codes. The
/// rest take the slots that table gives to discover, sub-protocol, feedback,
/// pong and control.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Session handshake offer
    Handshake = 0x01,
    /// Session handshake acceptance
    HandshakeAck = 0x02,
    /// Subscribe to an intent pattern
    Subscribe = 0x03,
    /// Cancel a subscription
    Unsubscribe = 0x04,
    /// Intent request
    Request = 0x05,
    /// Intent response
    Response = 0x06,
    /// Session close
    Close = 0x07,
    /// Negative acknowledgment
    Nack = 0x08,
    /// Liveness refresh
    Heartbeat = 0x09,
    /// Positive acknowledgment
    Ack = 0x0A,
    /// Protocol error report
    Error = 0x0B,
    /// Capability advertisement
    Advertise = 0x0C,
    /// Capability observation (load/latency update)
    Observe = 0x0D,
    /// Telemetry report
    Telemetry = 0x0E,
}

impl MessageType {
    /// Every kind in code order.
    pub const ALL: [MessageType; 14] = [
        MessageType::Handshake,
        MessageType::HandshakeAck,
        MessageType::Subscribe,
        MessageType::Unsubscribe,
        MessageType::Request,
        MessageType::Response,
        MessageType::Close,
        MessageType::Nack,
        MessageType::Heartbeat,
        MessageType::Ack,
        MessageType::Error,
        MessageType::Advertise,
        MessageType::Observe,
        MessageType::Telemetry,
    ];

    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a wire code; `None` outside the catalog.
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }

    /// Whether this kind may only travel inside an established session
    /// (unless sent as a signed broadcast).
    pub fn requires_session(self) -> bool {
        !matches!(
            self,
            MessageType::Handshake
                | MessageType::HandshakeAck
                | MessageType::Advertise
                | MessageType::Observe
                | MessageType::Heartbeat
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Handshake => "handshake",
            MessageType::HandshakeAck => "handshake_ack",
            MessageType::Advertise => "advertise",
            MessageType::Observe => "observe",
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Ack => "ack",
            MessageType::Nack => "nack",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Telemetry => "telemetry",
            MessageType::Subscribe => "subscribe",
            MessageType::Unsubscribe => "unsubscribe",
            MessageType::Error => "error",
            MessageType::Close => "close",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Header flag bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeFlags(u8);

impl EnvelopeFlags {
    /// Payload is LZ4 compressed.
    pub const COMPRESSED: EnvelopeFlags = EnvelopeFlags(0x01);
    /// Payload is encrypted; key material travels in the trailer.
    pub const ENCRYPTED: EnvelopeFlags = EnvelopeFlags(0x02);
    /// Fan-out to every matching agent.
    pub const BROADCAST: EnvelopeFlags = EnvelopeFlags(0x04);
    /// Sender requests an anonymity-preserving path.
    pub const ANONYMOUS: EnvelopeFlags = EnvelopeFlags(0x08);
    /// Sender requests a partition-tolerant path.
    pub const RESILIENT: EnvelopeFlags = EnvelopeFlags(0x10);

    const KNOWN: u8 = 0x1F;

    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Accept only defined bits.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::KNOWN == 0 {
            Some(Self(bits))
        } else {
            None
        }
    }

    pub fn contains(self, other: EnvelopeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: EnvelopeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EnvelopeFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for EnvelopeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Envelope header. Everything here is covered by the signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub message_type: MessageType,
    pub flags: EnvelopeFlags,
    pub intent: IntentIdentifier,
    /// Unique within the owning session
    pub correlation_id: CorrelationId,
    /// Nil for session-less traffic
    pub session_id: SessionId,
    /// Replay-protection counter in the session (or signer) sequence space
    pub sequence: u64,
    /// Declared QoS class name
    pub qos_class: String,
    /// Creation time, unix ms
    pub timestamp_ms: u64,
    /// Time to live after `timestamp_ms`
    pub ttl_ms: u32,
}

impl EnvelopeHeader {
    /// Absolute deadline, unix ms.
    pub fn deadline_ms(&self) -> u64 {
        self.timestamp_ms.saturating_add(u64::from(self.ttl_ms))
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms()
    }

    pub fn is_broadcast(&self) -> bool {
        self.flags.contains(EnvelopeFlags::BROADCAST)
    }
}

/// Signature and key material appended after the signed region.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecurityTrailer {
    /// Signer key id (the signer's DID)
    pub key_id: String,
    pub signature: Vec<u8>,
    /// Wrapped content key when the payload is encrypted
    pub encrypted_key: Option<Vec<u8>>,
}

impl SecurityTrailer {
    pub fn new(key_id: &str, signature: Vec<u8>) -> Self {
        Self {
            key_id: key_id.to_string(),
            signature,
            encrypted_key: None,
        }
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

/// A protocol message: header, opaque payload and security trailer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub payload: Vec<u8>,
    pub trailer: SecurityTrailer,
}

/// Default time to live for new envelopes.
pub const DEFAULT_TTL_MS: u32 = 30_000;

impl Envelope {
    /// New unsigned envelope stamped with the current time.
    pub fn new(message_type: MessageType, intent: IntentIdentifier, qos_class: &str) -> Self {
        Self {
            header: EnvelopeHeader {
                message_type,
                flags: EnvelopeFlags::empty(),
                intent,
                correlation_id: CorrelationId::new(),
                session_id: SessionId::nil(),
                sequence: 0,
                qos_class: qos_class.to_string(),
                timestamp_ms: now_millis(),
                ttl_ms: DEFAULT_TTL_MS,
            },
            payload: Vec::new(),
            trailer: SecurityTrailer::default(),
        }
    }

    /// Shorthand for a `Request` parsed from an intent string.
    pub fn request(intent: &str, qos_class: &str) -> Result<Self> {
        Ok(Self::new(
            MessageType::Request,
            IntentIdentifier::parse(intent)?,
            qos_class,
        ))
    }

    /// Reply in the same exchange: same intent, class and correlation id.
    pub fn reply(&self, message_type: MessageType) -> Self {
        let mut reply = Self::new(
            message_type,
            self.header.intent.clone(),
            &self.header.qos_class,
        );
        reply.header.correlation_id = self.header.correlation_id;
        reply.header.session_id = self.header.session_id;
        reply.header.ttl_ms = self.header.ttl_ms;
        reply
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_flag(mut self, flag: EnvelopeFlags) -> Self {
        self.header.flags.insert(flag);
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u32) -> Self {
        self.header.ttl_ms = ttl_ms;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.header.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.header.correlation_id = id;
        self
    }

    pub fn with_session(mut self, session_id: SessionId, sequence: u64) -> Self {
        self.header.session_id = session_id;
        self.header.sequence = sequence;
        self
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.header.correlation_id
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type
    }

    /// LZ4-compress the payload and set the compressed flag. No-op if the
    /// payload is already compressed.
    pub fn compressed(mut self) -> Self {
        if !self.header.flags.contains(EnvelopeFlags::COMPRESSED) {
            self.payload = compress_payload(&self.payload);
            self.header.flags.insert(EnvelopeFlags::COMPRESSED);
        }
        self
    }

    /// Payload with compression undone.
    pub fn plain_payload(&self) -> Result<Vec<u8>> {
        if self.header.flags.contains(EnvelopeFlags::COMPRESSED) {
            decompress_payload(&self.payload)
                .map_err(|e| e.with_correlation(self.header.correlation_id))
        } else {
            Ok(self.payload.clone())
        }
    }

    /// Parse the payload as JSON, e.g. for sub-protocol bodies carried opaquely.
    pub fn json_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.plain_payload()?).map_err(Error::from)
    }
}
