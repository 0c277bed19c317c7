//! Binary envelope codec, wire version 1.
//!
//! ```text
//! +-------+-----------+------------+------------------------------+---------+
//! | "IP"  | frame len | signed len | signed region                | trailer |
//! | 2     | u32       | u32        | header fields + payload      |         |
//! +-------+-----------+------------+------------------------------+---------+
//! ```
//!
//! All integers are big-endian. The signed region holds the wire version,
//! message type, flags, ttl, timestamp, correlation id, session id,
//! sequence, length-prefixed intent/version/QoS strings and the
//! length-prefixed payload. The trailer holds the key id, the signature and
//! optional encrypted key material.
//!
//! The two unsigned lengths let a receiver isolate the signed bytes and
//! verify them before trusting any header field.

use crate::core::{CorrelationId, Error, Result, SessionId};
use crate::envelope::message::{
    Envelope, EnvelopeFlags, EnvelopeHeader, MessageType, SecurityTrailer,
};
use crate::intent::IntentIdentifier;
use bytes::{Buf, BufMut, BytesMut};

/// Frame magic.
pub const MAGIC: [u8; 2] = *b"IP";

/// Wire version this codec reads and writes.
pub const WIRE_VERSION: u8 = 1;

/// Magic + frame length + signed length.
pub const PREFIX_LEN: usize = 10;

/// Fixed-width part of the signed region.
const FIXED_HEADER_LEN: usize = 1 + 1 + 1 + 4 + 8 + 16 + 16 + 8;

/// Smallest possible signed region: fixed fields, empty strings, empty payload.
const MIN_SIGNED_LEN: usize = FIXED_HEADER_LEN + 2 + 1 + 1 + 4;

/// Smallest possible trailer: empty key id, empty signature, no key material.
const MIN_TRAILER_LEN: usize = 1 + 2 + 1;

/// Largest payload accepted on encode or decode.
pub const MAX_PAYLOAD_LEN: usize = 8 * 1024 * 1024;

/// Largest frame accepted on encode or decode.
pub const MAX_FRAME_LEN: usize = MAX_PAYLOAD_LEN + 64 * 1024;

/// Lengths carried in the unsigned frame prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePrefix {
    pub frame_len: usize,
    pub signed_len: usize,
}

/// A frame split into its signed bytes and parsed trailer.
#[derive(Debug)]
pub struct SplitFrame<'a> {
    pub signed: &'a [u8],
    pub trailer: SecurityTrailer,
}

/// Serialize the signed region: every header field plus the payload.
pub fn signing_bytes(header: &EnvelopeHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let intent = header.intent.pattern().to_string();
    let version = header.intent.version.to_string();
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::malformed(format!(
            "payload of {} bytes exceeds limit {}",
            payload.len(),
            MAX_PAYLOAD_LEN
        ))
        .with_correlation(header.correlation_id));
    }

    let mut buf = BytesMut::with_capacity(MIN_SIGNED_LEN + intent.len() + 64 + payload.len());
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(header.message_type.code());
    buf.put_u8(header.flags.bits());
    buf.put_u32(header.ttl_ms);
    buf.put_u64(header.timestamp_ms);
    buf.put_slice(header.correlation_id.as_bytes());
    buf.put_slice(header.session_id.as_bytes());
    buf.put_u64(header.sequence);
    let attach = |e: Error| e.with_correlation(header.correlation_id);
    put_str16(&mut buf, &intent, "intent").map_err(attach)?;
    put_str8(&mut buf, &version, "version").map_err(attach)?;
    put_str8(&mut buf, &header.qos_class, "qos class").map_err(attach)?;
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.to_vec())
}

/// Frame an already serialized signed region with its trailer.
pub fn assemble(signed: &[u8], trailer: &SecurityTrailer) -> Result<Vec<u8>> {
    let mut tail = BytesMut::with_capacity(MIN_TRAILER_LEN + trailer.key_id.len() + 64);
    put_str8(&mut tail, &trailer.key_id, "key id")?;
    put_bytes16(&mut tail, &trailer.signature, "signature")?;
    match &trailer.encrypted_key {
        Some(key) => {
            tail.put_u8(1);
            put_bytes16(&mut tail, key, "encrypted key")?;
        }
        None => tail.put_u8(0),
    }

    let frame_len = PREFIX_LEN + signed.len() + tail.len();
    if frame_len > MAX_FRAME_LEN {
        return Err(Error::malformed(format!(
            "frame of {} bytes exceeds limit {}",
            frame_len, MAX_FRAME_LEN
        )));
    }
    let mut out = BytesMut::with_capacity(frame_len);
    out.put_slice(&MAGIC);
    out.put_u32(frame_len as u32);
    out.put_u32(signed.len() as u32);
    out.put_slice(signed);
    out.put_slice(&tail);
    Ok(out.to_vec())
}

/// Encode an envelope. Deterministic: equal envelopes give equal bytes.
pub fn encode(
    header: &EnvelopeHeader,
    payload: &[u8],
    trailer: &SecurityTrailer,
) -> Result<Vec<u8>> {
    assemble(&signing_bytes(header, payload)?, trailer)
}

/// Decode a complete frame.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let frame = split_frame(bytes)?;
    let (header, payload) = decode_signed(frame.signed)?;
    Ok(Envelope {
        header,
        payload,
        trailer: frame.trailer,
    })
}

/// Read the unsigned prefix. `Ok(None)` if fewer than [`PREFIX_LEN`] bytes
/// are available.
pub fn read_prefix(bytes: &[u8]) -> Result<Option<FramePrefix>> {
    if bytes.len() < PREFIX_LEN {
        return Ok(None);
    }
    let mut prefix = &bytes[..PREFIX_LEN];
    let mut magic = [0u8; 2];
    prefix.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(Error::malformed("bad frame magic"));
    }
    let frame_len = prefix.get_u32() as usize;
    let signed_len = prefix.get_u32() as usize;
    if frame_len > MAX_FRAME_LEN {
        return Err(Error::malformed(format!(
            "frame of {} bytes exceeds limit {}",
            frame_len, MAX_FRAME_LEN
        )));
    }
    if signed_len < MIN_SIGNED_LEN || PREFIX_LEN + signed_len + MIN_TRAILER_LEN > frame_len {
        return Err(Error::malformed(format!(
            "inconsistent frame lengths (frame {}, signed {})",
            frame_len, signed_len
        )));
    }
    Ok(Some(FramePrefix {
        frame_len,
        signed_len,
    }))
}

/// Split a complete frame into signed region and trailer without decoding
/// the header, so the signature can be checked first.
pub fn split_frame(bytes: &[u8]) -> Result<SplitFrame<'_>> {
    let prefix = read_prefix(bytes)?.ok_or_else(|| Error::malformed("truncated frame prefix"))?;
    if bytes.len() < prefix.frame_len {
        return Err(Error::malformed(format!(
            "truncated frame: {} of {} bytes",
            bytes.len(),
            prefix.frame_len
        )));
    }
    if bytes.len() > prefix.frame_len {
        return Err(Error::malformed(format!(
            "{} trailing bytes after frame",
            bytes.len() - prefix.frame_len
        )));
    }
    let signed_end = PREFIX_LEN + prefix.signed_len;
    Ok(SplitFrame {
        signed: &bytes[PREFIX_LEN..signed_end],
        trailer: decode_trailer(&bytes[signed_end..])?,
    })
}

/// Decode a signed region into header and payload.
pub fn decode_signed(signed: &[u8]) -> Result<(EnvelopeHeader, Vec<u8>)> {
    let mut reader = Reader::new(signed);
    let fixed = read_fixed(&mut reader).map_err(Short::into_error)?;
    let correlation_id = fixed.correlation_id;
    let attach = |e: Error| e.with_correlation(correlation_id);

    let (header, payload_len) =
        finish_header(&mut reader, fixed).map_err(|s| attach(s.into_error()))?;
    if reader.remaining() != payload_len {
        return Err(attach(Error::malformed(format!(
            "declared payload length {} does not match {} bytes present",
            payload_len,
            reader.remaining()
        ))));
    }
    let payload = reader
        .take(payload_len, "payload")
        .map_err(|s| attach(s.into_error()))?
        .to_vec();
    Ok((header, payload))
}

/// Inspect the header of a possibly incomplete frame.
///
/// Returns `Ok(None)` until every header field has arrived; the payload
/// need not be present. Invalid content fails immediately.
pub fn peek_header(bytes: &[u8]) -> Result<Option<EnvelopeHeader>> {
    let Some(prefix) = read_prefix(bytes)? else {
        return Ok(None);
    };
    let end = bytes.len().min(PREFIX_LEN + prefix.signed_len);
    let mut reader = Reader::new(&bytes[PREFIX_LEN..end]);
    let fixed = match read_fixed(&mut reader) {
        Ok(fixed) => fixed,
        Err(Short::Incomplete(_)) => return Ok(None),
        Err(Short::Invalid(e)) => return Err(e),
    };
    let correlation_id = fixed.correlation_id;
    match finish_header(&mut reader, fixed) {
        Ok((header, _)) => Ok(Some(header)),
        Err(Short::Incomplete(_)) => Ok(None),
        Err(Short::Invalid(e)) => Err(e.with_correlation(correlation_id)),
    }
}

impl Envelope {
    /// Encode this envelope, including its trailer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(&self.header, &self.payload, &self.trailer)
    }

    /// Decode a complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }

    /// The bytes a signature covers.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        signing_bytes(&self.header, &self.payload)
    }
}

fn decode_trailer(bytes: &[u8]) -> Result<SecurityTrailer> {
    let mut reader = Reader::new(bytes);
    let parse = |r: &mut Reader<'_>| -> std::result::Result<SecurityTrailer, Short> {
        let key_id = r.str8("key id")?;
        let signature = r.bytes16("signature")?;
        let encrypted_key = match r.u8("key marker")? {
            0 => None,
            1 => Some(r.bytes16("encrypted key")?),
            other => {
                return Err(Short::Invalid(Error::malformed(format!(
                    "invalid key marker {}",
                    other
                ))))
            }
        };
        Ok(SecurityTrailer {
            key_id,
            signature,
            encrypted_key,
        })
    };
    let trailer = parse(&mut reader).map_err(Short::into_error)?;
    if reader.remaining() != 0 {
        return Err(Error::malformed(format!(
            "{} unexpected bytes after trailer",
            reader.remaining()
        )));
    }
    Ok(trailer)
}

struct FixedHeader {
    wire_version: u8,
    message_type: u8,
    flags: u8,
    ttl_ms: u32,
    timestamp_ms: u64,
    correlation_id: CorrelationId,
    session_id: SessionId,
    sequence: u64,
}

fn read_fixed(r: &mut Reader<'_>) -> std::result::Result<FixedHeader, Short> {
    Ok(FixedHeader {
        wire_version: r.u8("wire version")?,
        message_type: r.u8("message type")?,
        flags: r.u8("flags")?,
        ttl_ms: r.u32("ttl")?,
        timestamp_ms: r.u64("timestamp")?,
        correlation_id: CorrelationId::from_bytes(r.array16("correlation id")?),
        session_id: SessionId::from_bytes(r.array16("session id")?),
        sequence: r.u64("sequence")?,
    })
}

fn finish_header(
    r: &mut Reader<'_>,
    fixed: FixedHeader,
) -> std::result::Result<(EnvelopeHeader, usize), Short> {
    if fixed.wire_version != WIRE_VERSION {
        return Err(invalid(format!(
            "unsupported wire version {}",
            fixed.wire_version
        )));
    }
    let message_type = MessageType::from_code(fixed.message_type)
        .ok_or_else(|| invalid(format!("unknown message type 0x{:02x}", fixed.message_type)))?;
    let flags = EnvelopeFlags::from_bits(fixed.flags)
        .ok_or_else(|| invalid(format!("unknown flag bits 0x{:02x}", fixed.flags)))?;

    let intent = r.str16("intent")?;
    let version = r.str8("version")?;
    let qos_class = r.str8("qos class")?;
    let payload_len = r.u32("payload length")? as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(invalid(format!(
            "payload of {} bytes exceeds limit {}",
            payload_len, MAX_PAYLOAD_LEN
        )));
    }
    if qos_class.is_empty() {
        return Err(invalid("missing qos class".to_string()));
    }
    let intent = IntentIdentifier::from_parts(&intent, &version).map_err(Short::Invalid)?;

    Ok((
        EnvelopeHeader {
            message_type,
            flags,
            intent,
            correlation_id: fixed.correlation_id,
            session_id: fixed.session_id,
            sequence: fixed.sequence,
            qos_class,
            timestamp_ms: fixed.timestamp_ms,
            ttl_ms: fixed.ttl_ms,
        },
        payload_len,
    ))
}

fn put_str8(buf: &mut BytesMut, value: &str, what: &str) -> Result<()> {
    let len = u8::try_from(value.len())
        .map_err(|_| Error::malformed(format!("{} longer than 255 bytes", what)))?;
    buf.put_u8(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_str16(buf: &mut BytesMut, value: &str, what: &str) -> Result<()> {
    put_bytes16(buf, value.as_bytes(), what)
}

fn put_bytes16(buf: &mut BytesMut, value: &[u8], what: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::malformed(format!("{} longer than 65535 bytes", what)))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

fn invalid(reason: String) -> Short {
    Short::Invalid(Error::malformed(reason))
}

/// Why a read stopped.
enum Short {
    /// Not enough bytes yet.
    Incomplete(&'static str),
    Invalid(Error),
}

impl Short {
    fn into_error(self) -> Error {
        match self {
            Short::Incomplete(what) => Error::malformed(format!("truncated {}", what)),
            Short::Invalid(e) => e,
        }
    }
}

/// Bounds-checked big-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> std::result::Result<&'a [u8], Short> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or(Short::Incomplete(what))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> std::result::Result<u8, Short> {
        Ok(self.take(1, what)?.get_u8())
    }

    fn u16(&mut self, what: &'static str) -> std::result::Result<u16, Short> {
        Ok(self.take(2, what)?.get_u16())
    }

    fn u32(&mut self, what: &'static str) -> std::result::Result<u32, Short> {
        Ok(self.take(4, what)?.get_u32())
    }

    fn u64(&mut self, what: &'static str) -> std::result::Result<u64, Short> {
        Ok(self.take(8, what)?.get_u64())
    }

    fn array16(&mut self, what: &'static str) -> std::result::Result<[u8; 16], Short> {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.take(16, what)?);
        Ok(out)
    }

    fn bytes16(&mut self, what: &'static str) -> std::result::Result<Vec<u8>, Short> {
        let len = self.u16(what)? as usize;
        Ok(self.take(len, what)?.to_vec())
    }

    fn str8(&mut self, what: &'static str) -> std::result::Result<String, Short> {
        let len = self.u8(what)? as usize;
        utf8(self.take(len, what)?, what)
    }

    fn str16(&mut self, what: &'static str) -> std::result::Result<String, Short> {
        let len = self.u16(what)? as usize;
        utf8(self.take(len, what)?, what)
    }
}

fn utf8(bytes: &[u8], what: &str) -> std::result::Result<String, Short> {
    String::from_utf8(bytes.to_vec()).map_err(|_| invalid(format!("{} is not valid UTF-8", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    fn sample() -> Envelope {
        let mut envelope = Envelope::request("research:climate-analysis:summarize@2.1.0", "interactive")
            .unwrap()
            .with_payload(b"{\"region\":\"arctic\"}".to_vec())
            .with_session(SessionId::new(), 7)
            .with_flag(EnvelopeFlags::RESILIENT)
            .with_ttl(5_000);
        envelope.trailer = SecurityTrailer::new("did:iicp:0011223344556677", vec![0xAB; 64]);
        envelope
    }

    #[test]
    fn test_roundtrip() {
        let envelope = sample();
        let bytes = envelope.encode().unwrap();
        assert_eq!(Envelope::decode(&bytes).unwrap(), envelope);
    }

    #[test]
    fn test_roundtrip_with_key_material_and_empty_payload() {
        let mut envelope = sample().with_payload(Vec::new());
        envelope.trailer.encrypted_key = Some(vec![9; 48]);
        let decoded = decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let envelope = sample();
        assert_eq!(envelope.encode().unwrap(), envelope.clone().encode().unwrap());
    }

    #[test]
    fn test_every_truncation_is_malformed() {
        let bytes = sample().encode().unwrap();
        for len in 0..bytes.len() {
            let err = decode(&bytes[..len]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::MalformedEnvelope, "length {}", len);
        }
    }

    #[test]
    fn test_unknown_message_type() {
        let envelope = sample();
        let mut bytes = envelope.encode().unwrap();
        bytes[PREFIX_LEN + 1] = 0x2A;
        let err = decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
        assert_eq!(err.correlation_id(), Some(envelope.correlation_id()));
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[PREFIX_LEN + 2] |= 0x80;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_payload_length_mismatch() {
        let envelope = sample();
        let mut long = envelope.signing_bytes().unwrap();
        long.push(0xAA);
        let err = decode(&assemble(&long, &envelope.trailer).unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);

        let mut short = envelope.signing_bytes().unwrap();
        short.pop();
        assert!(decode(&assemble(&short, &envelope.trailer).unwrap()).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes.push(0);
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'X';
        assert!(read_prefix(&bytes).is_err());
    }

    #[test]
    fn test_peek_header_before_payload_arrives() {
        let envelope = sample();
        let bytes = envelope.encode().unwrap();
        let payload_start = bytes.len()
            - envelope.payload.len()
            - (1 + envelope.trailer.key_id.len() + 2 + envelope.trailer.signature.len() + 1);

        let header = peek_header(&bytes[..payload_start]).unwrap().unwrap();
        assert_eq!(header, envelope.header);

        assert!(peek_header(&bytes[..PREFIX_LEN + 20]).unwrap().is_none());
        assert!(peek_header(&bytes[..4]).unwrap().is_none());
    }

    #[test]
    fn test_split_frame_isolates_signed_region() {
        let envelope = sample();
        let bytes = envelope.encode().unwrap();
        let frame = split_frame(&bytes).unwrap();
        assert_eq!(frame.signed, envelope.signing_bytes().unwrap().as_slice());
        assert_eq!(frame.trailer, envelope.trailer);
    }

    #[test]
    fn test_oversized_fields_rejected() {
        let mut envelope = sample();
        envelope.header.qos_class = "x".repeat(300);
        assert!(envelope.encode().is_err());
    }
}
