//! Envelope Codec.
//!
//! Binary, length-prefixed serialization of protocol messages with a signed
//! region that covers every header field and the payload.

pub mod codec;
pub mod compression;
pub mod message;
pub mod stream;

pub use codec::{
    assemble, decode, decode_signed, encode, peek_header, read_prefix, signing_bytes, split_frame,
    FramePrefix, SplitFrame, MAX_FRAME_LEN, MAX_PAYLOAD_LEN, PREFIX_LEN, WIRE_VERSION,
};
pub use compression::{compress_payload, compress_with_stats, decompress_payload, CompressionStats};
pub use message::{
    Envelope, EnvelopeFlags, EnvelopeHeader, MessageType, SecurityTrailer, DEFAULT_TTL_MS,
};
pub use stream::{frame_len, FrameDecoder};
