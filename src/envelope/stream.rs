//! Incremental frame decoding for stream transports.

use crate::core::{Error, Result};
use crate::envelope::codec::{self, PREFIX_LEN};
use crate::envelope::message::{Envelope, EnvelopeHeader};
use bytes::{Bytes, BytesMut};

/// Buffers bytes from a stream and yields complete frames.
///
/// The header of the frame at the front of the buffer can be inspected as
/// soon as it has arrived, before its payload is complete.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Header of the pending frame, once all header fields are buffered.
    pub fn peek_header(&self) -> Result<Option<EnvelopeHeader>> {
        codec::peek_header(&self.buf)
    }

    /// Bytes still missing for the pending frame, if its prefix is known.
    pub fn missing(&self) -> Result<Option<usize>> {
        Ok(codec::read_prefix(&self.buf)?
            .map(|prefix| prefix.frame_len.saturating_sub(self.buf.len())))
    }

    /// Take the next complete raw frame.
    ///
    /// A malformed prefix is unrecoverable for the stream; callers should
    /// drop the connection.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let Some(prefix) = codec::read_prefix(&self.buf)? else {
            return Ok(None);
        };
        if self.buf.len() < prefix.frame_len {
            self.buf.reserve(prefix.frame_len - self.buf.len());
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(prefix.frame_len).freeze()))
    }

    /// Take and decode the next complete frame.
    pub fn decode_next(&mut self) -> Result<Option<Envelope>> {
        match self.next_frame()? {
            Some(frame) => codec::decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Frame length from a complete prefix, for readers that pull exact sizes.
pub fn frame_len(prefix: &[u8; PREFIX_LEN]) -> Result<usize> {
    codec::read_prefix(prefix)?
        .map(|p| p.frame_len)
        .ok_or_else(|| Error::malformed("truncated frame prefix"))
}
