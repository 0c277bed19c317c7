//! LZ4 payload compression.
//!
//! Compressed payloads carry the uncompressed size as a 4-byte little-endian
//! prefix, checked against [`MAX_PAYLOAD_LEN`] before any allocation.

use crate::core::{Error, Result};
use crate::envelope::codec::MAX_PAYLOAD_LEN;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};

/// Compression statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompressionStats {
    /// Original size in bytes
    pub original_size: usize,
    /// Compressed size in bytes
    pub compressed_size: usize,
    /// Compression ratio (original / compressed)
    pub ratio: f64,
}

impl CompressionStats {
    fn measure(original_size: usize, compressed_size: usize) -> Self {
        Self {
            original_size,
            compressed_size,
            ratio: if compressed_size > 0 {
                original_size as f64 / compressed_size as f64
            } else {
                1.0
            },
        }
    }
}

/// Compress a payload.
pub fn compress_payload(data: &[u8]) -> Vec<u8> {
    compress_prepend_size(data)
}

/// Compress a payload and report the achieved ratio.
pub fn compress_with_stats(data: &[u8]) -> (Vec<u8>, CompressionStats) {
    let compressed = compress_payload(data);
    let stats = CompressionStats::measure(data.len(), compressed.len());
    (compressed, stats)
}

/// Decompress a payload produced by [`compress_payload`].
pub fn decompress_payload(data: &[u8]) -> Result<Vec<u8>> {
    let size: [u8; 4] = data
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::malformed("compressed payload missing size prefix"))?;
    let declared = u32::from_le_bytes(size) as usize;
    if declared > MAX_PAYLOAD_LEN {
        return Err(Error::malformed(format!(
            "compressed payload declares {} bytes, limit is {}",
            declared, MAX_PAYLOAD_LEN
        )));
    }
    decompress_size_prepended(data)
        .map_err(|e| Error::malformed(format!("payload decompression failed: {}", e)))
}
