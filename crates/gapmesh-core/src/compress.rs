//! zlib payload compression.
//!
//! Packets compress transparently at encode time: payloads at or above a
//! small floor are deflated, and the deflated form is used only when it is
//! actually smaller. The receiver learns the raw size from the prefix the
//! codec writes, so inflation is bounded up front.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::wire::WireError;

/// Payloads below this never compress — the zlib header alone would eat
/// the savings.
pub const COMPRESSION_FLOOR: usize = 64;

/// Deflate `data`, returning the compressed bytes only when compression
/// pays for itself. `None` means "send raw".
pub fn deflate_if_smaller(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < COMPRESSION_FLOOR {
        return None;
    }
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).ok()?;
    let deflated = encoder.finish().ok()?;
    // The raw-length prefix (at most 4 bytes) must also fit in the savings.
    if deflated.len() + 4 < data.len() {
        Some(deflated)
    } else {
        None
    }
}

/// Inflate exactly `raw_len` bytes. A stream that is shorter, longer, or
/// corrupt is a decode error.
pub fn inflate(data: &[u8], raw_len: usize) -> Result<Vec<u8>, WireError> {
    let mut out = vec![0u8; raw_len];
    let mut decoder = ZlibDecoder::new(data);
    decoder
        .read_exact(&mut out)
        .map_err(|e| WireError::BadCompression(e.to_string()))?;
    // Anything left over means the declared raw size lied.
    let mut excess = [0u8; 1];
    match decoder.read(&mut excess) {
        Ok(0) => Ok(out),
        Ok(_) => Err(WireError::BadCompression("trailing data".into())),
        Err(e) => Err(WireError::BadCompression(e.to_string())),
    }
}
