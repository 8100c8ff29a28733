//! PKCS#7-style block padding for BLE frames.
//!
//! Encoded frames are padded up to the smallest standard block that fits
//! so a passive observer cannot size-correlate traffic. The pad count
//! lives in the final byte, so a frame only pads when the count fits in
//! one byte; everything else (including anything over the largest block)
//! goes out unpadded and relies on fragmentation instead.
//!
//! The stream assembler computes frame boundaries from the packet header,
//! so [`padded_len`] must stay in exact agreement with [`pad`]: for any
//! frame, `pad(frame).len() == padded_len(frame.len())`.

use crate::wire::WireError;

/// Standard block sizes, smallest first.
pub const BLOCK_SIZES: [usize; 4] = [256, 512, 1024, 2048];

/// Largest block; frames beyond this are never padded.
pub const MAX_BLOCK: usize = 2048;

/// On-wire length after padding: the smallest block that fits, when the
/// required pad count fits in the one-byte trailer; otherwise unchanged.
pub fn padded_len(len: usize) -> usize {
    match BLOCK_SIZES.iter().find(|&&block| len < block) {
        Some(&block) if block - len <= 255 => block,
        _ => len,
    }
}

/// Pad `frame` per [`padded_len`]. Every padding byte holds the count.
pub fn pad(frame: &[u8]) -> Vec<u8> {
    let target = padded_len(frame.len());
    if target == frame.len() {
        return frame.to_vec();
    }
    let pad_len = target - frame.len();
    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(frame);
    out.resize(target, pad_len as u8);
    out
}

/// Strip padding applied by [`pad`]. Frames whose length is not a block
/// size were never padded and pass through unchanged.
pub fn unpad(frame: &[u8]) -> Result<&[u8], WireError> {
    if frame.is_empty() {
        return Err(WireError::BadPadding);
    }
    if !BLOCK_SIZES.contains(&frame.len()) {
        return Ok(frame);
    }
    let pad_len = *frame.last().unwrap() as usize;
    if pad_len == 0 || pad_len >= frame.len() {
        return Err(WireError::BadPadding);
    }
    Ok(&frame[..frame.len() - pad_len])
}
