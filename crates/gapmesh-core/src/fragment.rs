//! Fragmentation and reassembly for payloads beyond the link MTU.
//!
//! A packet too big for one write is encoded, sliced, and each slice
//! shipped as a `Fragment` packet whose payload is:
//!
//! ```text
//! transfer ID  [u8; 16]
//! index        u16 BE
//! total        u16 BE
//! chunk        remaining bytes
//! ```
//!
//! TTL and recipient are inherited so fragments relay exactly like their
//! original. Reassembly buffers are per-transfer, tolerate any arrival
//! order, drop duplicates silently, and are abandoned wholesale when a
//! transfer stalls past the window. A completed transfer ID is remembered
//! for a grace period so stragglers do not resurrect an empty buffer.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::platform::SecureRandom;
use crate::wire::{self, Packet, PacketType, WireError};

/// Fragment payload prefix: transfer id + index + total.
pub const FRAGMENT_HEADER_LEN: usize = 16 + 2 + 2;

/// A stalled transfer is abandoned after this long without completing.
pub const REASSEMBLY_WINDOW_MILLIS: u64 = 30_000;

/// Completed transfer IDs are remembered this long to swallow late
/// duplicates.
pub const COMPLETED_GRACE_MILLIS: u64 = 30_000;

/// Concurrent in-flight transfers; beyond this the stalest buffer is
/// evicted to bound memory against fragment floods.
pub const MAX_TRANSFERS: usize = 64;

// ── Split ─────────────────────────────────────────────────────────────────────

/// Split `packet` so every emitted frame fits in `mtu` encoded bytes.
/// Packets that already fit come back unchanged as a single element.
pub fn split(
    packet: &Packet,
    mtu: usize,
    rng: &dyn SecureRandom,
) -> Result<Vec<Packet>, FragmentError> {
    let encoded = wire::encode(packet);
    if encoded.len() <= mtu {
        return Ok(vec![packet.clone()]);
    }

    // Worst-case per-fragment framing: header + sender + optional
    // recipient + the fragment prefix.
    // A skeleton with an empty chunk already carries the fragment prefix,
    // so its encoded length is exactly the per-fragment overhead.
    let skeleton = fragment_skeleton(packet, [0u8; 16], 0, 0, Vec::new());
    let chunk_size = mtu
        .checked_sub(skeleton.encoded_len())
        .filter(|&n| n > 0)
        .ok_or(FragmentError::MtuTooSmall(mtu))?;

    let total = encoded.len().div_ceil(chunk_size);
    if total > u16::MAX as usize {
        return Err(FragmentError::TooManyFragments(total));
    }

    let mut transfer_id = [0u8; 16];
    rng.fill(&mut transfer_id);

    let fragments = encoded
        .chunks(chunk_size)
        .enumerate()
        .map(|(index, chunk)| {
            fragment_skeleton(
                packet,
                transfer_id,
                index as u16,
                total as u16,
                chunk.to_vec(),
            )
        })
        .collect();
    Ok(fragments)
}

fn fragment_skeleton(
    original: &Packet,
    transfer_id: [u8; 16],
    index: u16,
    total: u16,
    chunk: Vec<u8>,
) -> Packet {
    let mut payload = Vec::with_capacity(FRAGMENT_HEADER_LEN + chunk.len());
    payload.extend_from_slice(&transfer_id);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&total.to_be_bytes());
    payload.extend_from_slice(&chunk);

    Packet {
        version: original.version,
        packet_type: PacketType::Fragment,
        ttl: original.ttl,
        timestamp: original.timestamp,
        sender_id: original.sender_id,
        recipient_id: original.recipient_id,
        payload,
        signature: None,
        has_route: false,
    }
}

/// Parsed view of one fragment payload.
pub struct FragmentPiece<'a> {
    pub transfer_id: [u8; 16],
    pub index: u16,
    pub total: u16,
    pub chunk: &'a [u8],
}

pub fn parse_fragment(payload: &[u8]) -> Result<FragmentPiece<'_>, FragmentError> {
    if payload.len() < FRAGMENT_HEADER_LEN {
        return Err(FragmentError::Malformed);
    }
    let mut transfer_id = [0u8; 16];
    transfer_id.copy_from_slice(&payload[..16]);
    let index = u16::from_be_bytes(payload[16..18].try_into().unwrap());
    let total = u16::from_be_bytes(payload[18..20].try_into().unwrap());
    Ok(FragmentPiece {
        transfer_id,
        index,
        total,
        chunk: &payload[FRAGMENT_HEADER_LEN..],
    })
}

/// Dedup fingerprint for a fragment: the transfer ID, not sender:timestamp,
/// so every piece of one transfer relays independently.
pub fn fragment_fingerprint(piece: &FragmentPiece<'_>) -> String {
    format!("frag:{}:{}", hex::encode(piece.transfer_id), piece.index)
}

// ── Reassembly ────────────────────────────────────────────────────────────────

struct Transfer {
    total: u16,
    chunks: HashMap<u16, Vec<u8>>,
    last_update: u64,
}

/// Collects fragments until originals can be synthesized.
pub struct Reassembler {
    transfers: Mutex<HashMap<[u8; 16], Transfer>>,
    completed: Mutex<HashMap<[u8; 16], u64>>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            transfers: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one Fragment packet. Returns the reconstructed original the
    /// moment the last piece lands, exactly once per transfer.
    pub fn accept(&self, fragment: &Packet, now_millis: u64) -> Result<Option<Packet>, FragmentError> {
        let piece = parse_fragment(&fragment.payload)?;
        if piece.total == 0 || piece.index >= piece.total {
            return Err(FragmentError::Malformed);
        }

        {
            let completed = self.completed.lock().unwrap_or_else(|e| e.into_inner());
            if completed.contains_key(&piece.transfer_id) {
                // Late duplicate of a finished transfer.
                return Ok(None);
            }
        }

        let assembled = {
            let mut transfers = self.transfers.lock().unwrap_or_else(|e| e.into_inner());
            if transfers.len() >= MAX_TRANSFERS && !transfers.contains_key(&piece.transfer_id) {
                // Evict the stalest buffer to make room.
                if let Some(&stalest) = transfers
                    .iter()
                    .min_by_key(|(_, t)| t.last_update)
                    .map(|(id, _)| id)
                {
                    transfers.remove(&stalest);
                    tracing::warn!(
                        transfer = %hex::encode(stalest),
                        "reassembly table full, evicted stalest transfer"
                    );
                }
            }
            let transfer = transfers.entry(piece.transfer_id).or_insert_with(|| Transfer {
                total: piece.total,
                chunks: HashMap::new(),
                last_update: now_millis,
            });
            if transfer.total != piece.total {
                // Conflicting totals for one transfer id — poisoned, drop it.
                transfers.remove(&piece.transfer_id);
                return Err(FragmentError::Malformed);
            }
            transfer.last_update = now_millis;
            transfer.chunks.entry(piece.index).or_insert_with(|| piece.chunk.to_vec());

            if transfer.chunks.len() < transfer.total as usize {
                return Ok(None);
            }

            let mut bytes = Vec::new();
            for index in 0..transfer.total {
                bytes.extend_from_slice(&transfer.chunks[&index]);
            }
            transfers.remove(&piece.transfer_id);
            bytes
        };

        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(piece.transfer_id, now_millis);

        let packet = wire::decode(&assembled)?;
        Ok(Some(packet))
    }

    /// Drop transfers that stalled past the window and expire the
    /// completed-grace set. Returns how many live transfers were abandoned.
    pub fn sweep(&self, now_millis: u64) -> usize {
        let cutoff = now_millis.saturating_sub(REASSEMBLY_WINDOW_MILLIS);
        let abandoned = {
            let mut transfers = self.transfers.lock().unwrap_or_else(|e| e.into_inner());
            let before = transfers.len();
            transfers.retain(|_, t| t.last_update > cutoff);
            before - transfers.len()
        };
        if abandoned > 0 {
            tracing::debug!(abandoned, "abandoned stalled fragment transfers");
        }
        let grace_cutoff = now_millis.saturating_sub(COMPLETED_GRACE_MILLIS);
        self.completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, &mut at| at > grace_cutoff);
        abandoned
    }

    /// Live transfer count, for capacity accounting.
    pub fn pending(&self) -> usize {
        self.transfers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear(&self) {
        self.transfers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.completed.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FragmentError {
    #[error("mtu {0} cannot hold a fragment header")]
    MtuTooSmall(usize),

    #[error("payload needs {0} fragments, more than a u16 can index")]
    TooManyFragments(usize),

    #[error("malformed fragment payload")]
    Malformed,

    #[error(transparent)]
    Wire(#[from] WireError),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
