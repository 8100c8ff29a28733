//! Gapmesh wire format — the binary packet every transport carries.
//!
//! These bytes ARE the protocol. Field order, widths, and flag bits are
//! shared with every deployed peer; changing anything here is a breaking
//! change. The layout is variable-length (optional recipient, optional
//! signature, length-prefixed payload), so packets are encoded and decoded
//! by hand rather than with packed structs.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! offset 0   version        u8   (1 or 2)
//!        1   type           u8
//!        2   ttl            u8   (0..=7)
//!        3   timestamp      u64  milliseconds since epoch
//!       11   flags          u8
//!       12   payload length u16 (v1) / u32 (v2)
//!  14 / 16   sender ID      [u8; 8]
//!        +   recipient ID   [u8; 8]   iff HAS_RECIPIENT
//!        +   payload        payload length bytes
//!        +   signature      [u8; 64]  iff HAS_SIGNATURE
//! ```
//!
//! The header is 14 bytes in v1 and 16 in v2 — older documentation that
//! says 13 is wrong; decode follows 14/16. When COMPRESSED is set the
//! payload begins with a raw-length field (2 bytes v1, 4 bytes v2)
//! followed by zlib data; `decode` inflates transparently so callers only
//! ever see the logical payload.

use thiserror::Error;

use crate::compress;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Oldest wire version still decoded.
pub const VERSION_1: u8 = 1;
/// Current wire version (4-byte payload length).
pub const VERSION_2: u8 = 2;

/// Maximum relay hop count. New packets start here.
pub const MAX_TTL: u8 = 7;

/// Fixed header sizes, excluding sender ID and the variable sections.
pub const HEADER_LEN_V1: usize = 14;
pub const HEADER_LEN_V2: usize = 16;

/// Byte offset of the payload-length field in both versions.
pub const LENGTH_OFFSET: usize = 12;

/// Default cap on the logical (decompressed) payload size.
/// Anything claiming more is a decode error, not an allocation.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// Smallest slice a decoder can even look at: v1 header + sender ID.
pub const MIN_FRAME_LEN: usize = HEADER_LEN_V1 + 8;

// ── Peer ID ───────────────────────────────────────────────────────────────────

/// Mesh routing address — the first 8 bytes of a peer's static public key.
/// Stable for the life of that identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 8]);

impl PeerId {
    pub const LEN: usize = 8;

    /// Derive from a static public key.
    pub fn from_public_key(key: &[u8; 32]) -> Self {
        let mut id = [0u8; 8];
        id.copy_from_slice(&key[..8]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

// ── Packet type ───────────────────────────────────────────────────────────────

/// Discriminator for everything that crosses a wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Presence + nickname broadcast.
    Announce = 0x01,
    /// User-visible message (public broadcast when no recipient).
    Message = 0x02,
    /// Graceful departure.
    Leave = 0x03,
    /// Noise_XX handshake message (1, 2, or 3).
    NoiseHandshake = 0x10,
    /// Noise transport ciphertext addressed to one peer.
    NoiseEncrypted = 0x11,
    /// One piece of a fragmented packet.
    Fragment = 0x20,
    /// Request retransmission of recent traffic after reconnect.
    RequestSync = 0x21,
    /// File-transfer payload.
    FileTransfer = 0x22,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Announce),
            0x02 => Ok(PacketType::Message),
            0x03 => Ok(PacketType::Leave),
            0x10 => Ok(PacketType::NoiseHandshake),
            0x11 => Ok(PacketType::NoiseEncrypted),
            0x20 => Ok(PacketType::Fragment),
            0x21 => Ok(PacketType::RequestSync),
            0x22 => Ok(PacketType::FileTransfer),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

// ── Flags ─────────────────────────────────────────────────────────────────────

const FLAG_HAS_RECIPIENT: u8 = 0x01;
const FLAG_HAS_SIGNATURE: u8 = 0x02;
const FLAG_COMPRESSED: u8 = 0x04;
const FLAG_HAS_ROUTE: u8 = 0x08;

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decoded packet. `payload` is always the logical (decompressed) bytes;
/// compression is an encode-time decision and is never visible here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub ttl: u8,
    pub timestamp: u64,
    pub sender_id: PeerId,
    /// Absent = broadcast.
    pub recipient_id: Option<PeerId>,
    pub payload: Vec<u8>,
    pub signature: Option<[u8; 64]>,
    /// v2 flag with no defined semantics yet. Preserved across
    /// decode/encode, interpreted by nothing.
    pub has_route: bool,
}

impl Packet {
    /// A fresh v2 packet with full TTL and no optional sections.
    pub fn new(packet_type: PacketType, sender_id: PeerId, timestamp: u64, payload: Vec<u8>) -> Self {
        Self {
            version: VERSION_2,
            packet_type,
            ttl: MAX_TTL,
            timestamp,
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
            has_route: false,
        }
    }

    pub fn with_recipient(mut self, recipient: PeerId) -> Self {
        self.recipient_id = Some(recipient);
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl.min(MAX_TTL);
        self
    }

    /// Deduplication fingerprint. Broadcasts key on `hex(senderID):timestamp`;
    /// directed session traffic additionally keys on its leading payload
    /// bytes (the explicit nonce), since a handshake reply and the first
    /// ciphertext routinely share one millisecond and both must relay.
    /// Fragments are deduplicated by transfer ID instead (see fragment).
    pub fn dedup_fingerprint(&self) -> String {
        match self.packet_type {
            PacketType::NoiseHandshake | PacketType::NoiseEncrypted => {
                let prefix = &self.payload[..8.min(self.payload.len())];
                format!(
                    "{}:{}:{}",
                    self.sender_id,
                    self.timestamp,
                    hex::encode(prefix)
                )
            }
            _ => format!("{}:{}", self.sender_id, self.timestamp),
        }
    }

    /// The bytes an Ed25519 signature covers: everything up to and
    /// including the payload, with the signature flag forced on so both
    /// signer and verifier hash identical headers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut signed = self.clone();
        signed.signature = Some([0u8; 64]);
        let mut bytes = encode(&signed);
        bytes.truncate(bytes.len() - 64);
        bytes
    }

    fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.recipient_id.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= FLAG_HAS_SIGNATURE;
        }
        if self.has_route {
            flags |= FLAG_HAS_ROUTE;
        }
        flags
    }

    fn header_len(&self) -> usize {
        if self.version == VERSION_1 {
            HEADER_LEN_V1
        } else {
            HEADER_LEN_V2
        }
    }

    /// Encoded size, assuming the payload goes out uncompressed.
    pub fn encoded_len(&self) -> usize {
        self.header_len()
            + PeerId::LEN
            + if self.recipient_id.is_some() { PeerId::LEN } else { 0 }
            + self.payload.len()
            + if self.signature.is_some() { 64 } else { 0 }
    }
}

// ── Encode ────────────────────────────────────────────────────────────────────

/// Serialize a packet. Payloads at or above the compression floor are
/// deflated when that actually shrinks them; the raw-length prefix lets the
/// receiver inflate without guessing.
pub fn encode(packet: &Packet) -> Vec<u8> {
    let (payload, compressed) = match compress::deflate_if_smaller(&packet.payload) {
        Some(deflated) => {
            let mut framed = Vec::with_capacity(deflated.len() + 4);
            if packet.version == VERSION_1 {
                framed.extend_from_slice(&(packet.payload.len() as u16).to_be_bytes());
            } else {
                framed.extend_from_slice(&(packet.payload.len() as u32).to_be_bytes());
            }
            framed.extend_from_slice(&deflated);
            (framed, true)
        }
        None => (packet.payload.clone(), false),
    };

    let mut out = Vec::with_capacity(packet.encoded_len());
    out.push(packet.version);
    out.push(packet.packet_type as u8);
    out.push(packet.ttl);
    out.extend_from_slice(&packet.timestamp.to_be_bytes());
    let mut flags = packet.flags();
    if compressed {
        flags |= FLAG_COMPRESSED;
    }
    out.push(flags);
    if packet.version == VERSION_1 {
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(packet.sender_id.as_bytes());
    if let Some(recipient) = packet.recipient_id {
        out.extend_from_slice(recipient.as_bytes());
    }
    out.extend_from_slice(&payload);
    if let Some(signature) = packet.signature {
        out.extend_from_slice(&signature);
    }
    out
}

// ── Decode ────────────────────────────────────────────────────────────────────

/// Parse one frame with the default payload cap.
pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
    decode_with_cap(data, DEFAULT_MAX_PAYLOAD)
}

/// Parse one frame. `max_payload` bounds both the on-wire payload length
/// field and the decompressed size a COMPRESSED payload may claim.
pub fn decode_with_cap(data: &[u8], max_payload: usize) -> Result<Packet, WireError> {
    if data.len() < MIN_FRAME_LEN {
        return Err(WireError::Truncated);
    }

    let version = data[0];
    if version != VERSION_1 && version != VERSION_2 {
        return Err(WireError::UnknownVersion(version));
    }

    let packet_type = PacketType::try_from(data[1])?;
    let ttl = data[2].min(MAX_TTL);
    let timestamp = u64::from_be_bytes(data[3..11].try_into().unwrap());
    let flags = data[11];

    let (payload_len, header_len) = if version == VERSION_1 {
        (
            u16::from_be_bytes(data[LENGTH_OFFSET..LENGTH_OFFSET + 2].try_into().unwrap()) as usize,
            HEADER_LEN_V1,
        )
    } else {
        if data.len() < HEADER_LEN_V2 + PeerId::LEN {
            return Err(WireError::Truncated);
        }
        (
            u32::from_be_bytes(data[LENGTH_OFFSET..LENGTH_OFFSET + 4].try_into().unwrap()) as usize,
            HEADER_LEN_V2,
        )
    };

    if payload_len > max_payload {
        return Err(WireError::PayloadTooLarge(payload_len, max_payload));
    }

    let mut offset = header_len;

    let mut sender = [0u8; 8];
    sender.copy_from_slice(take(data, &mut offset, PeerId::LEN)?);
    let sender_id = PeerId(sender);

    let recipient_id = if flags & FLAG_HAS_RECIPIENT != 0 {
        let mut recipient = [0u8; 8];
        recipient.copy_from_slice(take(data, &mut offset, PeerId::LEN)?);
        Some(PeerId(recipient))
    } else {
        None
    };

    let raw_payload = take(data, &mut offset, payload_len)?;

    let payload = if flags & FLAG_COMPRESSED != 0 {
        let prefix = if version == VERSION_1 { 2 } else { 4 };
        if raw_payload.len() < prefix {
            return Err(WireError::Truncated);
        }
        let raw_len = if version == VERSION_1 {
            u16::from_be_bytes(raw_payload[..2].try_into().unwrap()) as usize
        } else {
            u32::from_be_bytes(raw_payload[..4].try_into().unwrap()) as usize
        };
        if raw_len > max_payload {
            return Err(WireError::PayloadTooLarge(raw_len, max_payload));
        }
        compress::inflate(&raw_payload[prefix..], raw_len)?
    } else {
        raw_payload.to_vec()
    };

    let signature = if flags & FLAG_HAS_SIGNATURE != 0 {
        let mut sig = [0u8; 64];
        sig.copy_from_slice(take(data, &mut offset, 64)?);
        Some(sig)
    } else {
        None
    };

    Ok(Packet {
        version,
        packet_type,
        ttl,
        timestamp,
        sender_id,
        recipient_id,
        payload,
        signature,
        has_route: flags & FLAG_HAS_ROUTE != 0,
    })
}

/// Total on-wire length of the frame starting at `data[0]`, if the buffered
/// prefix is long enough to tell. Used by the stream assembler to frame
/// notification streams without fully decoding.
pub fn frame_len(data: &[u8]) -> Result<Option<usize>, WireError> {
    if data.len() < MIN_FRAME_LEN {
        return Ok(None);
    }
    let version = data[0];
    if version != VERSION_1 && version != VERSION_2 {
        return Err(WireError::UnknownVersion(version));
    }
    let flags = data[11];
    let (payload_len, header_len) = if version == VERSION_1 {
        (
            u16::from_be_bytes(data[LENGTH_OFFSET..LENGTH_OFFSET + 2].try_into().unwrap()) as usize,
            HEADER_LEN_V1,
        )
    } else {
        if data.len() < HEADER_LEN_V2 + PeerId::LEN {
            return Ok(None);
        }
        (
            u32::from_be_bytes(data[LENGTH_OFFSET..LENGTH_OFFSET + 4].try_into().unwrap()) as usize,
            HEADER_LEN_V2,
        )
    };
    let mut total = header_len + PeerId::LEN + payload_len;
    if flags & FLAG_HAS_RECIPIENT != 0 {
        total += PeerId::LEN;
    }
    if flags & FLAG_HAS_SIGNATURE != 0 {
        total += 64;
    }
    Ok(Some(total))
}

fn take<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], WireError> {
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or(WireError::Truncated)?;
    let slice = &data[*offset..end];
    *offset = end;
    Ok(slice)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
/// All are non-fatal: log, drop the frame, keep the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("payload length {0} exceeds cap {1}")]
    PayloadTooLarge(usize, usize),

    #[error("truncated frame")]
    Truncated,

    #[error("zlib payload corrupt: {0}")]
    BadCompression(String),

    #[error("invalid padding")]
    BadPadding,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
