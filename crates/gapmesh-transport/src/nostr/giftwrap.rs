//! Gift-wrap construction and unwrapping (kinds 14 → 13 → 1059).
//!
//! The core packet — already Noise-encrypted, not yet padded — rides
//! bytewise inside the rumor content as `bitchat1:` + base64. The rumor
//! is never signed; the seal binds it to the true sender; the wrap hides
//! that sender from relays under a throwaway key and a skewed timestamp.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;

use gapmesh_core::wire::{self, Packet};

use super::event::{
    NostrEvent, NostrKeys, KIND_GIFT_WRAP, KIND_RUMOR_DM, KIND_SEAL,
};
use super::{nip44, NostrError};

/// Marker prefix for embedded core packets inside rumor content.
pub const EMBED_PREFIX: &str = "bitchat1:";

/// Wrap timestamps are skewed backwards by up to this much so relay
/// arrival order reveals nothing.
const MAX_TIMESTAMP_SKEW_SECS: u64 = 2 * 24 * 60 * 60;

/// Embed an encoded core packet in rumor content.
pub fn embed_packet(packet: &Packet) -> String {
    format!("{EMBED_PREFIX}{}", BASE64.encode(wire::encode(packet)))
}

/// Extract an embedded core packet from rumor content.
pub fn extract_packet(content: &str) -> Result<Packet, NostrError> {
    let b64 = content
        .strip_prefix(EMBED_PREFIX)
        .ok_or(NostrError::NoEmbeddedPacket)?;
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| NostrError::Malformed(e.to_string()))?;
    Ok(wire::decode(&bytes)?)
}

/// Build the full 14 → 13 → 1059 envelope for one packet.
pub fn gift_wrap(
    packet: &Packet,
    sender: &NostrKeys,
    recipient_pubkey_hex: &str,
    now_secs: u64,
) -> Result<NostrEvent, NostrError> {
    // Rumor: unsigned, true sender, embedded packet.
    let rumor = NostrEvent::unsigned(
        sender.public_hex(),
        now_secs,
        KIND_RUMOR_DM,
        vec![vec!["p".to_string(), recipient_pubkey_hex.to_string()]],
        embed_packet(packet),
    );
    let rumor_json =
        serde_json::to_string(&rumor).map_err(|e| NostrError::Malformed(e.to_string()))?;

    // Seal: rumor encrypted sender→recipient, signed by the sender.
    let seal_key = nip44::conversation_key(sender.secret_key(), recipient_pubkey_hex)?;
    let seal = NostrEvent::sign(
        sender,
        skewed(now_secs),
        KIND_SEAL,
        vec![],
        nip44::encrypt(&seal_key, rumor_json.as_bytes())?,
    );
    let seal_json =
        serde_json::to_string(&seal).map_err(|e| NostrError::Malformed(e.to_string()))?;

    // Wrap: seal encrypted ephemeral→recipient under a throwaway key, so
    // the only readable pubkey on the relay is one that never recurs.
    let ephemeral = NostrKeys::ephemeral();
    let wrap_key = nip44::conversation_key(ephemeral.secret_key(), recipient_pubkey_hex)?;
    Ok(NostrEvent::sign(
        &ephemeral,
        skewed(now_secs),
        KIND_GIFT_WRAP,
        vec![vec!["p".to_string(), recipient_pubkey_hex.to_string()]],
        nip44::encrypt(&wrap_key, seal_json.as_bytes())?,
    ))
}

/// Invert [`gift_wrap`]: returns the embedded packet and the sender's
/// Nostr public key (from the verified seal).
pub fn unwrap(wrap: &NostrEvent, ours: &NostrKeys) -> Result<(Packet, String), NostrError> {
    if wrap.kind != KIND_GIFT_WRAP {
        return Err(NostrError::Malformed(format!("kind {} is not a wrap", wrap.kind)));
    }
    wrap.verify()?;

    let wrap_key = nip44::conversation_key(ours.secret_key(), &wrap.pubkey)?;
    let seal_json = nip44::decrypt(&wrap_key, &wrap.content)?;
    let seal: NostrEvent = serde_json::from_slice(&seal_json)
        .map_err(|e| NostrError::Malformed(e.to_string()))?;
    if seal.kind != KIND_SEAL {
        return Err(NostrError::Malformed(format!("kind {} is not a seal", seal.kind)));
    }
    seal.verify()?;

    let seal_key = nip44::conversation_key(ours.secret_key(), &seal.pubkey)?;
    let rumor_json = nip44::decrypt(&seal_key, &seal.content)?;
    let rumor: NostrEvent = serde_json::from_slice(&rumor_json)
        .map_err(|e| NostrError::Malformed(e.to_string()))?;

    // The seal's signer must be the rumor's claimed author, or the rumor
    // was transplanted.
    if rumor.pubkey != seal.pubkey {
        return Err(NostrError::Malformed("rumor author != seal signer".into()));
    }

    let packet = extract_packet(&rumor.content)?;
    Ok((packet, seal.pubkey))
}

fn skewed(now_secs: u64) -> u64 {
    now_secs.saturating_sub(rand::thread_rng().gen_range(0..MAX_TIMESTAMP_SKEW_SECS))
}
