//! Nostr event model: ids, Schnorr signatures, and the kinds gapmesh uses.

use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, Parity, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::NostrError;

/// Unsigned private-message rumor.
pub const KIND_RUMOR_DM: u32 = 14;
/// Seal: rumor encrypted to the recipient, signed by the true sender.
pub const KIND_SEAL: u32 = 13;
/// Gift wrap: seal encrypted again under a throwaway key.
pub const KIND_GIFT_WRAP: u32 = 1059;
/// Ephemeral location-channel broadcast.
pub const KIND_EPHEMERAL_CHANNEL: u32 = 20_000;
/// Plain note, keyed by geohash tag.
pub const KIND_GEO_NOTE: u32 = 1;

/// A relay-network identity: one secp256k1 keypair.
pub struct NostrKeys {
    secret: SecretKey,
    keypair: Keypair,
    public: XOnlyPublicKey,
}

impl NostrKeys {
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, NostrError> {
        let secp = Secp256k1::new();
        let secret =
            SecretKey::from_slice(bytes).map_err(|e| NostrError::BadKey(e.to_string()))?;
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (public, _parity) = keypair.x_only_public_key();
        Ok(Self {
            secret,
            keypair,
            public,
        })
    }

    /// Fresh random keys; used for the outer layer of every gift wrap.
    pub fn ephemeral() -> Self {
        let secp = Secp256k1::new();
        let (secret, _) = secp.generate_keypair(&mut rand::thread_rng());
        let keypair = Keypair::from_secret_key(&secp, &secret);
        let (public, _parity) = keypair.x_only_public_key();
        Self {
            secret,
            keypair,
            public,
        }
    }

    /// Hex x-only public key — the wire identity.
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

/// Lift a hex x-only public key to a full point (even parity, per BIP-340).
pub fn point_from_hex(pubkey_hex: &str) -> Result<PublicKey, NostrError> {
    let bytes = hex::decode(pubkey_hex).map_err(|e| NostrError::BadKey(e.to_string()))?;
    let xonly =
        XOnlyPublicKey::from_slice(&bytes).map_err(|e| NostrError::BadKey(e.to_string()))?;
    Ok(PublicKey::from_x_only_public_key(xonly, Parity::Even))
}

/// One Nostr event, exactly as serialized to relays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NostrEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl NostrEvent {
    /// The canonical id: SHA-256 over the serialized
    /// `[0, pubkey, created_at, kind, tags, content]` array.
    pub fn compute_id(
        pubkey: &str,
        created_at: u64,
        kind: u32,
        tags: &[Vec<String>],
        content: &str,
    ) -> [u8; 32] {
        let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hasher.finalize().into()
    }

    /// Build and Schnorr-sign an event.
    pub fn sign(
        keys: &NostrKeys,
        created_at: u64,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let pubkey = keys.public_hex();
        let id = Self::compute_id(&pubkey, created_at, kind, &tags, &content);
        let secp = Secp256k1::new();
        let sig = secp.sign_schnorr(&Message::from_digest(id), &keys.keypair);
        Self {
            id: hex::encode(id),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: sig.to_string(),
        }
    }

    /// Build an unsigned event (a rumor). The id is real; the signature is
    /// deliberately empty so possession of the rumor proves nothing.
    pub fn unsigned(
        pubkey_hex: String,
        created_at: u64,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let id = Self::compute_id(&pubkey_hex, created_at, kind, &tags, &content);
        Self {
            id: hex::encode(id),
            pubkey: pubkey_hex,
            created_at,
            kind,
            tags,
            content,
            sig: String::new(),
        }
    }

    /// Check the id and Schnorr signature.
    pub fn verify(&self) -> Result<(), NostrError> {
        let id = Self::compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(id) != self.id {
            return Err(NostrError::BadEventId);
        }
        let pubkey_bytes =
            hex::decode(&self.pubkey).map_err(|e| NostrError::BadKey(e.to_string()))?;
        let xonly = XOnlyPublicKey::from_slice(&pubkey_bytes)
            .map_err(|e| NostrError::BadKey(e.to_string()))?;
        let sig_bytes = hex::decode(&self.sig).map_err(|_| NostrError::BadSignature)?;
        let sig = Signature::from_slice(&sig_bytes).map_err(|_| NostrError::BadSignature)?;
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(&sig, &Message::from_digest(id), &xonly)
            .map_err(|_| NostrError::BadSignature)
    }

    /// First `p` tag, if any — the addressed recipient.
    pub fn recipient(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some("p"))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> NostrKeys {
        NostrKeys::from_secret_bytes(&[7u8; 32]).unwrap()
    }

    #[test]
    fn signed_event_verifies() {
        let event = NostrEvent::sign(
            &keys(),
            1_700_000_000,
            KIND_SEAL,
            vec![],
            "sealed".to_string(),
        );
        event.verify().unwrap();
    }

    #[test]
    fn tampered_content_fails_id_check() {
        let mut event = NostrEvent::sign(&keys(), 1_700_000_000, KIND_SEAL, vec![], "a".into());
        event.content = "b".into();
        assert!(matches!(event.verify(), Err(NostrError::BadEventId)));
    }

    #[test]
    fn forged_signature_fails() {
        let event = NostrEvent::sign(&keys(), 1_700_000_000, KIND_SEAL, vec![], "a".into());
        let other = NostrEvent::sign(
            &NostrKeys::from_secret_bytes(&[9u8; 32]).unwrap(),
            1_700_000_000,
            KIND_SEAL,
            vec![],
            "a".into(),
        );
        let mut forged = event.clone();
        forged.sig = other.sig;
        assert!(matches!(forged.verify(), Err(NostrError::BadSignature)));
    }

    #[test]
    fn deterministic_ids() {
        let a = NostrEvent::unsigned("ab".repeat(32), 5, KIND_RUMOR_DM, vec![], "x".into());
        let b = NostrEvent::unsigned("ab".repeat(32), 5, KIND_RUMOR_DM, vec![], "x".into());
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn recipient_reads_p_tag() {
        let tags = vec![
            vec!["e".to_string(), "irrelevant".to_string()],
            vec!["p".to_string(), "deadbeef".to_string()],
        ];
        let event = NostrEvent::sign(&keys(), 1, KIND_GIFT_WRAP, tags, String::new());
        assert_eq!(event.recipient(), Some("deadbeef"));
    }

    #[test]
    fn event_round_trips_through_json() {
        let event = NostrEvent::sign(&keys(), 99, KIND_GIFT_WRAP, vec![], "body".into());
        let json = serde_json::to_string(&event).unwrap();
        let parsed: NostrEvent = serde_json::from_str(&json).unwrap();
        parsed.verify().unwrap();
        assert_eq!(parsed.id, event.id);
    }
}
