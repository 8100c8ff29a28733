//! Device identity — long-term keys, fingerprints, and panic wipe.
//!
//! Two keypairs define an identity: the static X25519 key that anchors
//! Noise sessions (and whose first 8 bytes are the mesh address) and the
//! Ed25519 key that signs broadcast packets. Both persist through the
//! injected keychain; the core never touches storage directly.

use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use zeroize::Zeroizing;

use crate::crypto::{sha256, Keypair};
use crate::platform::Keychain;
use crate::wire::{Packet, PeerId};

/// Keychain slots. The favorites blob shares the store (see the node
/// crate) but identity owns these two.
pub const KEYCHAIN_STATIC: &str = "identity/static";
pub const KEYCHAIN_SIGNING: &str = "identity/signing";

// ── Fingerprint ───────────────────────────────────────────────────────────────

/// Stable user-visible identity: hex SHA-256 of a static public key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn of_public_key(key: &[u8; 32]) -> Self {
        Self(hex::encode(sha256(key)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for logs.
    pub fn short(&self) -> &str {
        &self.0[..16.min(self.0.len())]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

// ── Identity store ────────────────────────────────────────────────────────────

/// Owns the device's keys for one run. Loads from the keychain on startup,
/// generates and persists fresh keys on first run or after a wipe.
pub struct IdentityStore {
    keychain: Arc<dyn Keychain>,
    static_keys: Keypair,
    signing: SigningKey,
}

impl IdentityStore {
    /// Load or create the device identity.
    pub fn open(keychain: Arc<dyn Keychain>) -> Self {
        let static_keys = match load_key32(&*keychain, KEYCHAIN_STATIC) {
            Some(bytes) => Keypair::from_private(*bytes),
            None => {
                let fresh = Keypair::generate();
                keychain.set(KEYCHAIN_STATIC, &*fresh.private_bytes());
                tracing::info!("generated new static identity key");
                fresh
            }
        };

        let signing = match load_key32(&*keychain, KEYCHAIN_SIGNING) {
            Some(bytes) => SigningKey::from_bytes(&bytes),
            None => {
                let fresh = SigningKey::generate(&mut rand::thread_rng());
                keychain.set(KEYCHAIN_SIGNING, fresh.as_bytes());
                tracing::info!("generated new signing key");
                fresh
            }
        };

        Self {
            keychain,
            static_keys,
            signing,
        }
    }

    /// Our mesh address.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.static_keys.public)
    }

    /// Our static public key, as sent inside the Noise handshake.
    pub fn static_public(&self) -> [u8; 32] {
        self.static_keys.public
    }

    /// Our user-visible fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_public_key(&self.static_keys.public)
    }

    /// The Noise keypair for handshakes.
    pub fn noise_keypair(&self) -> &Keypair {
        &self.static_keys
    }

    /// Deterministic secret for the relay-network identity. Rotates with
    /// the static key (and therefore on panic wipe).
    pub fn nostr_secret(&self) -> Zeroizing<[u8; 32]> {
        self.static_keys.derive_subkey(b"gapmesh-nostr-identity-v1")
    }

    /// Our Ed25519 verify key, for peers that want to check our announces.
    pub fn signing_public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Sign a packet's header + payload.
    pub fn sign_packet(&self, packet: &Packet) -> [u8; 64] {
        self.signing.sign(&packet.signing_bytes()).to_bytes()
    }

    /// Verify a signed packet against a known Ed25519 public key.
    pub fn verify_packet(packet: &Packet, signer_public: &[u8; 32]) -> bool {
        let Some(signature) = packet.signature else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(signer_public) else {
            return false;
        };
        key.verify(&packet.signing_bytes(), &Signature::from_bytes(&signature))
            .is_ok()
    }

    /// Panic wipe: destroy every keychain entry — identity, favorites,
    /// everything — synchronously. In-memory session state is the caller's
    /// responsibility (the controller tears that down in the same breath).
    /// The next [`IdentityStore::open`] mints a brand-new identity.
    pub fn panic_wipe(&self) {
        self.keychain.wipe_all();
        tracing::warn!("panic wipe: all keychain state destroyed");
    }
}

fn load_key32(keychain: &dyn Keychain, slot: &str) -> Option<Zeroizing<[u8; 32]>> {
    let bytes = keychain.get(slot)?;
    if bytes.len() != 32 {
        tracing::warn!(slot, len = bytes.len(), "keychain entry has wrong size, regenerating");
        return None;
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryKeychain;
    use crate::wire::{PacketType, VERSION_2};

    fn store() -> (Arc<MemoryKeychain>, IdentityStore) {
        let keychain = Arc::new(MemoryKeychain::new());
        let identity = IdentityStore::open(keychain.clone());
        (keychain, identity)
    }

    #[test]
    fn identity_persists_across_opens() {
        let (keychain, first) = store();
        let second = IdentityStore::open(keychain);
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.signing_public(), second.signing_public());
    }

    #[test]
    fn peer_id_is_public_key_prefix() {
        let (_, identity) = store();
        assert_eq!(
            identity.peer_id().as_bytes(),
            &identity.static_public()[..8]
        );
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let (_, identity) = store();
        let fp = identity.fingerprint();
        assert_eq!(fp.as_str().len(), 64);
        assert_eq!(fp, Fingerprint::of_public_key(&identity.static_public()));
    }

    #[test]
    fn sign_and_verify_packet() {
        let (_, identity) = store();
        let mut packet = Packet::new(
            PacketType::Announce,
            identity.peer_id(),
            123_456,
            b"{\"nickname\":\"anon\"}".to_vec(),
        );
        packet.version = VERSION_2;
        packet.signature = Some(identity.sign_packet(&packet));

        assert!(IdentityStore::verify_packet(&packet, &identity.signing_public()));

        let mut tampered = packet.clone();
        tampered.payload[2] ^= 0xff;
        assert!(!IdentityStore::verify_packet(&tampered, &identity.signing_public()));
    }

    #[test]
    fn unsigned_packet_never_verifies() {
        let (_, identity) = store();
        let packet = Packet::new(PacketType::Message, identity.peer_id(), 1, b"x".to_vec());
        assert!(!IdentityStore::verify_packet(&packet, &identity.signing_public()));
    }

    #[test]
    fn panic_wipe_rotates_identity() {
        let (keychain, first) = store();
        let old_peer = first.peer_id();
        let old_fp = first.fingerprint();

        first.panic_wipe();
        assert!(keychain.get(KEYCHAIN_STATIC).is_none());
        assert!(keychain.get(KEYCHAIN_SIGNING).is_none());

        let reborn = IdentityStore::open(keychain);
        assert_ne!(reborn.peer_id(), old_peer);
        assert_ne!(reborn.fingerprint(), old_fp);
    }
}
