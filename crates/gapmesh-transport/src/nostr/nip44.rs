//! NIP-44 v2 payload encryption for seals and wraps.
//!
//! Conversation key: HKDF-SHA256 extract with salt `nip44-v2` over the
//! ECDH x-coordinate of (sender secret, recipient public). Payload:
//! version byte 2, a random 24-byte nonce, then XChaCha20-Poly1305
//! ciphertext, all base64.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use secp256k1::SecretKey;
use sha2::Sha256;

use super::event::point_from_hex;
use super::NostrError;

const VERSION: u8 = 2;
const NONCE_LEN: usize = 24;

/// Shared conversation key for one (secret, public) pair. Symmetric: both
/// directions derive the same key.
pub fn conversation_key(secret: &SecretKey, their_pubkey_hex: &str) -> Result<[u8; 32], NostrError> {
    let point = point_from_hex(their_pubkey_hex)?;
    let shared = secp256k1::ecdh::shared_secret_point(&point, secret);
    // x-coordinate only; the y half adds nothing.
    let (prk, _hk) = Hkdf::<Sha256>::extract(Some(b"nip44-v2"), &shared[..32]);
    Ok(prk.into())
}

/// Encrypt `plaintext` to a base64 NIP-44 v2 payload.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<String, NostrError> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| NostrError::DecryptFailed)?;

    let mut payload = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    payload.push(VERSION);
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(payload))
}

/// Decrypt a base64 NIP-44 v2 payload.
pub fn decrypt(key: &[u8; 32], payload_b64: &str) -> Result<Vec<u8>, NostrError> {
    let payload = BASE64
        .decode(payload_b64)
        .map_err(|e| NostrError::Malformed(e.to_string()))?;
    if payload.len() < 1 + NONCE_LEN + 16 {
        return Err(NostrError::Malformed("payload too short".into()));
    }
    if payload[0] != VERSION {
        return Err(NostrError::Malformed(format!(
            "unsupported payload version {}",
            payload[0]
        )));
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            XNonce::from_slice(&payload[1..1 + NONCE_LEN]),
            &payload[1 + NONCE_LEN..],
        )
        .map_err(|_| NostrError::DecryptFailed)
}
