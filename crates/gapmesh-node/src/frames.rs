//! Private frames — what travels inside a Noise session.
//!
//! Every NoiseEncrypted packet's plaintext is one of these kind-tagged
//! JSON envelopes. JSON keeps the set extensible without another binary
//! format; the envelope is already inside authenticated encryption, so
//! self-description costs nothing security-wise.

use serde::{Deserialize, Serialize};

use gapmesh_core::platform::SecureRandom;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PrivateFrame {
    /// A user-visible message.
    Message { id: String, text: String },
    /// The peer's device has the message.
    DeliveryAck { message_id: String },
    /// The peer's user has seen the message.
    ReadAck { message_id: String },
    /// Local (un)favorite assertion, with our relay identity when we are
    /// willing to be reached over the internet.
    FavoriteNotification {
        is_favorite: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        nostr_pubkey: Option<String>,
    },
}

impl PrivateFrame {
    pub fn encode(&self) -> Vec<u8> {
        // Serialization of these enums cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Random 128-bit message id, hex.
pub fn new_message_id(rng: &dyn SecureRandom) -> String {
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes);
    hex::encode(bytes)
}
