//! Nostr internet transport.
//!
//! When two peers are mutual favorites and out of radio range, packets
//! travel as gift-wrapped private messages over public relays: the
//! encrypted core packet is embedded in a rumor (kind 14), sealed to the
//! recipient (kind 13), and wrapped under a throwaway key (kind 1059) so
//! relays see neither sender nor content.

pub mod event;
pub mod giftwrap;
pub mod nip44;
pub mod relay;
mod transport;

pub use event::{NostrEvent, NostrKeys};
pub use transport::NostrTransport;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NostrError {
    #[error("invalid key material: {0}")]
    BadKey(String),

    #[error("event signature invalid")]
    BadSignature,

    #[error("event id does not match content")]
    BadEventId,

    #[error("payload decryption failed")]
    DecryptFailed,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("no embedded packet in rumor")]
    NoEmbeddedPacket,

    #[error(transparent)]
    Wire(#[from] gapmesh_core::wire::WireError),
}
