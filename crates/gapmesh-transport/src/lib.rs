//! gapmesh-transport — the two packet carriers (BLE mesh, Nostr relays)
//! and the capability interface the router sees.
//!
//! Transports never call back into the node: they post typed events into
//! an mpsc channel the node owns and otherwise only answer reachability
//! queries and carry packets.

pub mod assembler;
pub mod ble;
pub mod nostr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use gapmesh_core::wire::{Packet, PeerId};

/// Which slot a transport occupies in the router's preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// BLE mesh — preferred whenever the peer is in radio range.
    Mesh,
    /// Relay network fallback.
    Internet,
    /// Reserved for additional carriers (for example WiFi-Aware); nothing
    /// in-tree registers one.
    Extra,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TransportKind::Mesh => "mesh",
            TransportKind::Internet => "internet",
            TransportKind::Extra => "extra",
        })
    }
}

/// Events a transport posts to the node.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound packet addressed to us or broadcast.
    /// NoiseEncrypted payloads arrive still encrypted; the controller owns
    /// the session registry and decrypts there.
    PacketReceived { packet: Packet, via: TransportKind },
    /// A peer became deliverable on this transport.
    PeerReachable { peer: PeerId, via: TransportKind },
    /// A peer stopped being deliverable on this transport.
    PeerLost { peer: PeerId, via: TransportKind },
    /// A Noise session completed on a transport that runs handshakes
    /// inline (the mesh). Carries the peer's static key for fingerprint
    /// checks.
    HandshakeEstablished {
        peer: PeerId,
        remote_static: [u8; 32],
        via: TransportKind,
    },
    /// Operator-visible condition (capacity eviction, relay trouble).
    SystemMessage { text: String },
}

pub type EventSender = mpsc::Sender<TransportEvent>;
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Capability interface the router depends on. Concrete transports are
/// registered as `Arc<dyn Transport>` in preference order.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Can a packet be handed to this transport for `peer` right now?
    fn is_peer_reachable(&self, peer: PeerId) -> bool;

    /// Carry one packet. `peer` None means broadcast (mesh flood or
    /// ephemeral channel). The call resolves when the transport has
    /// accepted the packet, not when the remote end has it.
    async fn send_packet(&self, peer: Option<PeerId>, packet: Packet) -> Result<(), TransportError>;

    /// Tear down every connection and background task.
    async fn shutdown(&self);
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not reachable on this transport")]
    NotReachable(PeerId),

    #[error("write to {0} timed out")]
    WriteTimeout(PeerId),

    #[error("transport is shut down")]
    Closed,

    #[error("packet could not be carried: {0}")]
    Fragmentation(#[from] gapmesh_core::fragment::FragmentError),

    #[error("no relay connection available")]
    NoRelay,

    #[error("peer has no known relay identity")]
    NoRelayIdentity(PeerId),

    #[error("{0}")]
    Platform(String),
}
