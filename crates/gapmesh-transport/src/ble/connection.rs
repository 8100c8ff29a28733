//! Connection table entries for the BLE transport.

use gapmesh_core::wire::PeerId;
use tokio::sync::mpsc;

/// Platform handle for one GATT connection.
pub type ConnId = u64;

/// Lifecycle of a remote device, from sighting to teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Seen in an advertisement within the current window.
    Discovered,
    /// GATT connection initiated.
    Connecting,
    /// Characteristic discovered, notifications subscribed.
    Connected,
    /// Noise XX in progress on the link.
    Handshaking,
    /// Encrypted session up, announces exchanged.
    Ready,
    /// No data past the inactivity threshold; disconnect scheduled.
    Stale,
    /// Torn down.
    Disconnected,
}

/// One live connection.
pub struct Connection {
    pub state: ConnState,
    pub device: String,
    /// Learned from the first Announce or completed handshake.
    pub peer: Option<PeerId>,
    /// Monotonic ms of the last inbound or outbound activity.
    pub last_activity: u64,
    /// Padded frames queued for the per-connection writer task.
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Consecutive decode failures; past the threshold the connection is
    /// dropped.
    pub decode_errors: u32,
}

impl Connection {
    pub fn new(device: String, outbound: mpsc::Sender<Vec<u8>>, now_monotonic: u64) -> Self {
        Self {
            state: ConnState::Connected,
            device,
            peer: None,
            last_activity: now_monotonic,
            outbound,
            decode_errors: 0,
        }
    }

    pub fn touch(&mut self, now_monotonic: u64) {
        self.last_activity = now_monotonic;
        if self.state == ConnState::Stale {
            self.state = ConnState::Connected;
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ConnState::Ready)
    }

    /// Can this connection carry frames at all?
    pub fn is_live(&self) -> bool {
        !matches!(self.state, ConnState::Disconnected)
    }
}
