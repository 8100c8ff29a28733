//! BLE mesh transport.
//!
//! The radio itself belongs to the host platform; the core drives it
//! through [`BlePlatform`] and owns everything above: discovery handling,
//! the connection table and its lifecycle, Noise handshakes on the link,
//! announce broadcasting, TTL-bounded relay, and fragmentation of
//! oversized frames.

mod connection;
mod transport;

pub use connection::{ConnId, ConnState, Connection};
pub use transport::BleTransport;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One advertisement sighting.
#[derive(Debug, Clone)]
pub struct Discovery {
    /// Opaque platform handle for the remote device.
    pub device: String,
    /// Which service UUID matched the scan set.
    pub service_uuid: Uuid,
    /// Signal strength, dBm.
    pub rssi: i16,
}

/// The host's BLE stack. Each device runs both roles at once: the
/// peripheral side advertises and accepts writes, the central side scans
/// and connects.
///
/// Implementations deliver notification bytes in arrival order per
/// connection and resolve `write_characteristic` when the remote end has
/// acknowledged the write.
#[async_trait]
pub trait BlePlatform: Send + Sync {
    /// Replace the advertised service set. The characteristic UUID is
    /// fixed for the life of the process.
    async fn advertise(&self, services: Vec<Uuid>, characteristic: Uuid) -> Result<(), BleError>;

    /// Replace the scan set. Discoveries for the new set flow to the
    /// returned stream; the previous stream goes quiet.
    async fn scan(&self, services: Vec<Uuid>) -> Result<mpsc::Receiver<Discovery>, BleError>;

    /// Open a GATT connection to a discovered device.
    async fn connect(&self, device: &str) -> Result<ConnId, BleError>;

    /// Write one chunk, resolving on acknowledgement.
    async fn write_characteristic(&self, conn: ConnId, bytes: &[u8]) -> Result<(), BleError>;

    /// Subscribe to notifications; bytes arrive in order, arbitrarily
    /// chunked.
    async fn subscribe_notifications(&self, conn: ConnId)
        -> Result<mpsc::Receiver<Vec<u8>>, BleError>;

    /// Negotiated MTU for a connection (writable payload per chunk).
    fn mtu(&self, conn: ConnId) -> usize;

    async fn disconnect(&self, conn: ConnId);
}

#[derive(Debug, Error)]
pub enum BleError {
    #[error("adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("connection {0} is gone")]
    ConnectionGone(ConnId),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("platform error: {0}")]
    Platform(String),
}
