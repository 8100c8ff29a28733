//! Peer snapshot table — who is around, under what name, since when.

use std::sync::Arc;

use dashmap::DashMap;

use gapmesh_core::identity::Fingerprint;
use gapmesh_core::wire::PeerId;
use gapmesh_transport::TransportKind;

/// Tracked state for a known peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub nickname: String,
    /// Set once a Noise handshake has shown us their static key.
    pub fingerprint: Option<Fingerprint>,
    /// Ed25519 key from their announce, for signature checks.
    pub signing_key: Option<[u8; 32]>,
    /// Monotonic ms of the last sighting.
    pub last_seen: u64,
    /// Transport of the last sighting.
    pub via: TransportKind,
}

/// Shared peer table. Fed by announces and transport events; swept for
/// peers that went quiet.
#[derive(Clone)]
pub struct PeerTable {
    peers: Arc<DashMap<PeerId, PeerRecord>>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
        }
    }

    /// Record a sighting. Returns true when the peer is new.
    pub fn saw(
        &self,
        peer: PeerId,
        nickname: Option<&str>,
        via: TransportKind,
        now_monotonic: u64,
    ) -> bool {
        let mut is_new = false;
        self.peers
            .entry(peer)
            .and_modify(|record| {
                if let Some(name) = nickname {
                    record.nickname = name.to_string();
                }
                record.last_seen = now_monotonic;
                record.via = via;
            })
            .or_insert_with(|| {
                is_new = true;
                PeerRecord {
                    nickname: nickname.unwrap_or("anon").to_string(),
                    fingerprint: None,
                    signing_key: None,
                    last_seen: now_monotonic,
                    via,
                }
            });
        is_new
    }

    pub fn set_fingerprint(&self, peer: PeerId, fingerprint: Fingerprint) {
        if let Some(mut record) = self.peers.get_mut(&peer) {
            record.fingerprint = Some(fingerprint);
        }
    }

    pub fn set_signing_key(&self, peer: PeerId, key: [u8; 32]) {
        if let Some(mut record) = self.peers.get_mut(&peer) {
            record.signing_key = Some(key);
        }
    }

    pub fn get(&self, peer: PeerId) -> Option<PeerRecord> {
        self.peers.get(&peer).map(|r| r.clone())
    }

    pub fn nickname(&self, peer: PeerId) -> Option<String> {
        self.peers.get(&peer).map(|r| r.nickname.clone())
    }

    /// Find a peer by nickname (first match).
    pub fn by_nickname(&self, nickname: &str) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|entry| entry.value().nickname == nickname)
            .map(|entry| *entry.key())
    }

    pub fn remove(&self, peer: PeerId) -> bool {
        self.peers.remove(&peer).is_some()
    }

    pub fn list(&self) -> Vec<(PeerId, PeerRecord)> {
        self.peers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Drop peers unseen for `max_idle_millis`; returns who disappeared.
    pub fn sweep(&self, now_monotonic: u64, max_idle_millis: u64) -> Vec<PeerId> {
        let cutoff = now_monotonic.saturating_sub(max_idle_millis);
        let gone: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| entry.value().last_seen < cutoff)
            .map(|entry| *entry.key())
            .collect();
        for peer in &gone {
            self.peers.remove(peer);
        }
        gone
    }

    pub fn clear(&self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
