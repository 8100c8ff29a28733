//! Transport selection and queueing for outbound traffic.
//!
//! Transports register in preference order (mesh before internet). A
//! private send goes to the first transport reporting the peer reachable;
//! with none, user-visible messages wait in the outbox until any
//! transport reports the peer back. Receipts are best-effort and never
//! queued.

use std::sync::Arc;

use thiserror::Error;

use gapmesh_core::wire::{Packet, PeerId};
use gapmesh_transport::{Transport, TransportError, TransportKind};

use crate::outbox::{Enqueued, Outbox, OutboxEntry};

pub struct Router {
    transports: Vec<Arc<dyn Transport>>,
    outbox: Outbox,
}

impl Router {
    pub fn new(transports: Vec<Arc<dyn Transport>>, outbox: Outbox) -> Self {
        Self { transports, outbox }
    }

    /// The first transport, in preference order, that can deliver to
    /// `peer` right now.
    pub fn transport_for(&self, peer: PeerId) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.is_peer_reachable(peer))
    }

    pub fn is_peer_reachable(&self, peer: PeerId) -> bool {
        self.transport_for(peer).is_some()
    }

    /// Deliver a packet to one peer over the preferred transport.
    pub async fn send_to_peer(
        &self,
        peer: PeerId,
        packet: Packet,
    ) -> Result<TransportKind, RouterError> {
        let transport = self
            .transport_for(peer)
            .ok_or(RouterError::NoRoute(peer))?;
        let kind = transport.kind();
        transport.send_packet(Some(peer), packet).await?;
        tracing::debug!(peer = %peer, via = %kind, "packet routed");
        Ok(kind)
    }

    /// Best-effort delivery: receipts and other traffic that must never
    /// queue. Failures are logged and swallowed.
    pub async fn send_best_effort(&self, peer: PeerId, packet: Packet) {
        match self.send_to_peer(peer, packet).await {
            Ok(_) => {}
            Err(e) => tracing::debug!(peer = %peer, error = %e, "best-effort send dropped"),
        }
    }

    /// Flood a broadcast over every transport that will take it.
    pub async fn broadcast(&self, packet: Packet) {
        for transport in &self.transports {
            if let Err(e) = transport.send_packet(None, packet.clone()).await {
                tracing::debug!(via = %transport.kind(), error = %e, "broadcast skipped");
            }
        }
    }

    // ── Outbox ───────────────────────────────────────────────────────────────

    pub fn enqueue(&self, peer: PeerId, entry: OutboxEntry) -> Enqueued {
        tracing::debug!(peer = %peer, message_id = %entry.message_id, "message queued");
        self.outbox.enqueue(peer, entry)
    }

    /// Take everything queued for a peer that just became reachable.
    pub fn drain_outbox(&self, peer: PeerId) -> Vec<OutboxEntry> {
        self.outbox.drain(peer)
    }

    pub fn outbox_pending(&self, peer: PeerId) -> usize {
        self.outbox.pending_for(peer)
    }

    /// Age out stale entries.
    pub fn sweep_outbox(&self, now_millis: u64) -> Vec<(PeerId, OutboxEntry)> {
        self.outbox.sweep(now_millis)
    }

    pub fn clear_outbox(&self) {
        self.outbox.clear()
    }

    pub fn transports(&self) -> &[Arc<dyn Transport>] {
        &self.transports
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no transport can reach {0}")]
    NoRoute(PeerId),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gapmesh_core::wire::PacketType;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Scriptable transport for router tests.
    struct FakeTransport {
        kind: TransportKind,
        reachable: AtomicBool,
        sent: Mutex<Vec<(Option<PeerId>, Packet)>>,
    }

    impl FakeTransport {
        fn new(kind: TransportKind, reachable: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                reachable: AtomicBool::new(reachable),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn is_peer_reachable(&self, _peer: PeerId) -> bool {
            self.reachable.load(Ordering::Relaxed)
        }

        async fn send_packet(
            &self,
            peer: Option<PeerId>,
            packet: Packet,
        ) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((peer, packet));
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    fn packet() -> Packet {
        Packet::new(PacketType::Message, PeerId([1; 8]), 1, b"x".to_vec())
    }

    fn entry(id: &str) -> OutboxEntry {
        OutboxEntry {
            message_id: id.into(),
            text: "hi".into(),
            recipient_nickname: None,
            enqueued_at: 0,
        }
    }

    #[tokio::test]
    async fn prefers_first_reachable_transport() {
        let mesh = FakeTransport::new(TransportKind::Mesh, true);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        let router = Router::new(
            vec![mesh.clone() as Arc<dyn Transport>, internet.clone()],
            Outbox::new(10, 1_000_000),
        );

        let via = router.send_to_peer(PeerId([9; 8]), packet()).await.unwrap();
        assert_eq!(via, TransportKind::Mesh);
        assert_eq!(mesh.sent_count(), 1);
        assert_eq!(internet.sent_count(), 0);
    }

    #[tokio::test]
    async fn falls_back_when_mesh_unreachable() {
        let mesh = FakeTransport::new(TransportKind::Mesh, false);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        let router = Router::new(
            vec![mesh.clone() as Arc<dyn Transport>, internet.clone()],
            Outbox::new(10, 1_000_000),
        );

        let via = router.send_to_peer(PeerId([9; 8]), packet()).await.unwrap();
        assert_eq!(via, TransportKind::Internet);
        assert_eq!(internet.sent_count(), 1);
    }

    #[tokio::test]
    async fn no_route_is_an_error() {
        let mesh = FakeTransport::new(TransportKind::Mesh, false);
        let router = Router::new(vec![mesh as Arc<dyn Transport>], Outbox::new(10, 1_000_000));
        assert!(matches!(
            router.send_to_peer(PeerId([9; 8]), packet()).await,
            Err(RouterError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_hits_every_transport() {
        let mesh = FakeTransport::new(TransportKind::Mesh, true);
        let internet = FakeTransport::new(TransportKind::Internet, true);
        let router = Router::new(
            vec![mesh.clone() as Arc<dyn Transport>, internet.clone()],
            Outbox::new(10, 1_000_000),
        );
        router.broadcast(packet()).await;
        assert_eq!(mesh.sent_count(), 1);
        assert_eq!(internet.sent_count(), 1);
    }

    #[tokio::test]
    async fn outbox_round_trip() {
        let mesh = FakeTransport::new(TransportKind::Mesh, false);
        let router = Router::new(vec![mesh as Arc<dyn Transport>], Outbox::new(10, 1_000_000));
        let peer = PeerId([5; 8]);
        router.enqueue(peer, entry("m1"));
        router.enqueue(peer, entry("m2"));
        assert_eq!(router.outbox_pending(peer), 2);
        let drained = router.drain_outbox(peer);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].message_id, "m1");
        assert_eq!(router.outbox_pending(peer), 0);
    }
}
