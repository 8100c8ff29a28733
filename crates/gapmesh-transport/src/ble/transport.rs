//! The BLE mesh transport proper: connection lifecycle, announce loop,
//! rotation-driven advertise/scan sets, inline Noise handshakes, relay,
//! and fragment-aware outbound framing.
//!
//! One task owns the main loop (discoveries + timers); every connection
//! gets a reader task (notifications → assembler → packets) and a writer
//! task (padded frames → MTU-sized acknowledged writes). Nothing here
//! holds a lock across an await.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use gapmesh_core::config::{LimitsConfig, MeshConfig};
use gapmesh_core::dedup::SeenCache;
use gapmesh_core::fragment::{self, Reassembler};
use gapmesh_core::identity::IdentityStore;
use gapmesh_core::noise::NoiseRegistry;
use gapmesh_core::padding;
use gapmesh_core::platform::{Clock, SecureRandom};
use gapmesh_core::rotation;
use gapmesh_core::wire::{self, Packet, PacketType, PeerId};

use crate::assembler::StreamAssembler;
use crate::{EventSender, Transport, TransportError, TransportEvent, TransportKind};

use super::connection::{ConnId, ConnState, Connection};
use super::{BlePlatform, Discovery};

/// A BLE write that has not acknowledged within this window has failed.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Frames above the largest padding block are fragmented down to it.
const FRAGMENT_THRESHOLD: usize = padding::MAX_BLOCK;

/// Queue depth of padded frames per connection.
const OUTBOUND_QUEUE: usize = 32;

pub struct BleTransport {
    inner: Arc<Inner>,
}

struct Inner {
    platform: Arc<dyn BlePlatform>,
    identity: Arc<IdentityStore>,
    noise: Arc<NoiseRegistry>,
    seen: Arc<SeenCache>,
    reassembler: Reassembler,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn SecureRandom>,
    mesh: MeshConfig,
    limits: LimitsConfig,
    connections: DashMap<ConnId, Connection>,
    peer_conns: DashMap<PeerId, ConnId>,
    events: EventSender,
    nickname: std::sync::RwLock<String>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl BleTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        identity: Arc<IdentityStore>,
        noise: Arc<NoiseRegistry>,
        seen: Arc<SeenCache>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn SecureRandom>,
        mesh: MeshConfig,
        limits: LimitsConfig,
        events: EventSender,
        nickname: String,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                platform,
                identity,
                noise,
                seen,
                reassembler: Reassembler::new(),
                clock,
                rng,
                mesh,
                limits,
                connections: DashMap::new(),
                peer_conns: DashMap::new(),
                events,
                nickname: std::sync::RwLock::new(nickname),
                shutdown,
                running: AtomicBool::new(true),
            }),
        }
    }

    /// Spawn the advertise/scan/announce/sweep loop.
    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.run().await {
                tracing::error!(error = %e, "ble transport loop exited");
            }
        });
    }

    /// Update the nickname used in announces; the next announce carries it
    /// immediately.
    pub async fn set_nickname(&self, nickname: String) {
        *self.inner.nickname.write().unwrap_or_else(|e| e.into_inner()) = nickname;
        self.inner.announce_all().await;
    }

    /// Peers currently mapped to a live connection.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.peer_conns.iter().map(|e| *e.key()).collect()
    }
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mesh
    }

    fn is_peer_reachable(&self, peer: PeerId) -> bool {
        let Some(conn_id) = self.inner.peer_conns.get(&peer).map(|e| *e.value()) else {
            return false;
        };
        self.inner
            .connections
            .get(&conn_id)
            .map(|c| c.is_live())
            .unwrap_or(false)
    }

    async fn send_packet(&self, peer: Option<PeerId>, packet: Packet) -> Result<(), TransportError> {
        if !self.inner.running.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        match peer {
            Some(peer) => {
                let Some(conn_id) = self.inner.peer_conns.get(&peer).map(|e| *e.value()) else {
                    return Err(TransportError::NotReachable(peer));
                };
                self.inner.send_to_conn(conn_id, &packet).await
            }
            None => {
                self.inner.broadcast(&packet, None).await;
                Ok(())
            }
        }
    }

    async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        let _ = self.inner.shutdown.send(());
        let conn_ids: Vec<ConnId> = self.inner.connections.iter().map(|e| *e.key()).collect();
        for conn_id in conn_ids {
            self.inner.drop_connection(conn_id, "shutdown").await;
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut shutdown = self.shutdown.subscribe();

        // Initial advertise + scan per the current rotation bucket.
        let mut advertised = self.apply_advertise().await;
        let mut scan_set = rotation::scan_uuids(self.clock.now_millis(), self.mesh.legacy_uuid_compat);
        let mut discoveries = self
            .platform
            .scan(scan_set.clone())
            .await
            .context("initial scan failed")?;

        let mut rotation_tick = tokio::time::interval(Duration::from_secs(30));
        let mut announce_tick =
            tokio::time::interval(Duration::from_secs(self.mesh.announce_interval_secs.max(1)));
        let mut sweep_tick = tokio::time::interval(Duration::from_secs(5));

        loop {
            // The discovery stream cannot be replaced inside the select
            // (its recv future borrows it), so arms only request a rescan.
            let mut rescan = false;

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("ble transport shutting down");
                    return Ok(());
                }

                _ = rotation_tick.tick() => {
                    let now = self.clock.now_millis();
                    let next_adv = rotation::advertise_uuids(now, self.mesh.legacy_uuid_compat);
                    if next_adv != advertised {
                        advertised = self.apply_advertise().await;
                    }
                    let next_scan = rotation::scan_uuids(now, self.mesh.legacy_uuid_compat);
                    if next_scan != scan_set {
                        scan_set = next_scan;
                        rescan = true;
                    }
                }

                _ = announce_tick.tick() => {
                    self.announce_all().await;
                }

                _ = sweep_tick.tick() => {
                    self.sweep().await;
                }

                discovery = discoveries.recv() => {
                    match discovery {
                        Some(d) => self.on_discovery(d).await,
                        // The platform replaced the stream; resubscribe.
                        None => rescan = true,
                    }
                }
            }

            if rescan {
                match self.platform.scan(scan_set.clone()).await {
                    Ok(rx) => discoveries = rx,
                    Err(e) => {
                        tracing::warn!(error = %e, "scan set update failed");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
        }
    }

    async fn apply_advertise(&self) -> Vec<uuid::Uuid> {
        let uuids =
            rotation::advertise_uuids(self.clock.now_millis(), self.mesh.legacy_uuid_compat);
        if let Err(e) = self
            .platform
            .advertise(uuids.clone(), rotation::CHARACTERISTIC_UUID)
            .await
        {
            tracing::warn!(error = %e, "advertise failed");
        }
        uuids
    }

    // ── Discovery and connection setup ───────────────────────────────────────

    async fn on_discovery(self: &Arc<Self>, discovery: Discovery) {
        let already_connected = self
            .connections
            .iter()
            .any(|entry| entry.value().device == discovery.device && entry.value().is_live());
        if already_connected {
            return;
        }

        tracing::debug!(device = %discovery.device, rssi = discovery.rssi, "peer discovered");

        let conn_id = match self.platform.connect(&discovery.device).await {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(device = %discovery.device, error = %e, "connect failed");
                return;
            }
        };

        let notifications = match self.platform.subscribe_notifications(conn_id).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(conn_id, error = %e, "subscribe failed");
                self.platform.disconnect(conn_id).await;
                return;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
        let connection = Connection::new(
            discovery.device.clone(),
            outbound_tx,
            self.clock.monotonic_millis(),
        );
        self.connections.insert(conn_id, connection);
        tracing::info!(conn_id, device = %discovery.device, "connection up");

        self.spawn_writer(conn_id, outbound_rx);
        self.spawn_reader(conn_id, notifications);

        // Introduce ourselves right away so the peer can map this link.
        self.send_announce(conn_id).await;
    }

    fn spawn_writer(self: &Arc<Self>, conn_id: ConnId, mut frames: mpsc::Receiver<Vec<u8>>) {
        let inner = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let mtu = inner.platform.mtu(conn_id).max(20);
                for chunk in frame.chunks(mtu) {
                    match timeout(WRITE_DEADLINE, inner.platform.write_characteristic(conn_id, chunk))
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(conn_id, error = %e, "write failed");
                            inner.drop_connection(conn_id, "write failure").await;
                            return;
                        }
                        Err(_) => {
                            tracing::warn!(conn_id, "write timed out");
                            inner.drop_connection(conn_id, "write timeout").await;
                            return;
                        }
                    }
                }
                if let Some(mut conn) = inner.connections.get_mut(&conn_id) {
                    conn.touch(inner.clock.monotonic_millis());
                }
            }
        });
    }

    fn spawn_reader(self: &Arc<Self>, conn_id: ConnId, mut notifications: mpsc::Receiver<Vec<u8>>) {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut assembler = StreamAssembler::new(
                inner.limits.assembler_stall_millis,
                inner.limits.max_payload + 4096,
            );
            while let Some(chunk) = notifications.recv().await {
                let outcome = assembler.append(&chunk, inner.clock.monotonic_millis());
                if outcome.dropped_prefix > 0 {
                    tracing::debug!(conn_id, dropped = outcome.dropped_prefix, "resynced stream");
                }
                if outcome.did_reset {
                    tracing::warn!(conn_id, "stream assembler reset");
                }
                for frame in outcome.frames {
                    inner.on_frame(conn_id, &frame).await;
                }
            }
            // Notification stream closed: the platform dropped the link.
            inner.drop_connection(conn_id, "notification stream closed").await;
        });
    }

    // ── Inbound path ─────────────────────────────────────────────────────────

    async fn on_frame(self: &Arc<Self>, conn_id: ConnId, frame: &[u8]) {
        let packet = match wire::decode_with_cap(frame, self.limits.max_payload) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(conn_id, error = %e, "frame decode failed");
                let errors = self
                    .connections
                    .get_mut(&conn_id)
                    .map(|mut c| {
                        c.decode_errors += 1;
                        c.decode_errors
                    })
                    .unwrap_or(0);
                if errors >= self.limits.decode_error_threshold {
                    self.drop_connection(conn_id, "too many decode errors").await;
                }
                return;
            }
        };

        if let Some(mut conn) = self.connections.get_mut(&conn_id) {
            conn.decode_errors = 0;
            conn.touch(self.clock.monotonic_millis());
        }

        if packet.sender_id == self.identity.peer_id() {
            // Our own flood came back around.
            return;
        }

        self.handle_packet(conn_id, packet).await;
    }

    async fn handle_packet(self: &Arc<Self>, conn_id: ConnId, packet: Packet) {
        let our_id = self.identity.peer_id();
        let addressed_to_us = packet.recipient_id == Some(our_id);

        // Dedup. Fragments key on their transfer piece; directed Noise
        // traffic to us skips the flood filter (the replay window already
        // handles duplicates there).
        let first_sighting = match packet.packet_type {
            PacketType::Fragment => match fragment::parse_fragment(&packet.payload) {
                Ok(piece) => self.seen.insert(&fragment::fragment_fingerprint(&piece)),
                Err(e) => {
                    tracing::debug!(conn_id, error = %e, "malformed fragment");
                    return;
                }
            },
            PacketType::NoiseHandshake | PacketType::NoiseEncrypted if addressed_to_us => true,
            _ => self.seen.insert(&packet.dedup_fingerprint()),
        };
        if !first_sighting {
            return;
        }

        // Local consumption.
        match packet.packet_type {
            PacketType::NoiseHandshake if addressed_to_us => {
                self.on_handshake(conn_id, &packet).await;
            }
            PacketType::Fragment if addressed_to_us || packet.recipient_id.is_none() => {
                match self
                    .reassembler
                    .accept(&packet, self.clock.monotonic_millis())
                {
                    Ok(Some(original)) => {
                        Box::pin(self.handle_packet(conn_id, original)).await;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::debug!(conn_id, error = %e, "reassembly failed"),
                }
            }
            PacketType::Announce => {
                self.on_announce(conn_id, &packet).await;
                self.forward_event(&packet).await;
            }
            PacketType::Leave => {
                if let Some(conn_id) = self.peer_conns.remove(&packet.sender_id).map(|(_, v)| v) {
                    if let Some(mut conn) = self.connections.get_mut(&conn_id) {
                        conn.peer = None;
                    }
                }
                let _ = self
                    .events
                    .send(TransportEvent::PeerLost {
                        peer: packet.sender_id,
                        via: TransportKind::Mesh,
                    })
                    .await;
                self.forward_event(&packet).await;
            }
            PacketType::Message | PacketType::RequestSync | PacketType::FileTransfer => {
                if addressed_to_us || packet.recipient_id.is_none() {
                    self.forward_event(&packet).await;
                }
            }
            PacketType::NoiseEncrypted => {
                if addressed_to_us {
                    self.forward_event(&packet).await;
                }
            }
            _ => {}
        }

        // Relay decision: flood anything still alive that is not ours to
        // keep. TTL 0 dies here; packets addressed to this device stop
        // here.
        if packet.ttl > 0 && !addressed_to_us {
            let mut relayed = packet.clone();
            relayed.ttl -= 1;
            self.broadcast(&relayed, Some(conn_id)).await;
        }
    }

    async fn forward_event(&self, packet: &Packet) {
        let _ = self
            .events
            .send(TransportEvent::PacketReceived {
                packet: packet.clone(),
                via: TransportKind::Mesh,
            })
            .await;
    }

    async fn on_handshake(self: &Arc<Self>, conn_id: ConnId, packet: &Packet) {
        let peer = packet.sender_id;
        if let Some(mut conn) = self.connections.get_mut(&conn_id) {
            if conn.state == ConnState::Connected {
                conn.state = ConnState::Handshaking;
            }
        }

        match self.noise.process_handshake(peer, &packet.payload) {
            Ok(outcome) => {
                if let Some(reply) = outcome.reply {
                    let reply_packet = self.directed_packet(PacketType::NoiseHandshake, peer, reply);
                    if let Err(e) = self.send_to_conn(conn_id, &reply_packet).await {
                        tracing::warn!(conn_id, error = %e, "handshake reply send failed");
                    }
                }
                if let Some(remote_static) = outcome.established {
                    self.mark_ready(conn_id, peer).await;
                    let _ = self
                        .events
                        .send(TransportEvent::HandshakeEstablished {
                            peer,
                            remote_static,
                            via: TransportKind::Mesh,
                        })
                        .await;
                }
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "handshake processing failed");
            }
        }
    }

    async fn on_announce(self: &Arc<Self>, conn_id: ConnId, packet: &Packet) {
        let peer = packet.sender_id;
        let newly_mapped = self
            .peer_conns
            .insert(peer, conn_id)
            .map(|old| old != conn_id)
            .unwrap_or(true);
        if let Some(mut conn) = self.connections.get_mut(&conn_id) {
            conn.peer = Some(peer);
        }

        if newly_mapped {
            tracing::info!(peer = %peer, conn_id, "peer mapped to connection");
            let _ = self
                .events
                .send(TransportEvent::PeerReachable {
                    peer,
                    via: TransportKind::Mesh,
                })
                .await;
        }

        // The lower mesh address starts the handshake; the other side
        // answers. The registry's tie-break covers the races.
        if self.noise.handshake_required(peer)
            && !self.noise.handshake_in_flight(peer)
            && self.identity.peer_id() < peer
        {
            match self.noise.initiate_handshake(peer) {
                Ok(msg1) => {
                    let packet = self.directed_packet(PacketType::NoiseHandshake, peer, msg1);
                    if let Err(e) = self.send_to_conn(conn_id, &packet).await {
                        tracing::warn!(peer = %peer, error = %e, "handshake start failed");
                    }
                    if let Some(mut conn) = self.connections.get_mut(&conn_id) {
                        conn.state = ConnState::Handshaking;
                    }
                }
                Err(e) => tracing::debug!(peer = %peer, error = %e, "handshake not started"),
            }
        }
    }

    async fn mark_ready(&self, conn_id: ConnId, peer: PeerId) {
        self.peer_conns.insert(peer, conn_id);
        if let Some(mut conn) = self.connections.get_mut(&conn_id) {
            conn.peer = Some(peer);
            conn.state = ConnState::Ready;
        }
    }

    // ── Outbound path ────────────────────────────────────────────────────────

    fn directed_packet(&self, packet_type: PacketType, peer: PeerId, payload: Vec<u8>) -> Packet {
        Packet::new(
            packet_type,
            self.identity.peer_id(),
            self.clock.now_millis(),
            payload,
        )
        .with_recipient(peer)
        .with_ttl(wire::MAX_TTL)
    }

    /// Frame one packet for the wire: fragment above the block ceiling,
    /// then pad each piece.
    fn frames_for(&self, packet: &Packet) -> Result<Vec<Vec<u8>>, TransportError> {
        let pieces = fragment::split(packet, FRAGMENT_THRESHOLD, &*self.rng)?;
        Ok(pieces
            .iter()
            .map(|piece| padding::pad(&wire::encode(piece)))
            .collect())
    }

    async fn send_to_conn(&self, conn_id: ConnId, packet: &Packet) -> Result<(), TransportError> {
        let outbound = self
            .connections
            .get(&conn_id)
            .filter(|c| c.is_live())
            .map(|c| c.outbound.clone())
            .ok_or(TransportError::NotReachable(
                packet.recipient_id.unwrap_or(packet.sender_id),
            ))?;
        for frame in self.frames_for(packet)? {
            if outbound.send(frame).await.is_err() {
                return Err(TransportError::Closed);
            }
        }
        Ok(())
    }

    /// Send to every live connection except `skip`.
    async fn broadcast(&self, packet: &Packet, skip: Option<ConnId>) {
        let frames = match self.frames_for(packet) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::warn!(error = %e, "broadcast framing failed");
                return;
            }
        };
        let targets: Vec<(ConnId, mpsc::Sender<Vec<u8>>)> = self
            .connections
            .iter()
            .filter(|entry| Some(*entry.key()) != skip && entry.value().is_live())
            .map(|entry| (*entry.key(), entry.value().outbound.clone()))
            .collect();
        for (conn_id, outbound) in targets {
            for frame in &frames {
                if outbound.send(frame.clone()).await.is_err() {
                    tracing::debug!(conn_id, "outbound queue closed");
                    break;
                }
            }
        }
    }

    async fn send_announce(&self, conn_id: ConnId) {
        let packet = self.announce_packet();
        if let Err(e) = self.send_to_conn(conn_id, &packet).await {
            tracing::debug!(conn_id, error = %e, "announce send failed");
        }
    }

    async fn announce_all(&self) {
        let packet = self.announce_packet();
        self.broadcast(&packet, None).await;
    }

    fn announce_packet(&self) -> Packet {
        let nickname = self
            .nickname
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let payload = serde_json::json!({
            "nickname": nickname,
            "signing_key": hex::encode(self.identity.signing_public()),
        })
        .to_string()
        .into_bytes();
        let mut packet = Packet::new(
            PacketType::Announce,
            self.identity.peer_id(),
            self.clock.now_millis(),
            payload,
        );
        packet.signature = Some(self.identity.sign_packet(&packet));
        packet
    }

    // ── Housekeeping ─────────────────────────────────────────────────────────

    async fn sweep(self: &Arc<Self>) {
        let now = self.clock.monotonic_millis();
        let stale_after = self.mesh.inactivity_timeout_secs * 1000;

        let mut to_drop = Vec::new();
        for mut entry in self.connections.iter_mut() {
            let idle = now.saturating_sub(entry.value().last_activity);
            match entry.value().state {
                ConnState::Stale if idle >= stale_after * 2 => to_drop.push(*entry.key()),
                state if state != ConnState::Stale && idle >= stale_after => {
                    tracing::debug!(conn_id = *entry.key(), "connection stale");
                    entry.value_mut().state = ConnState::Stale;
                }
                _ => {}
            }
        }
        for conn_id in to_drop {
            self.drop_connection(conn_id, "inactivity").await;
        }

        self.reassembler.sweep(now);
        for peer in self.noise.sweep_stale_handshakes() {
            tracing::debug!(peer = %peer, "stale handshake dropped");
        }
    }

    async fn drop_connection(&self, conn_id: ConnId, reason: &str) {
        let Some((_, conn)) = self.connections.remove(&conn_id) else {
            return;
        };
        tracing::info!(conn_id, reason, "connection torn down");
        self.platform.disconnect(conn_id).await;

        if let Some(peer) = conn.peer {
            let still_current = self
                .peer_conns
                .get(&peer)
                .map(|e| *e.value() == conn_id)
                .unwrap_or(false);
            if still_current {
                self.peer_conns.remove(&peer);
                let _ = self
                    .events
                    .send(TransportEvent::PeerLost {
                        peer,
                        via: TransportKind::Mesh,
                    })
                    .await;
            }
        }
    }
}
