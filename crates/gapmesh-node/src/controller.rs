//! The session controller — the only surface applications see.
//!
//! Owns the identity, the Noise registry, the router, the peer table and
//! favorites, consumes every transport's event stream, and emits typed
//! application events. Transports never see the application; the
//! application never sees a transport.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use gapmesh_core::identity::{Fingerprint, IdentityStore};
use gapmesh_core::dedup::SeenCache;
use gapmesh_core::noise::{NoiseError, NoiseRegistry};
use gapmesh_core::platform::{Clock, Notifier, SecureRandom};
use gapmesh_core::wire::{Packet, PacketType, PeerId};
use gapmesh_transport::ble::BleTransport;
use gapmesh_transport::nostr::NostrTransport;
use gapmesh_transport::{EventReceiver, TransportEvent, TransportKind};

use crate::frames::{new_message_id, PrivateFrame};
use crate::favorites::FavoritesBook;
use crate::outbox::OutboxEntry;
use crate::peers::PeerTable;
use crate::router::{Router, RouterError};

/// Events the application receives.
#[derive(Debug)]
pub enum AppEvent {
    PeerAppeared { peer: PeerId, nickname: String },
    PeerDisappeared { peer: PeerId },
    MessageReceived {
        from: PeerId,
        text: String,
        via: TransportKind,
        private: bool,
    },
    NoiseHandshakeComplete { peer: PeerId, fingerprint: Fingerprint },
    DeliveryAck { message_id: String, from: PeerId },
    ReadAck { message_id: String, from: PeerId },
    SystemMessage { text: String },
}

pub struct SessionController {
    identity: Arc<IdentityStore>,
    noise: Arc<NoiseRegistry>,
    router: Arc<Router>,
    peers: PeerTable,
    favorites: Arc<FavoritesBook>,
    seen: Arc<SeenCache>,
    clock: Arc<dyn Clock>,
    rng: Arc<dyn SecureRandom>,
    /// Concrete handles for operations the capability trait cannot carry
    /// (nickname announces, relay identity bookkeeping). Either may be
    /// absent in reduced deployments and tests.
    mesh: Option<Arc<BleTransport>>,
    internet: Option<Arc<NostrTransport>>,
    /// Host notification sink; private messages surface here as well as
    /// through the event stream.
    notifier: Option<Arc<dyn Notifier>>,
    app_events: mpsc::Sender<AppEvent>,
    shutdown: broadcast::Sender<()>,
}

impl SessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<IdentityStore>,
        noise: Arc<NoiseRegistry>,
        router: Arc<Router>,
        peers: PeerTable,
        favorites: Arc<FavoritesBook>,
        seen: Arc<SeenCache>,
        clock: Arc<dyn Clock>,
        rng: Arc<dyn SecureRandom>,
        mesh: Option<Arc<BleTransport>>,
        internet: Option<Arc<NostrTransport>>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> (Arc<Self>, mpsc::Receiver<AppEvent>) {
        let (app_events, app_rx) = mpsc::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        let controller = Arc::new(Self {
            identity,
            noise,
            router,
            peers,
            favorites,
            seen,
            clock,
            rng,
            mesh,
            internet,
            notifier,
            app_events,
            shutdown,
        });
        (controller, app_rx)
    }

    /// Consume transport events until shutdown.
    pub fn start(self: &Arc<Self>, mut transport_events: EventReceiver) {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut shutdown = controller.shutdown.subscribe();
            let mut sweep = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,

                    _ = sweep.tick() => controller.sweep().await,

                    event = transport_events.recv() => {
                        match event {
                            Some(event) => controller.on_transport_event(event).await,
                            None => {
                                tracing::info!("transport event stream closed");
                                return;
                            }
                        }
                    }
                }
            }
        });
    }

    // ── Application operations ───────────────────────────────────────────────

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.identity.fingerprint()
    }

    /// Broadcast a public message into the mesh (and ephemeral internet
    /// channels, when connected).
    pub async fn send_public(&self, text: &str, mentions: &[String]) {
        let payload = serde_json::json!({
            "content": text,
            "mentions": mentions,
        })
        .to_string()
        .into_bytes();
        let mut packet = Packet::new(
            PacketType::Message,
            self.identity.peer_id(),
            self.clock.now_millis(),
            payload,
        );
        packet.signature = Some(self.identity.sign_packet(&packet));
        // Our own floods must not bounce back at us later.
        self.seen.insert(&packet.dedup_fingerprint());
        self.router.broadcast(packet).await;
    }

    /// Send a private message. Returns the message id; delivery follows
    /// asynchronously (queued when no transport can reach the peer yet).
    pub async fn send_private(&self, text: &str, peer: PeerId) -> Result<String, ControllerError> {
        let message_id = new_message_id(&*self.rng);
        let frame = PrivateFrame::Message {
            id: message_id.clone(),
            text: text.to_string(),
        };

        if self.router.is_peer_reachable(peer) && self.noise.is_established(peer) {
            match self.encrypt_and_send(peer, &frame).await {
                Ok(via) => {
                    tracing::debug!(peer = %peer, %message_id, via = %via, "private message sent");
                    return Ok(message_id);
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "direct send failed, queueing");
                }
            }
        }

        let result = self.router.enqueue(
            peer,
            OutboxEntry {
                message_id: message_id.clone(),
                text: text.to_string(),
                recipient_nickname: self.peers.nickname(peer),
                enqueued_at: self.clock.now_millis(),
            },
        );
        if let Some(evicted) = result.evicted {
            self.system_message(format!(
                "outbox full for {}; dropped oldest queued message {}",
                peer, evicted.message_id
            ))
            .await;
        }

        // A reachable peer without a session gets one started now so the
        // queue can drain on completion.
        if self.router.is_peer_reachable(peer)
            && self.noise.handshake_required(peer)
            && !self.noise.handshake_in_flight(peer)
        {
            if let Err(e) = self.start_handshake(peer).await {
                tracing::debug!(peer = %peer, error = %e, "handshake start failed");
            }
        }

        Ok(message_id)
    }

    /// Begin (or restart) a Noise handshake with a peer.
    pub async fn start_handshake(&self, peer: PeerId) -> Result<(), ControllerError> {
        let msg1 = self.noise.initiate_handshake(peer)?;
        let packet = Packet::new(
            PacketType::NoiseHandshake,
            self.identity.peer_id(),
            self.clock.now_millis(),
            msg1,
        )
        .with_recipient(peer);
        self.router.send_to_peer(peer, packet).await?;
        Ok(())
    }

    /// Tell a peer their message has been read.
    pub async fn send_read_ack(&self, peer: PeerId, message_id: String) {
        if !self.noise.is_established(peer) {
            return;
        }
        let frame = PrivateFrame::ReadAck { message_id };
        if let Ok(ciphertext) = self.noise.encrypt(peer, &frame.encode()) {
            let packet = self.noise_packet(peer, ciphertext);
            self.router.send_best_effort(peer, packet).await;
        }
    }

    /// Change our nickname; the mesh announces it immediately.
    pub async fn set_nickname(&self, nickname: String) {
        if let Some(mesh) = &self.mesh {
            mesh.set_nickname(nickname).await;
        }
    }

    /// Locally (un)favorite a peer and notify them over the current
    /// transport.
    pub async fn set_favorite(&self, peer: PeerId, is_favorite: bool) -> Result<(), ControllerError> {
        let remote_static = self
            .noise
            .remote_static(peer)
            .ok_or(ControllerError::NoSession(peer))?;
        let fingerprint = Fingerprint::of_public_key(&remote_static);

        self.favorites.set_favorite(
            &fingerprint,
            remote_static,
            self.peers.nickname(peer),
            is_favorite,
            self.clock.now_millis(),
        );

        if let (Some(internet), Some(record)) = (&self.internet, self.favorites.get(&fingerprint)) {
            if is_favorite && record.is_mutual() {
                if let Some(npub) = &record.nostr_pubkey {
                    internet.set_peer_key(peer, npub.clone());
                }
            } else if !is_favorite {
                internet.clear_peer_key(peer);
            }
        }

        let frame = PrivateFrame::FavoriteNotification {
            is_favorite,
            nostr_pubkey: self.internet.as_ref().map(|i| i.our_pubkey()),
        };
        if let Err(e) = self.encrypt_and_send(peer, &frame).await {
            tracing::debug!(peer = %peer, error = %e, "favorite notification not delivered");
        }
        Ok(())
    }

    /// Destroy all local secrets and state, synchronously. Identity keys
    /// rotate on the next start.
    pub fn panic_wipe(&self) {
        self.identity.panic_wipe();
        self.favorites.wipe();
        self.noise.clear();
        self.router.clear_outbox();
        self.peers.clear();
        self.seen.clear();
        if let Some(internet) = &self.internet {
            internet.clear_all_peer_keys();
        }
        let _ = self.app_events.try_send(AppEvent::SystemMessage {
            text: "all local state wiped".to_string(),
        });
    }

    /// Drop every connection on every transport.
    pub async fn emergency_disconnect_all(&self) {
        for transport in self.router.transports() {
            transport.shutdown().await;
        }
        let _ = self.shutdown.send(());
    }

    // ── Transport event handling ─────────────────────────────────────────────

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::PacketReceived { packet, via } => {
                self.on_packet(packet, via).await;
            }
            TransportEvent::PeerReachable { peer, via } => {
                tracing::debug!(peer = %peer, via = %via, "peer reachable");
                self.peers.saw(peer, None, via, self.clock.monotonic_millis());
                self.flush_outbox(peer).await;
            }
            TransportEvent::PeerLost { peer, via } => {
                tracing::debug!(peer = %peer, via = %via, "peer lost");
                if !self.router.is_peer_reachable(peer) && self.peers.remove(peer) {
                    self.emit(AppEvent::PeerDisappeared { peer }).await;
                }
            }
            TransportEvent::HandshakeEstablished {
                peer,
                remote_static,
                ..
            } => {
                self.on_established(peer, remote_static).await;
            }
            TransportEvent::SystemMessage { text } => {
                self.system_message(text).await;
            }
        }
    }

    async fn on_packet(self: &Arc<Self>, packet: Packet, via: TransportKind) {
        match packet.packet_type {
            PacketType::Announce => self.on_announce(&packet, via).await,
            PacketType::Leave => {
                if self.peers.remove(packet.sender_id) {
                    self.emit(AppEvent::PeerDisappeared {
                        peer: packet.sender_id,
                    })
                    .await;
                }
            }
            PacketType::Message => self.on_public_message(&packet, via).await,
            PacketType::NoiseEncrypted => self.on_encrypted(&packet, via).await,
            PacketType::NoiseHandshake => self.on_handshake_packet(&packet, via).await,
            other => {
                tracing::debug!(packet_type = ?other, via = %via, "packet type not handled here");
            }
        }
    }

    async fn on_announce(&self, packet: &Packet, via: TransportKind) {
        #[derive(serde::Deserialize)]
        struct AnnouncePayload {
            nickname: String,
            #[serde(default)]
            signing_key: Option<String>,
        }

        let Ok(payload) = serde_json::from_slice::<AnnouncePayload>(&packet.payload) else {
            tracing::debug!(peer = %packet.sender_id, "malformed announce payload");
            return;
        };

        // When the announce names a signing key, the signature must hold.
        let signing_key = payload
            .signing_key
            .as_deref()
            .and_then(|hex_key| hex::decode(hex_key).ok())
            .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok());
        if let Some(key) = signing_key {
            if !IdentityStore::verify_packet(packet, &key) {
                tracing::warn!(peer = %packet.sender_id, "announce signature invalid, ignoring");
                return;
            }
            self.peers.set_signing_key(packet.sender_id, key);
        }

        let is_new = self.peers.saw(
            packet.sender_id,
            Some(&payload.nickname),
            via,
            self.clock.monotonic_millis(),
        );
        if is_new {
            self.emit(AppEvent::PeerAppeared {
                peer: packet.sender_id,
                nickname: payload.nickname,
            })
            .await;
        }
    }

    async fn on_public_message(&self, packet: &Packet, via: TransportKind) {
        #[derive(serde::Deserialize)]
        struct PublicPayload {
            content: String,
        }

        let text = match serde_json::from_slice::<PublicPayload>(&packet.payload) {
            Ok(payload) => payload.content,
            // Tolerate bare-UTF-8 senders.
            Err(_) => match String::from_utf8(packet.payload.clone()) {
                Ok(text) => text,
                Err(_) => {
                    tracing::debug!(peer = %packet.sender_id, "undecodable public message");
                    return;
                }
            },
        };

        self.peers
            .saw(packet.sender_id, None, via, self.clock.monotonic_millis());
        self.emit(AppEvent::MessageReceived {
            from: packet.sender_id,
            text,
            via,
            private: false,
        })
        .await;
    }

    async fn on_encrypted(self: &Arc<Self>, packet: &Packet, via: TransportKind) {
        let peer = packet.sender_id;
        let plaintext = match self.noise.decrypt(peer, &packet.payload) {
            Ok(plaintext) => plaintext,
            Err(NoiseError::NotEstablished(_)) => {
                tracing::debug!(peer = %peer, "ciphertext without session, requesting handshake");
                if !self.noise.handshake_in_flight(peer) {
                    if let Err(e) = self.start_handshake(peer).await {
                        tracing::debug!(peer = %peer, error = %e, "handshake request failed");
                    }
                }
                return;
            }
            Err(NoiseError::Transient { peer, cause }) => {
                tracing::debug!(peer = %peer, error = %cause, "duplicate or stale ciphertext");
                return;
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "session failure");
                self.system_message(format!(
                    "encryption with {} failed; a new handshake is required",
                    self.peers
                        .nickname(peer)
                        .unwrap_or_else(|| peer.to_string())
                ))
                .await;
                return;
            }
        };

        let frame = match PrivateFrame::decode(&plaintext) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "unknown private frame");
                return;
            }
        };

        match frame {
            PrivateFrame::Message { id, text } => {
                if let Some(notifier) = &self.notifier {
                    let sender = self
                        .peers
                        .nickname(peer)
                        .unwrap_or_else(|| peer.to_string());
                    notifier.present(&sender, &text, peer.as_bytes());
                }
                self.emit(AppEvent::MessageReceived {
                    from: peer,
                    text,
                    via,
                    private: true,
                })
                .await;
                // Delivery receipt, best effort, never queued.
                let ack = PrivateFrame::DeliveryAck { message_id: id };
                if let Ok(ciphertext) = self.noise.encrypt(peer, &ack.encode()) {
                    let packet = self.noise_packet(peer, ciphertext);
                    self.router.send_best_effort(peer, packet).await;
                }
            }
            PrivateFrame::DeliveryAck { message_id } => {
                self.emit(AppEvent::DeliveryAck {
                    message_id,
                    from: peer,
                })
                .await;
            }
            PrivateFrame::ReadAck { message_id } => {
                self.emit(AppEvent::ReadAck {
                    message_id,
                    from: peer,
                })
                .await;
            }
            PrivateFrame::FavoriteNotification {
                is_favorite,
                nostr_pubkey,
            } => {
                self.on_favorite_notification(peer, is_favorite, nostr_pubkey)
                    .await;
            }
        }
    }

    async fn on_favorite_notification(
        &self,
        peer: PeerId,
        is_favorite: bool,
        nostr_pubkey: Option<String>,
    ) {
        let Some(remote_static) = self.noise.remote_static(peer) else {
            return;
        };
        let fingerprint = Fingerprint::of_public_key(&remote_static);
        let record = self.favorites.peer_asserted(
            &fingerprint,
            remote_static,
            is_favorite,
            nostr_pubkey,
            self.clock.now_millis(),
        );

        if let Some(internet) = &self.internet {
            if record.is_mutual() {
                if let Some(npub) = &record.nostr_pubkey {
                    internet.set_peer_key(peer, npub.clone());
                }
            } else {
                internet.clear_peer_key(peer);
            }
        }

        let nickname = self
            .peers
            .nickname(peer)
            .unwrap_or_else(|| peer.to_string());
        self.system_message(if is_favorite {
            format!("{nickname} favorited you")
        } else {
            format!("{nickname} removed you as favorite")
        })
        .await;
    }

    async fn on_handshake_packet(&self, packet: &Packet, via: TransportKind) {
        // The mesh answers handshakes inline; anything arriving here came
        // over a transport without that fast path (the relays).
        let peer = packet.sender_id;
        match self.noise.process_handshake(peer, &packet.payload) {
            Ok(outcome) => {
                if let Some(reply) = outcome.reply {
                    let reply_packet = Packet::new(
                        PacketType::NoiseHandshake,
                        self.identity.peer_id(),
                        self.clock.now_millis(),
                        reply,
                    )
                    .with_recipient(peer);
                    self.router.send_best_effort(peer, reply_packet).await;
                }
                if let Some(remote_static) = outcome.established {
                    tracing::info!(peer = %peer, via = %via, "handshake complete");
                    self.on_established(peer, remote_static).await;
                }
            }
            Err(e) => {
                tracing::warn!(peer = %peer, via = %via, error = %e, "handshake failed");
            }
        }
    }

    async fn on_established(&self, peer: PeerId, remote_static: [u8; 32]) {
        let fingerprint = Fingerprint::of_public_key(&remote_static);

        if let Some(previous) = self.peers.get(peer).and_then(|r| r.fingerprint) {
            if previous != fingerprint {
                self.system_message(format!(
                    "identity for {} changed (was {}, now {})",
                    self.peers
                        .nickname(peer)
                        .unwrap_or_else(|| peer.to_string()),
                    previous.short(),
                    fingerprint.short(),
                ))
                .await;
            }
        }
        self.peers.set_fingerprint(peer, fingerprint.clone());

        self.emit(AppEvent::NoiseHandshakeComplete {
            peer,
            fingerprint,
        })
        .await;

        self.flush_outbox(peer).await;
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn noise_packet(&self, peer: PeerId, ciphertext: Vec<u8>) -> Packet {
        Packet::new(
            PacketType::NoiseEncrypted,
            self.identity.peer_id(),
            self.clock.now_millis(),
            ciphertext,
        )
        .with_recipient(peer)
    }

    async fn encrypt_and_send(
        &self,
        peer: PeerId,
        frame: &PrivateFrame,
    ) -> Result<TransportKind, ControllerError> {
        let ciphertext = self.noise.encrypt(peer, &frame.encode())?;
        let packet = self.noise_packet(peer, ciphertext);
        Ok(self.router.send_to_peer(peer, packet).await?)
    }

    /// Deliver everything queued for a peer, oldest first, exactly once
    /// each. Without a session the queue stays put and a handshake is
    /// kicked off instead.
    async fn flush_outbox(&self, peer: PeerId) {
        if self.router.outbox_pending(peer) == 0 {
            return;
        }
        if !self.noise.is_established(peer) {
            if self.router.is_peer_reachable(peer) && !self.noise.handshake_in_flight(peer) {
                if let Err(e) = self.start_handshake(peer).await {
                    tracing::debug!(peer = %peer, error = %e, "flush handshake failed");
                }
            }
            return;
        }

        let entries = self.router.drain_outbox(peer);
        let total = entries.len();
        let mut delivered = 0usize;
        let mut rest = entries.into_iter();
        while let Some(entry) = rest.next() {
            let frame = PrivateFrame::Message {
                id: entry.message_id.clone(),
                text: entry.text.clone(),
            };
            match self.encrypt_and_send(peer, &frame).await {
                Ok(_) => delivered += 1,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "flush interrupted, requeueing");
                    self.router.enqueue(peer, entry);
                    for remaining in rest {
                        self.router.enqueue(peer, remaining);
                    }
                    break;
                }
            }
        }
        if delivered > 0 {
            tracing::info!(peer = %peer, delivered, total, "outbox flushed");
        }
    }

    async fn sweep(&self) {
        for (peer, entry) in self.router.sweep_outbox(self.clock.now_millis()) {
            self.system_message(format!(
                "queued message {} for {} expired undelivered",
                entry.message_id,
                entry
                    .recipient_nickname
                    .unwrap_or_else(|| peer.to_string()),
            ))
            .await;
        }

        // Peers that went quiet and are no longer deliverable anywhere.
        const PEER_EXPIRY_MILLIS: u64 = 10 * 60 * 1000;
        for peer in self
            .peers
            .sweep(self.clock.monotonic_millis(), PEER_EXPIRY_MILLIS)
        {
            if !self.router.is_peer_reachable(peer) {
                self.emit(AppEvent::PeerDisappeared { peer }).await;
            }
        }
    }

    async fn emit(&self, event: AppEvent) {
        if self.app_events.send(event).await.is_err() {
            tracing::debug!("application event receiver dropped");
        }
    }

    async fn system_message(&self, text: String) {
        tracing::info!(%text, "system message");
        self.emit(AppEvent::SystemMessage { text }).await;
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("no established session with {0}")]
    NoSession(PeerId),

    #[error(transparent)]
    Noise(#[from] NoiseError),

    #[error(transparent)]
    Router(#[from] RouterError),
}
