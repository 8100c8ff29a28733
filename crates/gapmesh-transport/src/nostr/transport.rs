//! The internet transport: core packets over gift-wrapped relay DMs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use gapmesh_core::config::InternetConfig;
use gapmesh_core::identity::IdentityStore;
use gapmesh_core::platform::Clock;
use gapmesh_core::wire::{Packet, PeerId};

use crate::{EventSender, Transport, TransportError, TransportEvent, TransportKind};

use super::event::{NostrEvent, NostrKeys, KIND_EPHEMERAL_CHANNEL};
use super::relay::RelayPool;
use super::{giftwrap, NostrError};

pub struct NostrTransport {
    inner: Arc<Inner>,
}

struct Inner {
    keys: NostrKeys,
    pool: RelayPool,
    clock: Arc<dyn Clock>,
    /// peer -> relay-network pubkey. Fed by favorite notifications and by
    /// inbound wraps (a peer that wrote to us is a peer we can answer).
    peer_keys: DashMap<PeerId, String>,
    events: EventSender,
    running: AtomicBool,
}

impl NostrTransport {
    pub fn new(
        identity: &IdentityStore,
        config: InternetConfig,
        clock: Arc<dyn Clock>,
        events: EventSender,
    ) -> Result<Self, NostrError> {
        let keys = NostrKeys::from_secret_bytes(&identity.nostr_secret())?;
        let pool = RelayPool::new(config, keys.public_hex());
        Ok(Self {
            inner: Arc::new(Inner {
                keys,
                pool,
                clock,
                peer_keys: DashMap::new(),
                events,
                running: AtomicBool::new(true),
            }),
        })
    }

    /// Connect to the configured relays and start unwrapping inbound
    /// events.
    pub fn start(&self) {
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<NostrEvent>(64);
        self.inner.pool.start(inbound_tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                inner.on_event(event).await;
            }
        });
    }

    /// Our relay-network identity, shared with mutual favorites.
    pub fn our_pubkey(&self) -> String {
        self.inner.keys.public_hex()
    }

    /// Record a peer's relay identity (favorite-notification payloads
    /// carry these).
    pub fn set_peer_key(&self, peer: PeerId, pubkey_hex: String) {
        let changed = self
            .inner
            .peer_keys
            .insert(peer, pubkey_hex)
            .is_none();
        if changed && self.inner.pool.is_connected() {
            let events = self.inner.events.clone();
            tokio::spawn(async move {
                let _ = events
                    .send(TransportEvent::PeerReachable {
                        peer,
                        via: TransportKind::Internet,
                    })
                    .await;
            });
        }
    }

    /// Forget a peer's relay identity (unfavorited, or panic wipe).
    pub fn clear_peer_key(&self, peer: PeerId) {
        self.inner.peer_keys.remove(&peer);
    }

    pub fn clear_all_peer_keys(&self) {
        self.inner.peer_keys.clear();
    }

    pub fn relay_count(&self) -> usize {
        self.inner.pool.connected_count()
    }
}

#[async_trait]
impl Transport for NostrTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Internet
    }

    fn is_peer_reachable(&self, peer: PeerId) -> bool {
        self.inner.pool.is_connected() && self.inner.peer_keys.contains_key(&peer)
    }

    async fn send_packet(&self, peer: Option<PeerId>, packet: Packet) -> Result<(), TransportError> {
        if !self.inner.running.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let now_secs = self.inner.clock.now_millis() / 1000;

        let event = match peer {
            Some(peer) => {
                let recipient = self
                    .inner
                    .peer_keys
                    .get(&peer)
                    .map(|e| e.value().clone())
                    .ok_or(TransportError::NoRelayIdentity(peer))?;
                giftwrap::gift_wrap(&packet, &self.inner.keys, &recipient, now_secs)
                    .map_err(|e| TransportError::Platform(e.to_string()))?
            }
            None => {
                // Broadcasts ride ephemeral channel events in the clear
                // envelope sense: relays may drop them, nobody retries.
                NostrEvent::sign(
                    &self.inner.keys,
                    now_secs,
                    KIND_EPHEMERAL_CHANNEL,
                    vec![],
                    giftwrap::embed_packet(&packet),
                )
            }
        };

        if self.inner.pool.publish(&event) {
            tracing::debug!(event_id = %event.id, "published to relays");
            Ok(())
        } else {
            Err(TransportError::NoRelay)
        }
    }

    async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Relaxed);
        self.inner.pool.shutdown();
    }
}

impl Inner {
    async fn on_event(&self, event: NostrEvent) {
        let (packet, sender_pubkey) = match giftwrap::unwrap(&event, &self.keys) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(event_id = %event.id, error = %e, "unwrap failed");
                return;
            }
        };

        let peer = packet.sender_id;

        // A peer that reached us over the relays is answerable there.
        let newly_known = self.peer_keys.insert(peer, sender_pubkey).is_none();
        if newly_known {
            tracing::info!(peer = %peer, "learned relay identity from inbound wrap");
            let _ = self
                .events
                .send(TransportEvent::PeerReachable {
                    peer,
                    via: TransportKind::Internet,
                })
                .await;
        }

        let _ = self
            .events
            .send(TransportEvent::PacketReceived {
                packet,
                via: TransportKind::Internet,
            })
            .await;
    }
}
