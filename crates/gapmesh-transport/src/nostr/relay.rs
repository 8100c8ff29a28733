//! Relay pool: one websocket task per configured relay.
//!
//! Each task keeps its socket alive with exponential backoff plus jitter,
//! subscribes to gift wraps addressed to us, republishes everything the
//! pool is asked to publish, and forwards inbound events. Messages sent
//! while no relay is up are not buffered here — the router's outbox owns
//! queueing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use gapmesh_core::config::InternetConfig;

use super::event::{NostrEvent, KIND_GIFT_WRAP};

const SUBSCRIPTION_ID: &str = "gapmesh-wraps";

pub struct RelayPool {
    config: InternetConfig,
    our_pubkey: String,
    connected: Arc<AtomicUsize>,
    publish_tx: broadcast::Sender<String>,
    shutdown: broadcast::Sender<()>,
}

impl RelayPool {
    pub fn new(config: InternetConfig, our_pubkey: String) -> Self {
        let (publish_tx, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            our_pubkey,
            connected: Arc::new(AtomicUsize::new(0)),
            publish_tx,
            shutdown,
        }
    }

    /// Spawn one task per configured relay. Inbound events flow into
    /// `inbound`.
    pub fn start(&self, inbound: mpsc::Sender<NostrEvent>) {
        for url in self.config.relays.clone() {
            let task = RelayTask {
                url,
                our_pubkey: self.our_pubkey.clone(),
                connected: self.connected.clone(),
                publish_rx: self.publish_tx.subscribe(),
                inbound: inbound.clone(),
                shutdown: self.shutdown.subscribe(),
                base_backoff: Duration::from_millis(self.config.reconnect_base_millis.max(100)),
                max_backoff: Duration::from_millis(self.config.reconnect_max_millis.max(1_000)),
            };
            tokio::spawn(task.run());
        }
    }

    /// Hand an event to every connected relay.
    pub fn publish(&self, event: &NostrEvent) -> bool {
        let frame = match serde_json::to_string(&serde_json::json!(["EVENT", event])) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "event serialization failed");
                return false;
            }
        };
        // Receivers only exist while at least one socket is up.
        self.publish_tx.send(frame).is_ok() && self.is_connected()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) > 0
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

struct RelayTask {
    url: String,
    our_pubkey: String,
    connected: Arc<AtomicUsize>,
    publish_rx: broadcast::Receiver<String>,
    inbound: mpsc::Sender<NostrEvent>,
    shutdown: broadcast::Receiver<()>,
    base_backoff: Duration,
    max_backoff: Duration,
}

impl RelayTask {
    async fn run(mut self) {
        let mut backoff = self.base_backoff;
        loop {
            match self.session().await {
                SessionEnd::Shutdown => return,
                SessionEnd::Dropped => {
                    // Socket lived; start the backoff ladder over.
                    backoff = self.base_backoff;
                }
                SessionEnd::ConnectFailed => {}
            }

            // Exponential backoff with jitter so a relay restart does not
            // get a synchronized stampede.
            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let wait = backoff + Duration::from_millis(jitter);
            tracing::debug!(relay = %self.url, wait_ms = wait.as_millis() as u64, "reconnect scheduled");

            tokio::select! {
                _ = self.shutdown.recv() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// One connected session; returns why it ended.
    async fn session(&mut self) -> SessionEnd {
        let (mut socket, _response) = match connect_async(&self.url).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::debug!(relay = %self.url, error = %e, "connect failed");
                return SessionEnd::ConnectFailed;
            }
        };
        tracing::info!(relay = %self.url, "relay connected");
        self.connected.fetch_add(1, Ordering::Relaxed);

        let end = self.pump(&mut socket).await;

        self.connected.fetch_sub(1, Ordering::Relaxed);
        tracing::info!(relay = %self.url, "relay disconnected");
        end
    }

    async fn pump<S>(&mut self, socket: &mut S) -> SessionEnd
    where
        S: futures::Sink<WsMessage> + futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        // Subscribe to wraps addressed to us.
        let req = serde_json::json!([
            "REQ",
            SUBSCRIPTION_ID,
            { "kinds": [KIND_GIFT_WRAP], "#p": [self.our_pubkey] }
        ]);
        if socket.send(WsMessage::Text(req.to_string())).await.is_err() {
            return SessionEnd::Dropped;
        }

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    return SessionEnd::Shutdown;
                }

                outbound = self.publish_rx.recv() => {
                    match outbound {
                        Ok(frame) => {
                            if socket.send(WsMessage::Text(frame)).await.is_err() {
                                return SessionEnd::Dropped;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(relay = %self.url, skipped = n, "publish queue lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return SessionEnd::Shutdown,
                    }
                }

                frame = socket.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => self.on_text(&text).await,
                        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                        Some(Ok(WsMessage::Close(_))) | None => return SessionEnd::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(relay = %self.url, error = %e, "socket error");
                            return SessionEnd::Dropped;
                        }
                    }
                }
            }
        }
    }

    async fn on_text(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return;
        };
        let Some(array) = value.as_array() else { return };
        match array.first().and_then(|v| v.as_str()) {
            Some("EVENT") => {
                if let Some(raw) = array.get(2) {
                    match serde_json::from_value::<NostrEvent>(raw.clone()) {
                        Ok(event) => {
                            let _ = self.inbound.send(event).await;
                        }
                        Err(e) => {
                            tracing::debug!(relay = %self.url, error = %e, "bad event json")
                        }
                    }
                }
            }
            Some("OK") | Some("EOSE") => {}
            Some("NOTICE") => {
                tracing::debug!(relay = %self.url, notice = %text, "relay notice");
            }
            _ => {}
        }
    }
}

enum SessionEnd {
    Shutdown,
    Dropped,
    ConnectFailed,
}
