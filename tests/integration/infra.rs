//! Test infrastructure: an in-memory BLE bus, a settable clock, a fake
//! relay transport, and full-node assembly.
//!
//! The bus replaces the host BLE stack so multi-node scenarios run
//! hermetically: links are declared, advertisements match scan sets by
//! UUID, connections are byte pipes with preserved ordering and
//! arbitrary chunking, and cutting a link kills the pipes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use gapmesh_core::config::{LimitsConfig, MeshConfig};
use gapmesh_core::dedup::SeenCache;
use gapmesh_core::identity::IdentityStore;
use gapmesh_core::noise::NoiseRegistry;
use gapmesh_core::platform::{Clock, Keychain, MemoryKeychain, OsRandom, SecureRandom};
use gapmesh_core::wire::{Packet, PeerId};
use gapmesh_node::controller::{AppEvent, SessionController};
use gapmesh_node::favorites::FavoritesBook;
use gapmesh_node::outbox::Outbox;
use gapmesh_node::peers::PeerTable;
use gapmesh_node::router::Router;
use gapmesh_transport::ble::{BleError, BlePlatform, BleTransport, ConnId, Discovery};
use gapmesh_transport::{
    EventSender, Transport, TransportError, TransportEvent, TransportKind,
};

pub const TEST_MTU: usize = 185;

// ── Loopback BLE bus ─────────────────────────────────────────────────────────

#[derive(Default)]
struct NodeState {
    advertised: Vec<Uuid>,
    scanning: Vec<Uuid>,
    discovery_tx: Option<mpsc::Sender<Discovery>>,
}

struct ConnEntry {
    owner: String,
    remote: String,
    notif_tx: Option<mpsc::Sender<Vec<u8>>>,
    open: bool,
}

#[derive(Default)]
struct BusInner {
    nodes: HashMap<String, NodeState>,
    links: HashSet<(String, String)>,
    conns: HashMap<ConnId, ConnEntry>,
    /// Bytes written before the receiving side subscribed, keyed
    /// (writer, reader).
    pending: HashMap<(String, String), Vec<Vec<u8>>>,
}

pub struct LoopbackBus {
    inner: Mutex<BusInner>,
    next_conn: AtomicU64,
}

impl LoopbackBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner::default()),
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn adapter(self: &Arc<Self>, device: &str) -> Arc<LoopbackAdapter> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .entry(device.to_string())
            .or_default();
        Arc::new(LoopbackAdapter {
            bus: self.clone(),
            device: device.to_string(),
        })
    }

    /// Put two devices in radio range of each other.
    pub fn link(&self, a: &str, b: &str) {
        self.inner.lock().unwrap().links.insert(normalize(a, b));
        self.recompute();
    }

    /// Take two devices out of range; their connections drop.
    pub fn unlink(&self, a: &str, b: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.links.remove(&normalize(a, b));
        let doomed: Vec<ConnId> = inner
            .conns
            .iter()
            .filter(|(_, c)| {
                (c.owner == a && c.remote == b) || (c.owner == b && c.remote == a)
            })
            .map(|(&id, _)| id)
            .collect();
        for id in doomed {
            if let Some(conn) = inner.conns.get_mut(&id) {
                conn.open = false;
                conn.notif_tx = None; // sender dropped, stream ends
            }
        }
    }

    fn in_range(inner: &BusInner, a: &str, b: &str) -> bool {
        inner.links.contains(&normalize(a, b))
    }

    /// Push discoveries to every scanner whose set intersects an in-range
    /// advertiser.
    fn recompute(&self) {
        let inner = self.inner.lock().unwrap();
        for (scanner_name, scanner) in &inner.nodes {
            let Some(tx) = &scanner.discovery_tx else { continue };
            for (advertiser_name, advertiser) in &inner.nodes {
                if advertiser_name == scanner_name
                    || !Self::in_range(&inner, scanner_name, advertiser_name)
                {
                    continue;
                }
                if let Some(matched) = advertiser
                    .advertised
                    .iter()
                    .find(|uuid| scanner.scanning.contains(uuid))
                {
                    let _ = tx.try_send(Discovery {
                        device: advertiser_name.clone(),
                        service_uuid: *matched,
                        rssi: -40,
                    });
                }
            }
        }
    }
}

fn normalize(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

pub struct LoopbackAdapter {
    bus: Arc<LoopbackBus>,
    device: String,
}

#[async_trait]
impl BlePlatform for LoopbackAdapter {
    async fn advertise(&self, services: Vec<Uuid>, _characteristic: Uuid) -> Result<(), BleError> {
        if let Some(node) = self.bus.inner.lock().unwrap().nodes.get_mut(&self.device) {
            node.advertised = services;
        }
        self.bus.recompute();
        Ok(())
    }

    async fn scan(&self, services: Vec<Uuid>) -> Result<mpsc::Receiver<Discovery>, BleError> {
        let (tx, rx) = mpsc::channel(64);
        if let Some(node) = self.bus.inner.lock().unwrap().nodes.get_mut(&self.device) {
            node.scanning = services;
            node.discovery_tx = Some(tx);
        }
        self.bus.recompute();
        Ok(rx)
    }

    async fn connect(&self, device: &str) -> Result<ConnId, BleError> {
        let mut inner = self.bus.inner.lock().unwrap();
        if !LoopbackBus::in_range(&inner, &self.device, device) {
            return Err(BleError::Platform(format!("{device} out of range")));
        }
        let id = self.bus.next_conn.fetch_add(1, Ordering::Relaxed);
        inner.conns.insert(
            id,
            ConnEntry {
                owner: self.device.clone(),
                remote: device.to_string(),
                notif_tx: None,
                open: true,
            },
        );
        Ok(id)
    }

    async fn write_characteristic(&self, conn: ConnId, bytes: &[u8]) -> Result<(), BleError> {
        let mut inner = self.bus.inner.lock().unwrap();
        let (remote, open) = match inner.conns.get(&conn) {
            Some(c) if c.owner == self.device => (c.remote.clone(), c.open),
            _ => return Err(BleError::ConnectionGone(conn)),
        };
        if !open || !LoopbackBus::in_range(&inner, &self.device, &remote) {
            return Err(BleError::WriteFailed("link down".into()));
        }

        // Deliver to the remote's connection back to us, or buffer until
        // it subscribes.
        let partner_tx = inner
            .conns
            .values()
            .find(|c| c.owner == remote && c.remote == self.device && c.open)
            .and_then(|c| c.notif_tx.clone());
        match partner_tx {
            Some(tx) => {
                let _ = tx.try_send(bytes.to_vec());
            }
            None => {
                inner
                    .pending
                    .entry((self.device.clone(), remote))
                    .or_default()
                    .push(bytes.to_vec());
            }
        }
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        conn: ConnId,
    ) -> Result<mpsc::Receiver<Vec<u8>>, BleError> {
        let (tx, rx) = mpsc::channel(4096);
        let mut inner = self.bus.inner.lock().unwrap();
        let remote = match inner.conns.get_mut(&conn) {
            Some(c) if c.owner == self.device => {
                c.notif_tx = Some(tx.clone());
                c.remote.clone()
            }
            _ => return Err(BleError::ConnectionGone(conn)),
        };
        // Flush anything the remote wrote before we subscribed.
        if let Some(backlog) = inner.pending.remove(&(remote, self.device.clone())) {
            for chunk in backlog {
                let _ = tx.try_send(chunk);
            }
        }
        Ok(rx)
    }

    fn mtu(&self, _conn: ConnId) -> usize {
        TEST_MTU
    }

    async fn disconnect(&self, conn: ConnId) {
        let mut inner = self.bus.inner.lock().unwrap();
        if let Some(entry) = inner.conns.get_mut(&conn) {
            entry.open = false;
            entry.notif_tx = None;
        }
    }
}

// ── Settable clock ───────────────────────────────────────────────────────────

/// Wall clock pinned to a chosen base, monotonic from process start.
pub struct TestClock {
    base_millis: u64,
    origin: Instant,
}

impl TestClock {
    pub fn at(base_millis: u64) -> Arc<Self> {
        Arc::new(Self {
            base_millis,
            origin: Instant::now(),
        })
    }
}

impl Clock for TestClock {
    fn now_millis(&self) -> u64 {
        self.base_millis + self.origin.elapsed().as_millis() as u64
    }

    fn monotonic_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

// ── Fake relay transport ─────────────────────────────────────────────────────

/// Registry shared by all fake internet transports in one test: peer id →
/// that node's transport-event inbox.
pub type RelayRegistry = Arc<DashMap<PeerId, EventSender>>;

pub fn new_relay_registry() -> RelayRegistry {
    Arc::new(DashMap::new())
}

/// Stand-in for the relay network: packets to a registered peer land in
/// that peer's transport-event queue, via = Internet.
pub struct FakeInternet {
    me: PeerId,
    registry: RelayRegistry,
    online: AtomicBool,
}

impl FakeInternet {
    pub fn new(me: PeerId, registry: RelayRegistry) -> Arc<Self> {
        Arc::new(Self {
            me,
            registry,
            online: AtomicBool::new(true),
        })
    }
}

#[async_trait]
impl Transport for FakeInternet {
    fn kind(&self) -> TransportKind {
        TransportKind::Internet
    }

    fn is_peer_reachable(&self, peer: PeerId) -> bool {
        peer != self.me
            && self.online.load(Ordering::Relaxed)
            && self.registry.contains_key(&peer)
    }

    async fn send_packet(&self, peer: Option<PeerId>, packet: Packet) -> Result<(), TransportError> {
        if !self.online.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        match peer {
            Some(peer) => {
                let tx = self
                    .registry
                    .get(&peer)
                    .map(|e| e.value().clone())
                    .ok_or(TransportError::NotReachable(peer))?;
                tx.send(TransportEvent::PacketReceived {
                    packet,
                    via: TransportKind::Internet,
                })
                .await
                .map_err(|_| TransportError::Closed)
            }
            None => Ok(()),
        }
    }

    async fn shutdown(&self) {
        self.online.store(false, Ordering::Relaxed);
    }
}

// ── Node assembly ────────────────────────────────────────────────────────────

pub struct TestNode {
    pub controller: Arc<SessionController>,
    pub app: mpsc::Receiver<AppEvent>,
    pub router: Arc<Router>,
    pub keychain: Arc<MemoryKeychain>,
    pub peer_id: PeerId,
}

fn test_mesh_config() -> MeshConfig {
    MeshConfig {
        announce_interval_secs: 1,
        legacy_uuid_compat: false,
        default_mtu: TEST_MTU,
        inactivity_timeout_secs: 60,
    }
}

/// A full node on the loopback bus.
pub async fn spawn_mesh_node(
    bus: &Arc<LoopbackBus>,
    device: &str,
    nickname: &str,
    clock: Arc<dyn Clock>,
) -> TestNode {
    let keychain = Arc::new(MemoryKeychain::new());
    let identity = Arc::new(IdentityStore::open(keychain.clone()));
    let rng: Arc<dyn SecureRandom> = Arc::new(OsRandom);
    let noise = Arc::new(NoiseRegistry::new(identity.clone(), clock.clone()));
    let seen = Arc::new(SeenCache::default());
    let (events_tx, events_rx) = mpsc::channel(256);

    let ble = Arc::new(BleTransport::new(
        bus.adapter(device),
        identity.clone(),
        noise.clone(),
        seen.clone(),
        clock.clone(),
        rng.clone(),
        test_mesh_config(),
        LimitsConfig::default(),
        events_tx,
        nickname.to_string(),
    ));
    ble.start();

    let router = Arc::new(Router::new(
        vec![ble.clone() as Arc<dyn Transport>],
        Outbox::new(100, 72 * 3600 * 1000),
    ));
    let favorites = Arc::new(FavoritesBook::open(keychain.clone()));
    let peer_id = identity.peer_id();

    let (controller, app) = SessionController::new(
        identity,
        noise,
        router.clone(),
        PeerTable::new(),
        favorites,
        seen,
        clock,
        rng,
        Some(ble),
        None,
        None,
    );
    controller.start(events_rx);

    TestNode {
        controller,
        app,
        router,
        keychain,
        peer_id,
    }
}

/// A node whose only transport is the fake relay network.
pub async fn spawn_internet_node(registry: &RelayRegistry, clock: Arc<dyn Clock>) -> TestNode {
    let keychain = Arc::new(MemoryKeychain::new());
    let identity = Arc::new(IdentityStore::open(keychain.clone()));
    let rng: Arc<dyn SecureRandom> = Arc::new(OsRandom);
    let noise = Arc::new(NoiseRegistry::new(identity.clone(), clock.clone()));
    let seen = Arc::new(SeenCache::default());
    let (events_tx, events_rx) = mpsc::channel(256);

    let peer_id = identity.peer_id();
    registry.insert(peer_id, events_tx);
    let internet = FakeInternet::new(peer_id, registry.clone());

    let router = Arc::new(Router::new(
        vec![internet as Arc<dyn Transport>],
        Outbox::new(100, 72 * 3600 * 1000),
    ));
    let favorites = Arc::new(FavoritesBook::open(keychain.clone()));

    let (controller, app) = SessionController::new(
        identity,
        noise,
        router.clone(),
        PeerTable::new(),
        favorites,
        seen,
        clock,
        rng,
        None,
        None,
        None,
    );
    controller.start(events_rx);

    TestNode {
        controller,
        app,
        router,
        keychain,
        peer_id,
    }
}

// ── Event helpers ────────────────────────────────────────────────────────────

/// Wait until an event matching `pred` arrives, with a deadline.
pub async fn wait_for<F>(
    rx: &mut mpsc::Receiver<AppEvent>,
    secs: u64,
    what: &str,
    pred: F,
) -> AppEvent
where
    F: Fn(&AppEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) => {
                if pred(&event) {
                    return event;
                }
            }
            Ok(None) => panic!("event stream closed while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

/// Collect every event that arrives inside the window.
pub async fn drain_for(rx: &mut mpsc::Receiver<AppEvent>, millis: u64) -> Vec<AppEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(millis);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return events;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(event)) => events.push(event),
            _ => return events,
        }
    }
}

/// System wall-clock for tests that do not care about rotation buckets.
pub fn wall_clock() -> Arc<dyn Clock> {
    Arc::new(gapmesh_core::platform::SystemClock::new())
}

/// Keychain probe used by the wipe test.
pub fn keychain_is_empty(keychain: &MemoryKeychain) -> bool {
    keychain.get("identity/static").is_none()
        && keychain.get("identity/signing").is_none()
        && keychain.get("favorites/v1").is_none()
}
