//! LAN discovery: advertise this device, collect beacons from others, expire silent peers.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::wire::{decode_frame, encode_frame};
use mesh_core::{
    ArtifactSummary, Message, PeerDescriptor, PeerId, Role, SignalQuality, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::transport::AddressBook;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
/// Summaries carried per beacon, newest first.
pub const MAX_ADVERTISED: usize = 64;
/// Largest framed beacon, below the 65,507-byte UDP payload limit.
pub const MAX_BEACON_BYTES: usize = 60 * 1024;
const EVENT_CAPACITY: usize = 256;
const RECV_BUF: usize = 65536;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub display_name: String,
    pub role: Role,
    /// Transfer port announced in beacons.
    pub listen_port: u16,
    pub beacon_interval: Duration,
    /// Upper bound of the random delay added to each interval.
    pub beacon_jitter: Duration,
    /// Quiet period after a catalog change before the beacon goes out.
    pub debounce: Duration,
    pub peer_expiry: Duration,
    pub sweep_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            display_name: "MeshMind device".into(),
            role: Role::Receiver,
            listen_port: 45681,
            beacon_interval: Duration::from_secs(4),
            beacon_jitter: Duration::from_millis(400),
            debounce: Duration::from_millis(500),
            peer_expiry: Duration::from_secs(16),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// What this device announces.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peer_id: PeerId,
    pub display_name: String,
    pub role: Role,
    pub listen_port: u16,
    pub artifacts: Vec<ArtifactSummary>,
}

impl Advertisement {
    pub fn to_message(&self) -> Message {
        Message::Beacon {
            protocol_version: PROTOCOL_VERSION,
            peer_id: self.peer_id.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            listen_port: self.listen_port,
            artifacts: self.artifacts.clone(),
        }
    }

    /// Carry the newest summaries that fit: at most `MAX_ADVERTISED`, and a framed beacon
    /// of at most `MAX_BEACON_BYTES`.
    pub fn fill(&mut self, summaries: &[ArtifactSummary]) {
        self.artifacts = summaries.iter().take(MAX_ADVERTISED).cloned().collect();
        while !self.artifacts.is_empty() && !self.fits() {
            self.artifacts.pop();
        }
    }

    fn fits(&self) -> bool {
        encode_frame(&self.to_message()).is_ok_and(|frame| frame.len() <= MAX_BEACON_BYTES)
    }
}

/// Where beacons go out and sightings come in.
pub trait DiscoveryBackend: Send + Sync + 'static {
    fn broadcast(&self, ad: &Advertisement) -> impl Future<Output = io::Result<()>> + Send;
    fn next_sighting(&self) -> impl Future<Output = io::Result<PeerDescriptor>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Expired,
    ScanReset,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Added(PeerDescriptor),
    Updated(PeerDescriptor),
    Removed { peer_id: PeerId, reason: RemovalReason },
}

struct Tracked {
    descriptor: PeerDescriptor,
    last_seen: Instant,
}

struct TableState {
    peers: HashMap<PeerId, Tracked>,
    snapshot: Arc<[PeerDescriptor]>,
}

impl TableState {
    fn rebuild(&mut self) {
        let mut list: Vec<PeerDescriptor> =
            self.peers.values().map(|t| t.descriptor.clone()).collect();
        list.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        self.snapshot = list.into();
    }
}

/// Live set of peers. Events go out under the table lock, so subscribers see them in
/// detection order.
pub struct PeerTable {
    local: PeerId,
    expiry: Duration,
    state: Mutex<TableState>,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerTable {
    pub fn new(local: PeerId, expiry: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local,
            expiry,
            state: Mutex::new(TableState {
                peers: HashMap::new(),
                snapshot: Arc::from(Vec::new()),
            }),
            events,
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local
    }

    /// Insert or refresh a sighting. Returns false for this device's own beacon.
    pub fn observe(&self, descriptor: PeerDescriptor) -> bool {
        self.observe_at(descriptor, Instant::now())
    }

    fn observe_at(&self, descriptor: PeerDescriptor, now: Instant) -> bool {
        if descriptor.peer_id == self.local {
            return false;
        }
        let mut state = self.state.lock();
        let event = match state.peers.get_mut(&descriptor.peer_id) {
            Some(tracked) => {
                tracked.last_seen = now;
                if tracked.descriptor == descriptor {
                    None
                } else {
                    tracked.descriptor = descriptor.clone();
                    Some(PeerEvent::Updated(descriptor))
                }
            }
            None => {
                tracing::info!(
                    peer_id = %descriptor.peer_id,
                    display_name = %descriptor.display_name,
                    role = ?descriptor.role,
                    artifacts = descriptor.advertised.len(),
                    "peer added"
                );
                state.peers.insert(
                    descriptor.peer_id.clone(),
                    Tracked {
                        descriptor: descriptor.clone(),
                        last_seen: now,
                    },
                );
                Some(PeerEvent::Added(descriptor))
            }
        };
        if let Some(event) = event {
            state.rebuild();
            let _ = self.events.send(event);
        }
        true
    }

    /// Remove peers silent for longer than the expiry.
    pub fn sweep(&self, now: Instant) -> Vec<PeerId> {
        let mut state = self.state.lock();
        let expired: Vec<PeerId> = state
            .peers
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_seen) > self.expiry)
            .map(|(id, _)| id.clone())
            .collect();
        if expired.is_empty() {
            return expired;
        }
        for id in &expired {
            state.peers.remove(id);
            tracing::info!(peer_id = %id, "peer expired");
            let _ = self.events.send(PeerEvent::Removed {
                peer_id: id.clone(),
                reason: RemovalReason::Expired,
            });
        }
        state.rebuild();
        expired
    }

    /// Forget every peer, as at the start of a new scan.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let mut ids: Vec<PeerId> = state.peers.drain().map(|(id, _)| id).collect();
        ids.sort();
        for id in ids {
            let _ = self.events.send(PeerEvent::Removed {
                peer_id: id,
                reason: RemovalReason::ScanReset,
            });
        }
        state.rebuild();
    }

    pub fn snapshot(&self) -> Arc<[PeerDescriptor]> {
        self.state.lock().snapshot.clone()
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerDescriptor> {
        self.state
            .lock()
            .peers
            .get(peer)
            .map(|t| t.descriptor.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

/// Advertiser and scanner over one backend.
pub struct Discovery<B: DiscoveryBackend> {
    backend: Arc<B>,
    config: DiscoveryConfig,
    table: Arc<PeerTable>,
    advertiser: Mutex<Option<JoinHandle<()>>>,
    scanner: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: DiscoveryBackend> Discovery<B> {
    pub fn new(local: PeerId, config: DiscoveryConfig, backend: Arc<B>) -> Self {
        let table = Arc::new(PeerTable::new(local, config.peer_expiry));
        Self {
            backend,
            config,
            table,
            advertiser: Mutex::new(None),
            scanner: Mutex::new(Vec::new()),
        }
    }

    pub fn peers(&self) -> Arc<PeerTable> {
        self.table.clone()
    }

    /// Beacon now, on every summary change (debounced) and every interval. Replaces a
    /// running advertiser.
    pub fn start_advertising(&self, summaries: watch::Receiver<Vec<ArtifactSummary>>) {
        let template = Advertisement {
            peer_id: self.table.local_peer().clone(),
            display_name: self.config.display_name.clone(),
            role: self.config.role,
            listen_port: self.config.listen_port,
            artifacts: Vec::new(),
        };
        let task = tokio::spawn(advertise_loop(
            self.backend.clone(),
            template,
            self.config.clone(),
            summaries,
        ));
        if let Some(old) = self.advertiser.lock().replace(task) {
            old.abort();
        }
    }

    pub fn stop_advertising(&self) {
        if let Some(task) = self.advertiser.lock().take() {
            task.abort();
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertiser.lock().is_some()
    }

    /// Start a scan session. Clears the peer table; the returned receiver yields every
    /// sighting of another device and may be dropped without stopping the scan.
    pub fn start_scanning(&self) -> mpsc::UnboundedReceiver<PeerDescriptor> {
        self.stop_scanning();
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = self.backend.clone();
        let table = self.table.clone();
        let recv = tokio::spawn(async move {
            loop {
                match backend.next_sighting().await {
                    Ok(descriptor) => {
                        tracing::debug!(peer_id = %descriptor.peer_id, "sighting");
                        if table.observe(descriptor.clone()) {
                            let _ = tx.send(descriptor);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "discovery receive failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        let table = self.table.clone();
        let period = self.config.sweep_interval;
        let sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                table.sweep(Instant::now());
            }
        });
        *self.scanner.lock() = vec![recv, sweep];
        rx
    }

    /// End the scan session. Without a sweep running nothing would expire, so the peer
    /// table is cleared as well.
    pub fn stop_scanning(&self) {
        for task in self.scanner.lock().drain(..) {
            task.abort();
        }
        self.table.clear();
    }

    pub fn is_scanning(&self) -> bool {
        !self.scanner.lock().is_empty()
    }
}

impl<B: DiscoveryBackend> Drop for Discovery<B> {
    fn drop(&mut self) {
        self.stop_advertising();
        self.stop_scanning();
    }
}

fn jittered(interval: Duration, jitter: Duration) -> Duration {
    let max = jitter.as_millis() as u64;
    if max == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

async fn advertise_loop<B: DiscoveryBackend>(
    backend: Arc<B>,
    mut ad: Advertisement,
    config: DiscoveryConfig,
    mut summaries: watch::Receiver<Vec<ArtifactSummary>>,
) {
    let mut catalog_open = true;
    loop {
        let available = {
            let current = summaries.borrow_and_update();
            ad.fill(&current);
            current.len()
        };
        match backend.broadcast(&ad).await {
            Ok(()) => tracing::debug!(
                artifacts = ad.artifacts.len(),
                available,
                "beacon sent"
            ),
            Err(e) => tracing::warn!(error = %e, "beacon send failed"),
        }
        let next = tokio::time::sleep(jittered(config.beacon_interval, config.beacon_jitter));
        tokio::pin!(next);
        if !catalog_open {
            next.await;
            continue;
        }
        tokio::select! {
            _ = &mut next => {}
            changed = summaries.changed() => match changed {
                Ok(()) => tokio::time::sleep(config.debounce).await,
                Err(_) => {
                    catalog_open = false;
                    next.await;
                }
            },
        }
    }
}

/// UDP multicast beacons. Records each sender's transfer address.
pub struct UdpMulticast {
    socket: UdpSocket,
    dest: SocketAddr,
    local: PeerId,
    addresses: AddressBook,
}

impl UdpMulticast {
    pub async fn bind(port: u16, local: PeerId, addresses: AddressBook) -> io::Result<Self> {
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_sock)?;
        Ok(Self {
            socket,
            dest: SocketAddr::from((MULTICAST_GROUP, port)),
            local,
            addresses,
        })
    }
}

impl DiscoveryBackend for UdpMulticast {
    async fn broadcast(&self, ad: &Advertisement) -> io::Result<()> {
        let frame = encode_frame(&ad.to_message())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.socket.send_to(&frame, self.dest).await?;
        Ok(())
    }

    async fn next_sighting(&self) -> io::Result<PeerDescriptor> {
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let msg = match decode_frame(&buf[..n]) {
                Ok((msg, _)) => msg,
                Err(e) => {
                    tracing::warn!(%from, error = %e, "undecodable beacon");
                    continue;
                }
            };
            let kind = msg.kind();
            let Message::Beacon {
                protocol_version,
                peer_id,
                display_name,
                role,
                listen_port,
                artifacts,
            } = msg
            else {
                tracing::warn!(%from, kind, "unexpected datagram");
                continue;
            };
            if protocol_version != PROTOCOL_VERSION {
                tracing::debug!(%from, protocol_version, "ignoring beacon from other version");
                continue;
            }
            if peer_id == self.local {
                continue;
            }
            self.addresses
                .insert(peer_id.clone(), SocketAddr::new(from.ip(), listen_port));
            return Ok(PeerDescriptor {
                peer_id,
                display_name,
                role,
                signal_quality: SignalQuality::Unknown,
                advertised: artifacts,
            });
        }
    }
}

/// Deterministic backend for tests: the test pushes sightings and inspects beacons.
pub struct ScriptedDiscovery {
    tx: mpsc::UnboundedSender<PeerDescriptor>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerDescriptor>>,
    broadcasts: Mutex<Vec<Advertisement>>,
}

impl ScriptedDiscovery {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            broadcasts: Mutex::new(Vec::new()),
        })
    }

    pub fn sight(&self, descriptor: PeerDescriptor) {
        let _ = self.tx.send(descriptor);
    }

    pub fn broadcasts(&self) -> Vec<Advertisement> {
        self.broadcasts.lock().clone()
    }
}

impl DiscoveryBackend for ScriptedDiscovery {
    async fn broadcast(&self, ad: &Advertisement) -> io::Result<()> {
        self.broadcasts.lock().push(ad.clone());
        Ok(())
    }

    async fn next_sighting(&self) -> io::Result<PeerDescriptor> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "script ended"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_core::ArtifactId;

    fn hub(id: &str, artifacts: &[(&str, u64)]) -> PeerDescriptor {
        PeerDescriptor {
            peer_id: id.into(),
            display_name: format!("{id} tablet"),
            role: Role::Hub,
            signal_quality: SignalQuality::Good,
            advertised: artifacts
                .iter()
                .map(|(a, size)| ArtifactSummary {
                    id: ArtifactId::new(*a).unwrap(),
                    title: a.to_string(),
                    size_bytes: *size,
                })
                .collect(),
        }
    }

    fn summaries(n: usize) -> Vec<ArtifactSummary> {
        (0..n)
            .map(|i| ArtifactSummary {
                id: ArtifactId::new(format!("pdf-{i:03}")).unwrap(),
                title: format!("Sheet {i}"),
                size_bytes: 1000,
            })
            .collect()
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            display_name: "hub".into(),
            role: Role::Hub,
            ..DiscoveryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_sightings_dedup() {
        let table = PeerTable::new("me".into(), Duration::from_secs(16));
        let mut events = table.subscribe();
        assert!(table.observe(hub("hub-001", &[("pdf-001", 125_000)])));
        assert!(table.observe(hub("hub-001", &[("pdf-001", 125_000)])));
        assert_eq!(table.snapshot().len(), 1);
        assert!(matches!(events.try_recv().unwrap(), PeerEvent::Added(_)));
        assert!(events.try_recv().is_err());

        table.observe(hub("hub-001", &[("pdf-001", 125_000), ("pdf-002", 10)]));
        match events.try_recv().unwrap() {
            PeerEvent::Updated(d) => assert_eq!(d.advertised.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn own_beacon_ignored() {
        let table = PeerTable::new("me".into(), Duration::from_secs(16));
        assert!(!table.observe(hub("me", &[])));
        assert!(table.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_expires() {
        let table = PeerTable::new("me".into(), Duration::from_secs(16));
        table.observe(hub("hub-001", &[]));
        let mut events = table.subscribe();
        tokio::time::advance(Duration::from_secs(10)).await;
        table.observe(hub("hub-002", &[]));
        tokio::time::advance(Duration::from_secs(7)).await;

        assert_eq!(table.sweep(Instant::now()), vec![PeerId::new("hub-001")]);
        assert!(table.get(&"hub-001".into()).is_none());
        assert!(table.get(&"hub-002".into()).is_some());
        assert!(matches!(events.try_recv().unwrap(), PeerEvent::Added(_)));
        assert_eq!(
            events.try_recv().unwrap(),
            PeerEvent::Removed {
                peer_id: "hub-001".into(),
                reason: RemovalReason::Expired
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_are_immutable() {
        let table = PeerTable::new("me".into(), Duration::from_secs(16));
        table.observe(hub("hub-001", &[]));
        let before = table.snapshot();
        table.observe(hub("hub-002", &[]));
        assert_eq!(before.len(), 1);
        assert_eq!(table.snapshot().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn scanning_feeds_table_and_restart_resets() {
        let backend = ScriptedDiscovery::new();
        let discovery = Discovery::new("me".into(), config(), backend.clone());
        let table = discovery.peers();
        let mut events = table.subscribe();

        let mut rx = discovery.start_scanning();
        backend.sight(hub("me", &[]));
        backend.sight(hub("hub-001", &[("pdf-001", 125_000)]));
        let seen = rx.recv().await.unwrap();
        assert_eq!(seen.peer_id, PeerId::new("hub-001"));
        assert_eq!(table.snapshot().len(), 1);
        assert!(matches!(events.recv().await.unwrap(), PeerEvent::Added(_)));

        let _rx2 = discovery.start_scanning();
        assert!(table.snapshot().is_empty());
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Removed {
                peer_id: "hub-001".into(),
                reason: RemovalReason::ScanReset
            }
        );
        discovery.stop_scanning();
        discovery.stop_scanning();
        assert!(!discovery.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_scan_leaves_no_peers_behind() {
        let backend = ScriptedDiscovery::new();
        let discovery = Discovery::new("me".into(), config(), backend.clone());
        let table = discovery.peers();
        let mut events = table.subscribe();
        let _rx = discovery.start_scanning();
        backend.sight(hub("hub-001", &[("pdf-001", 125_000)]));
        assert!(matches!(events.recv().await.unwrap(), PeerEvent::Added(_)));

        discovery.stop_scanning();
        assert!(table.snapshot().is_empty());
        assert!(table.get(&"hub-001".into()).is_none());
        assert_eq!(
            events.recv().await.unwrap(),
            PeerEvent::Removed {
                peer_id: "hub-001".into(),
                reason: RemovalReason::ScanReset
            }
        );
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn scan_sweep_expires_silent_peers() {
        let backend = ScriptedDiscovery::new();
        let discovery = Discovery::new("me".into(), config(), backend.clone());
        let mut events = discovery.peers().subscribe();
        let _rx = discovery.start_scanning();
        backend.sight(hub("hub-001", &[]));
        assert!(matches!(events.recv().await.unwrap(), PeerEvent::Added(_)));
        tokio::time::sleep(Duration::from_secs(18)).await;
        assert!(matches!(
            events.recv().await.unwrap(),
            PeerEvent::Removed {
                reason: RemovalReason::Expired,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn advertiser_beacons_on_interval_and_changes() {
        let backend = ScriptedDiscovery::new();
        let discovery = Discovery::new("hub-001".into(), config(), backend.clone());
        let (tx, rx) = watch::channel(summaries(1));
        discovery.start_advertising(rx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(backend.broadcasts().len(), 1);
        assert_eq!(backend.broadcasts()[0].artifacts.len(), 1);
        assert_eq!(backend.broadcasts()[0].peer_id, PeerId::new("hub-001"));

        // Three quick changes coalesce into one beacon after the debounce.
        tx.send_replace(summaries(2));
        tx.send_replace(summaries(3));
        tx.send_replace(summaries(4));
        tokio::time::sleep(Duration::from_millis(600)).await;
        let sent = backend.broadcasts();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].artifacts.len(), 4);

        // Then the periodic beacon, within interval plus jitter.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(backend.broadcasts().len(), 3);

        discovery.stop_advertising();
        discovery.stop_advertising();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.broadcasts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn beacon_caps_summaries() {
        let backend = ScriptedDiscovery::new();
        let discovery = Discovery::new("hub-001".into(), config(), backend.clone());
        let (_tx, rx) = watch::channel(summaries(100));
        discovery.start_advertising(rx);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let ad = &backend.broadcasts()[0];
        assert_eq!(ad.artifacts.len(), MAX_ADVERTISED);
        assert_eq!(ad.artifacts[0].id.as_str(), "pdf-000");
    }

    #[tokio::test(start_paused = true)]
    async fn beacon_with_long_titles_fits_a_datagram() {
        let backend = ScriptedDiscovery::new();
        let discovery = Discovery::new("hub-001".into(), config(), backend.clone());
        let long: Vec<ArtifactSummary> = summaries(MAX_ADVERTISED)
            .into_iter()
            .map(|s| ArtifactSummary {
                title: "Long division practice ".repeat(90),
                ..s
            })
            .collect();
        let (_tx, rx) = watch::channel(long);
        discovery.start_advertising(rx);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let ad = &backend.broadcasts()[0];
        let frame = encode_frame(&ad.to_message()).unwrap();
        assert!(frame.len() <= MAX_BEACON_BYTES, "{} bytes", frame.len());
        assert!(!ad.artifacts.is_empty());
        assert!(ad.artifacts.len() < MAX_ADVERTISED);
        assert_eq!(ad.artifacts[0].id.as_str(), "pdf-000");
    }

    #[tokio::test(start_paused = true)]
    async fn advertiser_survives_closed_catalog() {
        let backend = ScriptedDiscovery::new();
        let discovery = Discovery::new("hub-001".into(), config(), backend.clone());
        let (tx, rx) = watch::channel(summaries(1));
        discovery.start_advertising(rx);
        drop(tx);
        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(backend.broadcasts().len() >= 3);
    }

    #[test]
    fn beacon_message_carries_version() {
        let ad = Advertisement {
            peer_id: "hub-001".into(),
            display_name: "Hub".into(),
            role: Role::Hub,
            listen_port: 45681,
            artifacts: summaries(2),
        };
        match ad.to_message() {
            Message::Beacon {
                protocol_version,
                artifacts,
                ..
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(artifacts.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
