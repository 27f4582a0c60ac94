//! Peer and connection management.
//!
//! Owns the peer records and every open channel. All outbound frames are
//! built and signed here; inbound frames are signature-checked, answered
//! (Ping/Pong) or forwarded to the engine's inbound queue. Peer status is
//! mutated by this module only.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mesh_crypto::{verify_signature, MeshKeypair};
use mesh_types::{
    frame::{decode_payload, encode_payload},
    CapabilitySnapshot, Frame, FrameKind, MeshError, NodeId, PingPayload, PongPayload, PublicKey,
    Result,
};

use crate::config::MeshConfig;
use crate::events::{EventBus, MeshEvent};
use crate::now_ms;
use crate::telemetry::TelemetrySource;
use crate::transport::{Transport, TransportChannel};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const RATE_WINDOW: Duration = Duration::from_secs(1);
const RATE_WINDOW_CAP: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Default)]
pub struct MessageStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub invalid_signatures: u64,
}

#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub node_id: NodeId,
    pub public_key: Option<PublicKey>,
    pub capabilities: Option<CapabilitySnapshot>,
    pub reputation: f64,
    pub status: PeerStatus,
    pub last_seen: Instant,
    pub last_seen_ms: i64,
    pub latency_ms: Option<u64>,
    pub connect_attempts: u32,
    pub stats: MessageStats,
}

impl PeerRecord {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            public_key: None,
            capabilities: None,
            reputation: 0.5,
            status: PeerStatus::Disconnected,
            last_seen: Instant::now(),
            last_seen_ms: now_ms(),
            latency_ms: None,
            connect_attempts: 0,
            stats: MessageStats::default(),
        }
    }
}

struct OpenChannel {
    sender: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
}

pub struct PeerManager {
    local_id: NodeId,
    keypair: Arc<MeshKeypair>,
    transport: Arc<dyn Transport>,
    telemetry: Arc<dyn TelemetrySource>,
    peers: Arc<RwLock<HashMap<NodeId, PeerRecord>>>,
    channels: Arc<RwLock<HashMap<NodeId, OpenChannel>>>,
    rates: Arc<RwLock<HashMap<NodeId, VecDeque<Instant>>>>,
    pending_pings: Arc<RwLock<HashMap<u64, oneshot::Sender<u64>>>>,
    inbound_tx: mpsc::UnboundedSender<Frame>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Frame>>>,
    next_frame_id: AtomicU64,
    parse_failures: AtomicU64,
    ping_interval: Duration,
    stale_timeout: Duration,
    connect_backoff: Duration,
    events: EventBus,
    shutdown: Arc<AtomicBool>,
}

impl PeerManager {
    pub fn new(
        keypair: Arc<MeshKeypair>,
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn TelemetrySource>,
        config: &MeshConfig,
        events: EventBus,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            local_id: keypair.node_id(),
            keypair,
            transport,
            telemetry,
            peers: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            rates: Arc::new(RwLock::new(HashMap::new())),
            pending_pings: Arc::new(RwLock::new(HashMap::new())),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            next_frame_id: AtomicU64::new(1),
            parse_failures: AtomicU64::new(0),
            ping_interval: config.ping_interval,
            stale_timeout: config.peer_stale_timeout,
            connect_backoff: config.connect_backoff,
            events,
            shutdown,
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    /// The engine takes this exactly once and fans frames out by kind.
    pub async fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Frame>> {
        self.inbound_rx.lock().await.take()
    }

    /// Capability snapshot of the local device, from the telemetry seam.
    pub async fn local_capabilities(&self) -> Result<CapabilitySnapshot> {
        self.telemetry.capabilities().await
    }

    /// Record a peer learned out-of-band (discovery, directory response).
    /// Never downgrades an existing record.
    pub async fn register_peer(
        &self,
        node_id: NodeId,
        public_key: Option<PublicKey>,
        capabilities: Option<CapabilitySnapshot>,
        reputation: Option<f64>,
    ) {
        if node_id == self.local_id {
            return;
        }
        let mut peers = self.peers.write().await;
        let is_new = !peers.contains_key(&node_id);
        let record = peers.entry(node_id).or_insert_with(|| PeerRecord::new(node_id));
        if record.public_key.is_none() {
            record.public_key = public_key;
        }
        if let Some(caps) = capabilities {
            record.capabilities = Some(caps);
        }
        // A remote claim seeds the score for a new peer; it never overrides
        // the locally derived one.
        if is_new {
            if let Some(rep) = reputation {
                record.reputation = rep.clamp(0.0, 1.0);
            }
        }
    }

    pub async fn update_capabilities(&self, peer: &NodeId, capabilities: CapabilitySnapshot) {
        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(peer) {
            record.capabilities = Some(capabilities);
        }
    }

    /// Reputation write-through from verification finalization.
    pub async fn set_reputation(&self, peer: &NodeId, score: f64) {
        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(peer) {
            record.reputation = score.clamp(0.0, 1.0);
        }
    }

    pub async fn peer_info(&self, peer: &NodeId) -> Option<PeerRecord> {
        self.peers.read().await.get(peer).cloned()
    }

    pub async fn all_peers(&self) -> Vec<PeerRecord> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn connected_peers(&self) -> Vec<NodeId> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.status == PeerStatus::Connected)
            .map(|p| p.node_id)
            .collect()
    }

    pub async fn connected_count(&self) -> usize {
        self.connected_peers().await.len()
    }

    pub async fn known_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub fn parse_failure_count(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    /// Frames received from each peer within the last second. Input to the
    /// spam detector.
    pub async fn frame_rates(&self) -> HashMap<NodeId, usize> {
        let now = Instant::now();
        let mut rates = self.rates.write().await;
        let mut out = HashMap::new();
        for (peer, window) in rates.iter_mut() {
            while let Some(front) = window.front() {
                if now.duration_since(*front) > RATE_WINDOW {
                    window.pop_front();
                } else {
                    break;
                }
            }
            out.insert(*peer, window.len());
        }
        out
    }

    /// Open a channel to `peer`. A no-op success when one is already open.
    /// Fails with `ConnectAttemptsExhausted` after three dial attempts.
    pub async fn connect(self: &Arc<Self>, peer: NodeId) -> Result<()> {
        if peer == self.local_id {
            return Err(MeshError::Network("cannot connect to self".to_string()));
        }
        if self.channels.read().await.contains_key(&peer) {
            return Ok(());
        }

        self.set_status(&peer, PeerStatus::Connecting, true).await;

        for attempt in 0..MAX_CONNECT_ATTEMPTS {
            match self.transport.dial(peer).await {
                Ok(channel) => {
                    self.install_channel(peer, channel).await;
                    let mut peers = self.peers.write().await;
                    if let Some(record) = peers.get_mut(&peer) {
                        record.connect_attempts = 0;
                    }
                    return Ok(());
                }
                Err(e) => {
                    let mut peers = self.peers.write().await;
                    if let Some(record) = peers.get_mut(&peer) {
                        record.connect_attempts += 1;
                    }
                    drop(peers);
                    warn!(
                        peer = %peer,
                        attempt = attempt + 1,
                        error = %e,
                        "connect attempt failed"
                    );
                    if attempt + 1 < MAX_CONNECT_ATTEMPTS {
                        tokio::time::sleep(self.connect_backoff * 2u32.pow(attempt)).await;
                    }
                }
            }
        }

        self.set_status(&peer, PeerStatus::Failed, false).await;
        Err(MeshError::ConnectAttemptsExhausted(peer))
    }

    pub async fn disconnect(&self, peer: &NodeId) {
        let removed = self.channels.write().await.remove(peer);
        if let Some(channel) = removed {
            channel.reader.abort();
            self.set_status(peer, PeerStatus::Disconnected, false).await;
            self.events.emit(MeshEvent::PeerDisconnected { peer: *peer });
            info!(peer = %peer, "👋 Peer disconnected");
        }
    }

    /// Send one frame. Success iff a channel is open and has buffer space;
    /// never blocks, never retransmits.
    pub async fn send(&self, to: NodeId, kind: FrameKind, payload: Vec<u8>) -> Result<()> {
        let frame = self.make_frame(kind, to, payload)?;
        let channels = self.channels.read().await;
        let channel = channels
            .get(&to)
            .ok_or(MeshError::UnknownPeer(to))?;
        channel
            .sender
            .try_send(frame)
            .map_err(|e| MeshError::Network(format!("send to {} failed: {}", to, e)))?;
        drop(channels);

        let mut peers = self.peers.write().await;
        if let Some(record) = peers.get_mut(&to) {
            record.stats.frames_sent += 1;
        }
        Ok(())
    }

    /// Send to every connected peer; returns the number of frames that were
    /// accepted by a channel.
    pub async fn broadcast(&self, kind: FrameKind, payload: Vec<u8>) -> usize {
        let targets: Vec<NodeId> = self.channels.read().await.keys().copied().collect();
        let mut sent = 0;
        for peer in targets {
            if self.send(peer, kind, payload.clone()).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Round-trip ping with an explicit deadline. Used by routing-table
    /// eviction checks; the periodic liveness ping is fire-and-forget.
    pub async fn ping(&self, peer: NodeId, deadline: Duration) -> Result<u64> {
        let nonce: u64 = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pending_pings.write().await.insert(nonce, tx);

        let payload = encode_payload(&PingPayload { nonce })?;
        if let Err(e) = self.send(peer, FrameKind::Ping, payload).await {
            self.pending_pings.write().await.remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(latency)) => Ok(latency),
            _ => {
                self.pending_pings.write().await.remove(&nonce);
                Err(MeshError::QueryTimeout)
            }
        }
    }

    /// Accept loop plus the 30 s liveness/eviction loop.
    pub fn start(self: &Arc<Self>) {
        self.spawn_accept_loop();
        self.spawn_liveness_loop();
    }

    /// Close every channel. Called by the engine during shutdown after the
    /// shutdown flag is set.
    pub async fn stop(&self) {
        let mut channels = self.channels.write().await;
        for (peer, channel) in channels.drain() {
            channel.reader.abort();
            let mut peers = self.peers.write().await;
            if let Some(record) = peers.get_mut(&peer) {
                record.status = PeerStatus::Disconnected;
            }
        }
        info!("peer manager stopped, all channels closed");
    }

    fn make_frame(&self, kind: FrameKind, to: NodeId, payload: Vec<u8>) -> Result<Frame> {
        let mut frame = Frame {
            frame_id: self.next_frame_id.fetch_add(1, Ordering::Relaxed),
            kind,
            from: self.local_id,
            to,
            timestamp_ms: now_ms(),
            payload,
            signature: None,
        };
        frame.signature = Some(self.keypair.sign(&frame.signable_bytes()?));
        Ok(frame)
    }

    async fn set_status(&self, peer: &NodeId, status: PeerStatus, create: bool) {
        let mut peers = self.peers.write().await;
        let record = if create {
            Some(peers.entry(*peer).or_insert_with(|| PeerRecord::new(*peer)))
        } else {
            peers.get_mut(peer)
        };
        if let Some(record) = record {
            record.status = status;
        }
    }

    async fn install_channel(self: &Arc<Self>, peer: NodeId, channel: TransportChannel) {
        let TransportChannel { sender, receiver } = channel;
        let reader = self.spawn_reader(peer, receiver);

        let previous = self
            .channels
            .write()
            .await
            .insert(peer, OpenChannel { sender, reader });
        if let Some(previous) = previous {
            previous.reader.abort();
        }

        {
            let mut peers = self.peers.write().await;
            let record = peers.entry(peer).or_insert_with(|| PeerRecord::new(peer));
            record.status = PeerStatus::Connected;
            record.last_seen = Instant::now();
            record.last_seen_ms = now_ms();
        }

        self.events.emit(MeshEvent::PeerConnected { peer });
        info!(peer = %peer, "🤝 Peer connected");
    }

    fn spawn_reader(self: &Arc<Self>, peer: NodeId, mut receiver: mpsc::Receiver<Frame>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                manager.handle_inbound(peer, frame).await;
            }
            // Remote end closed the channel.
            manager.on_channel_closed(peer).await;
        })
    }

    async fn on_channel_closed(&self, peer: NodeId) {
        if self.shutdown.load(Ordering::Relaxed) {
            return;
        }
        if self.channels.write().await.remove(&peer).is_some() {
            self.set_status(&peer, PeerStatus::Disconnected, false).await;
            self.events.emit(MeshEvent::PeerDisconnected { peer });
            debug!(peer = %peer, "channel closed by remote");
        }
    }

    async fn handle_inbound(&self, peer: NodeId, frame: Frame) {
        // Track receive activity first; the spam detector wants every frame.
        {
            let mut rates = self.rates.write().await;
            let window = rates.entry(peer).or_default();
            window.push_back(Instant::now());
            if window.len() > RATE_WINDOW_CAP {
                window.pop_front();
            }
        }
        {
            let mut peers = self.peers.write().await;
            let record = peers.entry(peer).or_insert_with(|| PeerRecord::new(peer));
            record.stats.frames_received += 1;
            record.last_seen = Instant::now();
            record.last_seen_ms = now_ms();
        }

        if !self.verify_frame(&peer, &frame).await {
            let mut peers = self.peers.write().await;
            if let Some(record) = peers.get_mut(&peer) {
                record.stats.invalid_signatures += 1;
            }
            warn!(peer = %peer, kind = ?frame.kind, "dropping frame with invalid signature");
            return;
        }

        match frame.kind {
            FrameKind::Ping => {
                let Ok(ping) = decode_payload::<PingPayload>(&frame.payload) else {
                    self.parse_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let pong = PongPayload {
                    nonce: ping.nonce,
                    echo_timestamp_ms: frame.timestamp_ms,
                };
                if let Ok(payload) = encode_payload(&pong) {
                    let _ = self.send(peer, FrameKind::Pong, payload).await;
                }
            }
            FrameKind::Pong => {
                let Ok(pong) = decode_payload::<PongPayload>(&frame.payload) else {
                    self.parse_failures.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let latency = (now_ms() - pong.echo_timestamp_ms).max(0) as u64;
                {
                    let mut peers = self.peers.write().await;
                    if let Some(record) = peers.get_mut(&peer) {
                        record.latency_ms = Some(latency);
                    }
                }
                if let Some(waiter) = self.pending_pings.write().await.remove(&pong.nonce) {
                    let _ = waiter.send(latency);
                }
            }
            _ => {
                // Upper layers own everything else.
                let _ = self.inbound_tx.send(frame);
            }
        }
    }

    /// Signature policy: Ping/Pong may travel unsigned; anything else must
    /// carry a signature. A signature is checked whenever the sender's key
    /// is known; an unknown key is accepted until an advertisement binds
    /// one (trust on first use).
    async fn verify_frame(&self, peer: &NodeId, frame: &Frame) -> bool {
        let liveness = matches!(frame.kind, FrameKind::Ping | FrameKind::Pong);
        let Some(signature) = &frame.signature else {
            return liveness;
        };

        let known_key = self
            .peers
            .read()
            .await
            .get(peer)
            .and_then(|record| record.public_key);
        match known_key {
            Some(key) => match frame.signable_bytes() {
                Ok(bytes) => verify_signature(&key, &bytes, signature),
                Err(_) => false,
            },
            None => true,
        }
    }

    fn spawn_accept_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if manager.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match tokio::time::timeout(Duration::from_millis(500), manager.transport.accept())
                    .await
                {
                    Ok(Some((peer, channel))) => {
                        manager.install_channel(peer, channel).await;
                    }
                    Ok(None) => break,
                    Err(_) => continue,
                }
            }
            debug!("accept loop stopped");
        });
    }

    fn spawn_liveness_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.ping_interval);
            loop {
                interval.tick().await;
                if manager.shutdown.load(Ordering::Relaxed) {
                    break;
                }

                for peer in manager.connected_peers().await {
                    let nonce: u64 = rand::random();
                    if let Ok(payload) = encode_payload(&PingPayload { nonce }) {
                        let _ = manager.send(peer, FrameKind::Ping, payload).await;
                    }
                }

                manager.evict_stale_peers().await;
            }
        });
    }

    async fn evict_stale_peers(&self) {
        let now = Instant::now();
        let stale: Vec<NodeId> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| now.duration_since(p.last_seen) > self.stale_timeout)
            .map(|p| p.node_id)
            .collect();

        for peer in stale {
            self.disconnect(&peer).await;
            self.peers.write().await.remove(&peer);
            self.rates.write().await.remove(&peer);
            info!(peer = %peer, "🧹 Evicted stale peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::StaticTelemetry;
    use crate::transport::MemoryHub;
    use mesh_types::{ComputeTier, ThermalState};

    fn snapshot() -> CapabilitySnapshot {
        CapabilitySnapshot {
            tier: ComputeTier::Medium,
            cpu_cores: 4,
            ram_gb: 8,
            storage_gb: 128,
            gpu_available: false,
            bandwidth_mbps: 40.0,
            battery_pct: Some(90),
            thermal: ThermalState::Nominal,
        }
    }

    async fn manager_on(hub: &Arc<MemoryHub>) -> Arc<PeerManager> {
        let keypair = Arc::new(MeshKeypair::generate());
        let transport = Arc::new(hub.attach(keypair.node_id()).await);
        let manager = PeerManager::new(
            keypair,
            transport,
            Arc::new(StaticTelemetry::new(snapshot())),
            &MeshConfig::default(),
            EventBus::new(),
            Arc::new(AtomicBool::new(false)),
        );
        manager.start();
        manager
    }

    #[tokio::test]
    async fn test_connect_send_receive() {
        let hub = MemoryHub::new();
        let a = manager_on(&hub).await;
        let b = manager_on(&hub).await;

        a.connect(b.local_id()).await.unwrap();
        // Connecting twice is a no-op success.
        a.connect(b.local_id()).await.unwrap();

        let mut inbound_b = b.take_inbound().await.unwrap();
        a.send(b.local_id(), FrameKind::TaskResponse, vec![1, 2, 3])
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), inbound_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, FrameKind::TaskResponse);
        assert_eq!(frame.from, a.local_id());
    }

    #[tokio::test]
    async fn test_connect_exhaustion() {
        let hub = MemoryHub::new();
        let a = manager_on(&hub).await;
        let ghost = NodeId::random();

        let err = a.connect(ghost).await.unwrap_err();
        assert!(matches!(err, MeshError::ConnectAttemptsExhausted(p) if p == ghost));
        let record = a.peer_info(&ghost).await.unwrap();
        assert_eq!(record.status, PeerStatus::Failed);
        assert_eq!(record.connect_attempts, 3);
    }

    #[tokio::test]
    async fn test_ping_measures_latency() {
        let hub = MemoryHub::new();
        let a = manager_on(&hub).await;
        let b = manager_on(&hub).await;
        a.connect(b.local_id()).await.unwrap();

        let latency = a.ping(b.local_id(), Duration::from_secs(1)).await.unwrap();
        assert!(latency < 1_000);
        assert!(a.peer_info(&b.local_id()).await.unwrap().latency_ms.is_some());
    }

    #[tokio::test]
    async fn test_ping_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let a = manager_on(&hub).await;
        assert!(a.ping(NodeId::random(), Duration::from_millis(100)).await.is_err());
    }

    #[tokio::test]
    async fn test_broadcast_counts_connected() {
        let hub = MemoryHub::new();
        let a = manager_on(&hub).await;
        let b = manager_on(&hub).await;
        let c = manager_on(&hub).await;

        a.connect(b.local_id()).await.unwrap();
        a.connect(c.local_id()).await.unwrap();

        let sent = a.broadcast(FrameKind::TaskResponse, vec![0]).await;
        assert_eq!(sent, 2);
    }

    #[tokio::test]
    async fn test_disconnect_updates_status() {
        let hub = MemoryHub::new();
        let a = manager_on(&hub).await;
        let b = manager_on(&hub).await;

        a.connect(b.local_id()).await.unwrap();
        a.disconnect(&b.local_id()).await;

        let record = a.peer_info(&b.local_id()).await.unwrap();
        assert_eq!(record.status, PeerStatus::Disconnected);
        assert!(a
            .send(b.local_id(), FrameKind::TaskResponse, vec![])
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_local_capabilities_via_telemetry() {
        let hub = MemoryHub::new();
        let a = manager_on(&hub).await;
        assert_eq!(a.local_capabilities().await.unwrap().cpu_cores, 4);
    }

    #[tokio::test]
    async fn test_invalid_signature_dropped_and_counted() {
        let hub = MemoryHub::new();
        let a = manager_on(&hub).await;
        let b = manager_on(&hub).await;

        a.connect(b.local_id()).await.unwrap();
        // B learns A's real key, then A sends a frame whose signature
        // cannot match it.
        b.register_peer(a.local_id(), Some(a.public_key()), None, None)
            .await;

        let mut inbound_b = b.take_inbound().await.unwrap();
        let mut frame = a
            .make_frame(FrameKind::TaskResponse, b.local_id(), vec![9])
            .unwrap();
        frame.signature = Some(mesh_types::Signature::new(vec![0u8; 64]));

        let channels = a.channels.read().await;
        channels
            .get(&b.local_id())
            .unwrap()
            .sender
            .try_send(frame)
            .unwrap();
        drop(channels);

        assert!(
            tokio::time::timeout(Duration::from_millis(300), inbound_b.recv())
                .await
                .is_err()
        );
        let record = b.peer_info(&a.local_id()).await.unwrap();
        assert_eq!(record.stats.invalid_signatures, 1);
    }
}
