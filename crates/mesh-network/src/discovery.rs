//! Peer discovery, advertisements, and multi-hop routing paths.
//!
//! Discovery mechanisms run in priority order (DHT lookup, neighbor
//! exchange, bootstrap, relay, mDNS); each keeps success statistics but is
//! never disabled by a bad streak. The advertisement catalog and the path
//! table are owned here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use mesh_crypto::{node_id_for, verify_signature, MeshKeypair};
use mesh_types::{
    frame::encode_payload, CapabilitySnapshot, DhtNodeInfo, DiscoveryMethod, DiscoveryPayload,
    FrameKind, MeshError, NodeId, PeerAdvertisement, PeerSummary, PublicKey, Result,
};

use crate::config::MeshConfig;
use crate::dht::DhtService;
use crate::events::{EventBus, MeshEvent};
use crate::now_ms;
use crate::peer::{PeerManager, PeerStatus};

const ADVERTISEMENT_TTL: Duration = Duration::from_secs(300);
const NEIGHBOR_LIMIT: usize = 10;
const PEER_LIST_LIMIT: usize = 20;
const RELAY_MIN_BANDWIDTH_MBPS: f64 = 10.0;
const RELAY_CANDIDATES: usize = 3;
const PATHS_PER_DESTINATION: usize = 5;
const PATH_EWMA_ALPHA: f64 = 0.3;

/// A scored multi-hop route. `hops` always ends with the destination.
#[derive(Debug, Clone)]
pub struct RoutingPath {
    pub destination: NodeId,
    pub hops: Vec<NodeId>,
    pub latency_ms: u64,
    pub reliability: f64,
    pub last_used: Instant,
    pub use_count: u64,
}

impl RoutingPath {
    pub fn score(&self) -> f64 {
        let latency_score = (100.0 - self.latency_ms as f64).max(0.0) / 100.0;
        let freshness =
            (1.0 - self.last_used.elapsed().as_secs_f64() / 86_400.0).max(0.0);
        let usage_bonus = (self.use_count as f64 * 0.01).min(0.2);
        0.4 * latency_score + 0.4 * self.reliability + 0.1 * freshness + 0.1 * usage_bonus
    }

    /// EWMA reliability update from one use of the path.
    pub fn record_use(&mut self, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        self.reliability = (1.0 - PATH_EWMA_ALPHA) * self.reliability + PATH_EWMA_ALPHA * sample;
        self.last_used = Instant::now();
        self.use_count += 1;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MethodStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

impl MethodStats {
    /// Success rate; a method with no history counts as healthy.
    pub fn health(&self) -> f64 {
        if self.attempts == 0 {
            1.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// A peer learned through any discovery mechanism, before it has a full
/// record.
#[derive(Debug, Clone)]
struct Discovered {
    node_id: NodeId,
    public_key: Option<PublicKey>,
    capabilities: Option<CapabilitySnapshot>,
    reputation: Option<f64>,
}

impl From<DhtNodeInfo> for Discovered {
    fn from(info: DhtNodeInfo) -> Self {
        Self {
            node_id: info.node_id,
            public_key: None,
            capabilities: Some(info.capabilities),
            reputation: Some(info.reputation),
        }
    }
}

impl From<PeerSummary> for Discovered {
    fn from(summary: PeerSummary) -> Self {
        Self {
            node_id: summary.node_id,
            public_key: summary.public_key,
            capabilities: Some(summary.capabilities),
            reputation: Some(summary.reputation),
        }
    }
}

pub struct PeerDiscovery {
    local_id: NodeId,
    keypair: Arc<MeshKeypair>,
    peer: Arc<PeerManager>,
    dht: Arc<DhtService>,
    methods: Vec<DiscoveryMethod>,
    max_peers: usize,
    bootstrap_nodes: Vec<NodeId>,
    discovery_interval: Duration,
    topology_interval: Duration,
    query_timeout: Duration,
    path_query_timeout: Duration,
    ads: Arc<RwLock<HashMap<NodeId, (PeerAdvertisement, Instant)>>>,
    paths: Arc<RwLock<HashMap<NodeId, Vec<RoutingPath>>>>,
    method_stats: Arc<RwLock<HashMap<DiscoveryMethod, MethodStats>>>,
    pending_peers: Arc<RwLock<HashMap<u64, oneshot::Sender<Vec<PeerSummary>>>>>,
    pending_paths: Arc<RwLock<HashMap<u64, oneshot::Sender<bool>>>>,
    next_request_id: AtomicU64,
    events: EventBus,
    shutdown: Arc<AtomicBool>,
}

impl PeerDiscovery {
    pub fn new(
        keypair: Arc<MeshKeypair>,
        peer: Arc<PeerManager>,
        dht: Arc<DhtService>,
        config: &MeshConfig,
        events: EventBus,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: keypair.node_id(),
            keypair,
            peer,
            dht,
            methods: config.discovery_methods.clone(),
            max_peers: config.max_peers,
            bootstrap_nodes: config.bootstrap_nodes.clone(),
            discovery_interval: config.discovery_interval,
            topology_interval: config.topology_interval,
            query_timeout: config.query_timeout,
            path_query_timeout: config.path_query_timeout,
            ads: Arc::new(RwLock::new(HashMap::new())),
            paths: Arc::new(RwLock::new(HashMap::new())),
            method_stats: Arc::new(RwLock::new(HashMap::new())),
            pending_peers: Arc::new(RwLock::new(HashMap::new())),
            pending_paths: Arc::new(RwLock::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            events,
            shutdown,
        })
    }

    pub async fn method_stats(&self) -> HashMap<DiscoveryMethod, MethodStats> {
        self.method_stats.read().await.clone()
    }

    pub async fn advertisement_count(&self) -> usize {
        self.ads.read().await.len()
    }

    /// Run every enabled method in priority order until the catalog is full
    /// or all methods are exhausted. Returns peers not previously known.
    pub async fn discover(self: &Arc<Self>) -> Vec<NodeId> {
        let mut newly_known = Vec::new();

        for method in self.methods.clone() {
            if self.peer.known_count().await >= self.max_peers {
                break;
            }

            let found = match method {
                DiscoveryMethod::Dht => self.discover_via_dht().await,
                DiscoveryMethod::PeerExchange => self.discover_via_neighbors().await,
                DiscoveryMethod::Bootstrap => self.discover_via_bootstrap().await,
                DiscoveryMethod::Relay => self.discover_via_relay().await,
                // mDNS discovery belongs to the local-network transport;
                // the hook records the attempt and yields nothing here.
                DiscoveryMethod::Mdns => Ok(Vec::new()),
            };

            let mut stats = self.method_stats.write().await;
            let entry = stats.entry(method).or_default();
            entry.attempts += 1;
            match &found {
                Ok(peers) => {
                    if peers.is_empty() {
                        entry.failures += 1;
                    } else {
                        entry.successes += 1;
                    }
                }
                Err(_) => entry.failures += 1,
            }
            drop(stats);

            let Ok(found) = found else { continue };
            for discovered in found {
                if discovered.node_id == self.local_id {
                    continue;
                }
                let already_known = self.peer.peer_info(&discovered.node_id).await.is_some();
                self.peer
                    .register_peer(
                        discovered.node_id,
                        discovered.public_key,
                        discovered.capabilities.clone(),
                        discovered.reputation,
                    )
                    .await;
                if let Some(caps) = discovered.capabilities {
                    self.dht
                        .add_or_update(DhtNodeInfo {
                            node_id: discovered.node_id,
                            capabilities: caps,
                            reputation: discovered.reputation.unwrap_or(0.5),
                            last_seen_ms: now_ms(),
                        })
                        .await;
                }
                if !already_known {
                    newly_known.push(discovered.node_id);
                }
            }
        }

        if !newly_known.is_empty() {
            info!(count = newly_known.len(), "🔍 Discovered new peers");
            self.events.emit(MeshEvent::PeersDiscovered {
                peers: newly_known.clone(),
            });
        }
        newly_known
    }

    async fn discover_via_dht(self: &Arc<Self>) -> Result<Vec<Discovered>> {
        let target = NodeId::random();
        let nodes = self.dht.lookup(target).await;
        Ok(nodes.into_iter().map(Discovered::from).collect())
    }

    async fn discover_via_neighbors(&self) -> Result<Vec<Discovered>> {
        let mut found = Vec::new();
        for peer in self
            .peer
            .connected_peers()
            .await
            .into_iter()
            .take(NEIGHBOR_LIMIT)
        {
            if let Ok(peers) = self
                .peer_query(peer, |request_id| DiscoveryPayload::NeighborRequest { request_id })
                .await
            {
                found.extend(peers.into_iter().map(Discovered::from));
            }
        }
        Ok(found)
    }

    async fn discover_via_bootstrap(self: &Arc<Self>) -> Result<Vec<Discovered>> {
        let mut found = Vec::new();
        for node in self.bootstrap_nodes.clone() {
            if node == self.local_id {
                continue;
            }
            let known = self.peer.peer_info(&node).await;
            let connected = known
                .as_ref()
                .map(|r| r.status == PeerStatus::Connected)
                .unwrap_or(false);
            if connected {
                continue;
            }
            if self.peer.connect(node).await.is_ok() && known.is_none() {
                found.push(Discovered {
                    node_id: node,
                    public_key: None,
                    capabilities: None,
                    reputation: None,
                });
            }
        }
        Ok(found)
    }

    async fn discover_via_relay(&self) -> Result<Vec<Discovered>> {
        let relays: Vec<NodeId> = self
            .peer
            .all_peers()
            .await
            .into_iter()
            .filter(|r| {
                r.status == PeerStatus::Connected
                    && r.capabilities
                        .as_ref()
                        .map(|c| c.bandwidth_mbps >= RELAY_MIN_BANDWIDTH_MBPS)
                        .unwrap_or(false)
            })
            .map(|r| r.node_id)
            .collect();

        let mut found = Vec::new();
        for relay in relays {
            if let Ok(peers) = self
                .peer_query(relay, |request_id| DiscoveryPayload::PeerListRequest { request_id })
                .await
            {
                found.extend(peers.into_iter().map(Discovered::from));
            }
        }
        Ok(found)
    }

    /// Broadcast a signed self-advertisement to every connected peer.
    pub async fn advertise_self(&self) -> Result<usize> {
        let capabilities = self.peer.local_capabilities().await?;
        let mut advertisement = PeerAdvertisement {
            node_id: self.local_id,
            public_key: self.keypair.public_key(),
            capabilities,
            endpoints: vec![],
            methods: self.methods.clone(),
            timestamp_ms: now_ms(),
            ttl_ms: ADVERTISEMENT_TTL.as_millis() as u64,
            signature: None,
        };
        advertisement.signature = Some(self.keypair.sign(&advertisement.signable()?));

        let payload = encode_payload(&DiscoveryPayload::Advertisement { advertisement })?;
        Ok(self.peer.broadcast(FrameKind::PeerDiscovery, payload).await)
    }

    /// Connect to a peer: direct first, then via up to three
    /// bandwidth-sufficient relays.
    pub async fn connect(self: &Arc<Self>, peer: NodeId) -> Result<()> {
        let direct = self.peer.connect(peer).await;
        let Err(direct_err) = direct else {
            self.note_direct_path(peer).await;
            return Ok(());
        };

        let relays: Vec<NodeId> = self
            .peer
            .all_peers()
            .await
            .into_iter()
            .filter(|r| {
                r.node_id != peer
                    && r.status == PeerStatus::Connected
                    && r.capabilities
                        .as_ref()
                        .map(|c| c.bandwidth_mbps >= RELAY_MIN_BANDWIDTH_MBPS)
                        .unwrap_or(false)
            })
            .map(|r| r.node_id)
            .take(RELAY_CANDIDATES)
            .collect();

        for relay in relays {
            match self.path_query(relay, peer).await {
                Ok(true) => {
                    let latency = self
                        .peer
                        .peer_info(&relay)
                        .await
                        .and_then(|r| r.latency_ms)
                        .unwrap_or(100);
                    self.insert_path(RoutingPath {
                        destination: peer,
                        hops: vec![relay, peer],
                        latency_ms: latency.saturating_add(latency),
                        reliability: 0.7,
                        last_used: Instant::now(),
                        use_count: 0,
                    })
                    .await;
                    self.peer.register_peer(peer, None, None, None).await;
                    info!(peer = %peer, relay = %relay, "connected via relay path");
                    return Ok(());
                }
                Ok(false) | Err(_) => continue,
            }
        }

        Err(direct_err)
    }

    /// The best known path to `dest`; probes connected intermediates when
    /// nothing is cached.
    pub async fn find_optimal_path(self: &Arc<Self>, dest: NodeId) -> Option<RoutingPath> {
        if let Some(best) = self.best_path(&dest).await {
            return Some(best);
        }

        let intermediates: Vec<NodeId> = self
            .peer
            .connected_peers()
            .await
            .into_iter()
            .filter(|p| *p != dest)
            .collect();

        for via in intermediates {
            match self.path_query(via, dest).await {
                Ok(true) => {
                    let latency = self
                        .peer
                        .peer_info(&via)
                        .await
                        .and_then(|r| r.latency_ms)
                        .unwrap_or(100);
                    self.insert_path(RoutingPath {
                        destination: dest,
                        hops: vec![via, dest],
                        latency_ms: latency.saturating_add(latency),
                        reliability: 0.7,
                        last_used: Instant::now(),
                        use_count: 0,
                    })
                    .await;
                }
                Ok(false) | Err(_) => continue,
            }
        }

        self.best_path(&dest).await
    }

    async fn best_path(&self, dest: &NodeId) -> Option<RoutingPath> {
        let paths = self.paths.read().await;
        paths.get(dest).and_then(|list| {
            list.iter()
                .max_by(|a, b| a.score().total_cmp(&b.score()))
                .cloned()
        })
    }

    async fn insert_path(&self, path: RoutingPath) {
        let mut paths = self.paths.write().await;
        let list = paths.entry(path.destination).or_default();
        if let Some(existing) = list.iter_mut().find(|p| p.hops == path.hops) {
            existing.latency_ms = path.latency_ms;
            existing.last_used = path.last_used;
        } else {
            list.push(path);
        }
        list.sort_by(|a, b| b.score().total_cmp(&a.score()));
        list.truncate(PATHS_PER_DESTINATION);
    }

    /// Feed a path-use outcome back into its reliability estimate.
    pub async fn record_path_use(&self, dest: &NodeId, hops: &[NodeId], success: bool) {
        let mut paths = self.paths.write().await;
        if let Some(list) = paths.get_mut(dest) {
            if let Some(path) = list.iter_mut().find(|p| p.hops == hops) {
                path.record_use(success);
            }
        }
    }

    async fn note_direct_path(&self, peer: NodeId) {
        let latency = self
            .peer
            .peer_info(&peer)
            .await
            .and_then(|r| r.latency_ms)
            .unwrap_or(50);
        self.insert_path(RoutingPath {
            destination: peer,
            hops: vec![peer],
            latency_ms: latency,
            reliability: 0.9,
            last_used: Instant::now(),
            use_count: 0,
        })
        .await;
    }

    /// Catalog exchange used while healing a partition: ask a bridge peer
    /// for peers that could reconnect the affected set.
    pub async fn request_healing(
        &self,
        bridge: NodeId,
        affected: Vec<NodeId>,
    ) -> Result<Vec<PeerSummary>> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_peers.write().await.insert(request_id, tx);

        let payload = encode_payload(&DiscoveryPayload::PartitionHealing {
            affected_peers: affected,
            request_id,
        })?;
        if let Err(e) = self.peer.send(bridge, FrameKind::PeerDiscovery, payload).await {
            self.pending_peers.write().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(peers)) => Ok(peers),
            _ => {
                self.pending_peers.write().await.remove(&request_id);
                Err(MeshError::QueryTimeout)
            }
        }
    }

    async fn peer_query<F>(&self, peer: NodeId, build: F) -> Result<Vec<PeerSummary>>
    where
        F: FnOnce(u64) -> DiscoveryPayload,
    {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_peers.write().await.insert(request_id, tx);

        let payload = encode_payload(&build(request_id))?;
        if let Err(e) = self.peer.send(peer, FrameKind::PeerDiscovery, payload).await {
            self.pending_peers.write().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(peers)) => Ok(peers),
            _ => {
                self.pending_peers.write().await.remove(&request_id);
                Err(MeshError::QueryTimeout)
            }
        }
    }

    async fn path_query(&self, via: NodeId, dest: NodeId) -> Result<bool> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_paths.write().await.insert(request_id, tx);

        let payload = encode_payload(&DiscoveryPayload::PathQuery {
            destination: dest,
            request_id,
        })?;
        if let Err(e) = self.peer.send(via, FrameKind::PeerDiscovery, payload).await {
            self.pending_paths.write().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.path_query_timeout, rx).await {
            Ok(Ok(has_path)) => Ok(has_path),
            _ => {
                self.pending_paths.write().await.remove(&request_id);
                Err(MeshError::QueryTimeout)
            }
        }
    }

    /// Handle the discovery subset of `PeerDiscovery` payloads.
    pub async fn handle_payload(&self, from: NodeId, payload: DiscoveryPayload) {
        match payload {
            DiscoveryPayload::NeighborRequest { request_id } => {
                let peers = self.summaries(NEIGHBOR_LIMIT, true).await;
                self.reply(
                    from,
                    DiscoveryPayload::NeighborResponse { request_id, peers },
                )
                .await;
            }
            DiscoveryPayload::NeighborResponse { request_id, peers }
            | DiscoveryPayload::PeerListResponse { request_id, peers }
            | DiscoveryPayload::PartitionHealingResponse { request_id, peers } => {
                if let Some(waiter) = self.pending_peers.write().await.remove(&request_id) {
                    let _ = waiter.send(peers);
                }
            }
            DiscoveryPayload::PeerListRequest { request_id } => {
                let peers = self.summaries(PEER_LIST_LIMIT, false).await;
                self.reply(
                    from,
                    DiscoveryPayload::PeerListResponse { request_id, peers },
                )
                .await;
            }
            DiscoveryPayload::PathQuery {
                destination,
                request_id,
            } => {
                let connected = self
                    .peer
                    .peer_info(&destination)
                    .await
                    .map(|r| r.status == PeerStatus::Connected)
                    .unwrap_or(false);
                let has_path = connected || self.paths.read().await.contains_key(&destination);
                self.reply(
                    from,
                    DiscoveryPayload::PathResponse {
                        request_id,
                        has_path,
                    },
                )
                .await;
            }
            DiscoveryPayload::PathResponse {
                request_id,
                has_path,
            } => {
                if let Some(waiter) = self.pending_paths.write().await.remove(&request_id) {
                    let _ = waiter.send(has_path);
                }
            }
            DiscoveryPayload::Advertisement { advertisement } => {
                self.ingest_advertisement(advertisement).await;
            }
            DiscoveryPayload::PartitionHealing { affected_peers, request_id } => {
                // Serve the connected catalog plus anything known among the
                // affected set, so the requester can bridge back.
                let mut peers = self.summaries(PEER_LIST_LIMIT, true).await;
                for node in affected_peers {
                    if peers.iter().any(|p| p.node_id == node) {
                        continue;
                    }
                    if let Some(record) = self.peer.peer_info(&node).await {
                        if let Some(summary) = Self::summary_of(&record) {
                            peers.push(summary);
                        }
                    }
                }
                self.reply(
                    from,
                    DiscoveryPayload::PartitionHealingResponse { request_id, peers },
                )
                .await;
            }
            // FindNode and SecurityAlert belong to routing and resilience.
            _ => {}
        }
    }

    async fn ingest_advertisement(&self, advertisement: PeerAdvertisement) {
        if advertisement.node_id == self.local_id {
            return;
        }
        // The advertised id must be the hash of the advertised key, and the
        // signature must verify against that key.
        if node_id_for(&advertisement.public_key) != advertisement.node_id {
            warn!(peer = %advertisement.node_id, "advertisement id does not match key");
            return;
        }
        let Ok(signable) = advertisement.signable() else {
            return;
        };
        let valid = advertisement
            .signature
            .as_ref()
            .map(|sig| verify_signature(&advertisement.public_key, &signable, sig))
            .unwrap_or(false);
        if !valid {
            warn!(peer = %advertisement.node_id, "dropping advertisement with bad signature");
            return;
        }

        self.peer
            .register_peer(
                advertisement.node_id,
                Some(advertisement.public_key),
                Some(advertisement.capabilities.clone()),
                None,
            )
            .await;
        self.peer
            .update_capabilities(&advertisement.node_id, advertisement.capabilities.clone())
            .await;
        self.dht
            .add_or_update(DhtNodeInfo {
                node_id: advertisement.node_id,
                capabilities: advertisement.capabilities.clone(),
                reputation: 0.5,
                last_seen_ms: advertisement.timestamp_ms,
            })
            .await;

        let mut ads = self.ads.write().await;
        ads.insert(advertisement.node_id, (advertisement, Instant::now()));
    }

    async fn reply(&self, to: NodeId, payload: DiscoveryPayload) {
        if let Ok(bytes) = encode_payload(&payload) {
            let _ = self.peer.send(to, FrameKind::PeerDiscovery, bytes).await;
        }
    }

    fn summary_of(record: &crate::peer::PeerRecord) -> Option<PeerSummary> {
        let capabilities = record.capabilities.clone()?;
        Some(PeerSummary {
            node_id: record.node_id,
            public_key: record.public_key,
            capabilities,
            reputation: record.reputation,
            latency_ms: record.latency_ms,
            last_seen_ms: record.last_seen_ms,
        })
    }

    async fn summaries(&self, limit: usize, connected_only: bool) -> Vec<PeerSummary> {
        self.peer
            .all_peers()
            .await
            .iter()
            .filter(|r| !connected_only || r.status == PeerStatus::Connected)
            .filter_map(Self::summary_of)
            .take(limit)
            .collect()
    }

    /// Maintenance loops: 30 s discover/advertise/prune/topology, 60 s path
    /// refresh.
    pub fn start(self: &Arc<Self>) {
        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(discovery.discovery_interval);
            loop {
                interval.tick().await;
                if discovery.shutdown.load(Ordering::Relaxed) {
                    break;
                }

                discovery.discover().await;
                if let Err(e) = discovery.advertise_self().await {
                    debug!(error = %e, "advertisement skipped");
                }
                discovery.prune_advertisements().await;
                discovery.recompute_topology().await;
            }
        });

        let discovery = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(discovery.topology_interval);
            loop {
                interval.tick().await;
                if discovery.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                discovery.refresh_paths().await;
            }
        });
    }

    async fn prune_advertisements(&self) {
        let mut ads = self.ads.write().await;
        let before = ads.len();
        ads.retain(|_, (ad, received)| {
            received.elapsed() <= Duration::from_millis(ad.ttl_ms)
        });
        let pruned = before - ads.len();
        if pruned > 0 {
            debug!(pruned, "pruned stale advertisements");
        }
    }

    /// Push fresh capability/latency edges for connected peers into the
    /// routing table.
    async fn recompute_topology(&self) {
        for record in self.peer.all_peers().await {
            if record.status != PeerStatus::Connected {
                continue;
            }
            if let Some(caps) = record.capabilities {
                self.dht
                    .add_or_update(DhtNodeInfo {
                        node_id: record.node_id,
                        capabilities: caps,
                        reputation: record.reputation,
                        last_seen_ms: record.last_seen_ms,
                    })
                    .await;
            }
        }
    }

    /// Refresh direct-path entries and drop paths whose first hop is gone.
    async fn refresh_paths(&self) {
        let connected = self.peer.connected_peers().await;
        for peer in &connected {
            self.note_direct_path(*peer).await;
        }

        let mut paths = self.paths.write().await;
        for list in paths.values_mut() {
            list.retain(|path| match path.hops.first() {
                Some(first) => connected.contains(first),
                None => false,
            });
        }
        paths.retain(|_, list| !list.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_score_formula() {
        let path = RoutingPath {
            destination: NodeId::random(),
            hops: vec![NodeId::random()],
            latency_ms: 40,
            reliability: 0.9,
            last_used: Instant::now(),
            use_count: 10,
        };
        // 0.4*0.6 + 0.4*0.9 + 0.1*~1.0 + 0.1*0.1
        let score = path.score();
        assert!((score - 0.71).abs() < 0.01, "score was {score}");
    }

    #[test]
    fn test_usage_bonus_capped() {
        let path = RoutingPath {
            destination: NodeId::random(),
            hops: vec![NodeId::random()],
            latency_ms: 200,
            reliability: 0.0,
            last_used: Instant::now(),
            use_count: 1_000,
        };
        // Latency and reliability contribute nothing; freshness ≈ 1 and the
        // usage bonus saturates at 0.2, so the score lands near 0.12.
        let score = path.score();
        assert!((score - 0.12).abs() < 0.01, "score was {score}");
    }

    #[test]
    fn test_reliability_ewma() {
        let mut path = RoutingPath {
            destination: NodeId::random(),
            hops: vec![NodeId::random()],
            latency_ms: 10,
            reliability: 0.7,
            last_used: Instant::now(),
            use_count: 0,
        };
        path.record_use(true);
        assert!((path.reliability - 0.79).abs() < 1e-9);
        path.record_use(false);
        assert!((path.reliability - 0.553).abs() < 1e-9);
        assert_eq!(path.use_count, 2);
    }

    #[test]
    fn test_method_health() {
        let mut stats = MethodStats::default();
        assert_eq!(stats.health(), 1.0);
        stats.attempts = 4;
        stats.successes = 3;
        stats.failures = 1;
        assert!((stats.health() - 0.75).abs() < 1e-9);
    }
}
