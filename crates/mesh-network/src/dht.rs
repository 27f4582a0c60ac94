//! Kademlia-style routing over the 160-bit id space.
//!
//! The table holds 160 k-buckets of up to k=20 nodes ordered least- to
//! most-recently seen. A full bucket pings its LRU entry before admitting a
//! newcomer; lookups are iterative with α=3 concurrent queries per round.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use mesh_types::{
    frame::encode_payload, DhtNodeInfo, Distance, DiscoveryPayload, FrameKind, MeshError, NodeId,
    Result,
};

use crate::config::MeshConfig;
use crate::peer::PeerManager;

pub const K: usize = 20;
pub const ALPHA: usize = 3;
const BUCKETS: usize = 160;
const NODE_STALE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct DhtNode {
    info: DhtNodeInfo,
    last_seen: Instant,
}

/// Outcome of a table insert attempt.
enum UpsertOutcome {
    Inserted,
    Updated,
    /// Bucket is full; `lru` must prove liveness or give up its slot.
    BucketFull { lru: NodeId },
    /// The local id or a zero-distance entry; ignored.
    Rejected,
}

/// The k-bucket table. Plain synchronous state behind the service lock.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Vec<DhtNode>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: (0..BUCKETS).map(|_| Vec::new()).collect(),
        }
    }

    fn bucket_for(&self, id: &NodeId) -> Option<usize> {
        NodeId::bucket_index(&self.local_id.xor_distance(id))
    }

    fn upsert(&mut self, info: DhtNodeInfo) -> UpsertOutcome {
        let Some(index) = self.bucket_for(&info.node_id) else {
            return UpsertOutcome::Rejected;
        };
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.iter().position(|n| n.info.node_id == info.node_id) {
            let mut node = bucket.remove(pos);
            node.info = info;
            node.last_seen = Instant::now();
            bucket.push(node);
            return UpsertOutcome::Updated;
        }

        if bucket.len() >= K {
            return UpsertOutcome::BucketFull {
                lru: bucket[0].info.node_id,
            };
        }

        bucket.push(DhtNode {
            info,
            last_seen: Instant::now(),
        });
        UpsertOutcome::Inserted
    }

    /// Move a node to the most-recently-seen end of its bucket.
    fn touch(&mut self, id: &NodeId) {
        if let Some(index) = self.bucket_for(id) {
            let bucket = &mut self.buckets[index];
            if let Some(pos) = bucket.iter().position(|n| n.info.node_id == *id) {
                let mut node = bucket.remove(pos);
                node.last_seen = Instant::now();
                bucket.push(node);
            }
        }
    }

    fn replace(&mut self, evicted: &NodeId, info: DhtNodeInfo) {
        if let Some(index) = self.bucket_for(evicted) {
            let bucket = &mut self.buckets[index];
            bucket.retain(|n| n.info.node_id != *evicted);
        }
        // Distinct ids can map to the same bucket only; re-derive for the
        // newcomer rather than assuming.
        if let Some(index) = self.bucket_for(&info.node_id) {
            let bucket = &mut self.buckets[index];
            if bucket.len() < K {
                bucket.push(DhtNode {
                    info,
                    last_seen: Instant::now(),
                });
            }
        }
    }

    pub fn remove(&mut self, id: &NodeId) {
        if let Some(index) = self.bucket_for(id) {
            self.buckets[index].retain(|n| n.info.node_id != *id);
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.bucket_for(id)
            .map(|i| self.buckets[i].iter().any(|n| n.info.node_id == *id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `n` nodes sorted by XOR distance to `target`.
    pub fn closest(&self, target: &NodeId, n: usize) -> Vec<DhtNodeInfo> {
        let mut nodes: Vec<(Distance, DhtNodeInfo)> = self
            .buckets
            .iter()
            .flatten()
            .map(|node| (target.xor_distance(&node.info.node_id), node.info.clone()))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes.into_iter().take(n).map(|(_, info)| info).collect()
    }

    /// Indices of buckets holding at least one node not seen for `max_age`.
    fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        let now = Instant::now();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| {
                bucket
                    .iter()
                    .any(|n| now.duration_since(n.last_seen) > max_age)
            })
            .map(|(i, _)| i)
            .collect()
    }
}

/// The routing service: table maintenance, FIND_NODE serving and iterative
/// lookups.
pub struct DhtService {
    local_id: NodeId,
    table: Arc<RwLock<RoutingTable>>,
    peer: Arc<PeerManager>,
    pending: Arc<RwLock<HashMap<u64, oneshot::Sender<Vec<DhtNodeInfo>>>>>,
    next_request_id: AtomicU64,
    query_timeout: Duration,
    refresh_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl DhtService {
    pub fn new(peer: Arc<PeerManager>, config: &MeshConfig, shutdown: Arc<AtomicBool>) -> Arc<Self> {
        let local_id = peer.local_id();
        Arc::new(Self {
            local_id,
            table: Arc::new(RwLock::new(RoutingTable::new(local_id))),
            peer,
            pending: Arc::new(RwLock::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            query_timeout: config.query_timeout,
            refresh_interval: config.bucket_refresh_interval,
            shutdown,
        })
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn contains(&self, id: &NodeId) -> bool {
        self.table.read().await.contains(id)
    }

    pub async fn closest(&self, target: &NodeId, n: usize) -> Vec<DhtNodeInfo> {
        self.table.read().await.closest(target, n)
    }

    pub async fn remove_peer(&self, id: &NodeId) {
        self.table.write().await.remove(id);
    }

    /// Insert or refresh a node. When the target bucket is full the LRU
    /// entry is pinged; it keeps its slot iff it answers within the query
    /// deadline.
    pub async fn add_or_update(&self, info: DhtNodeInfo) {
        if info.node_id == self.local_id {
            return;
        }
        let outcome = self.table.write().await.upsert(info.clone());
        match outcome {
            UpsertOutcome::Inserted => {
                debug!(node = %info.node_id, "routing table node added");
            }
            UpsertOutcome::Updated | UpsertOutcome::Rejected => {}
            UpsertOutcome::BucketFull { lru } => {
                match self.peer.ping(lru, self.query_timeout).await {
                    Ok(_) => {
                        // Alive: LRU keeps its slot, newcomer is dropped.
                        self.table.write().await.touch(&lru);
                    }
                    Err(_) => {
                        info!(evicted = %lru, admitted = %info.node_id, "bucket LRU unreachable, replaced");
                        self.table.write().await.replace(&lru, info);
                    }
                }
            }
        }
    }

    /// Iterative Kademlia lookup toward `target`.
    pub async fn lookup(self: &Arc<Self>, target: NodeId) -> Vec<DhtNodeInfo> {
        let mut candidates: HashMap<NodeId, DhtNodeInfo> = HashMap::new();
        let mut queried: HashSet<NodeId> = HashSet::new();

        for info in self.closest(&target, ALPHA).await {
            candidates.insert(info.node_id, info);
        }

        loop {
            if candidates.len() >= K {
                break;
            }
            let mut frontier: Vec<DhtNodeInfo> = candidates
                .values()
                .filter(|info| !queried.contains(&info.node_id))
                .cloned()
                .collect();
            if frontier.is_empty() {
                break;
            }
            frontier.sort_by(|a, b| {
                target
                    .xor_distance(&a.node_id)
                    .cmp(&target.xor_distance(&b.node_id))
            });
            frontier.truncate(ALPHA);

            let mut queries = JoinSet::new();
            for info in frontier {
                queried.insert(info.node_id);
                let service = Arc::clone(self);
                queries.spawn(async move { service.find_node_query(info.node_id, target).await });
            }

            while let Some(joined) = queries.join_next().await {
                let Ok(Ok(nodes)) = joined else {
                    // A failed or timed-out query never fails the lookup.
                    continue;
                };
                for info in nodes {
                    if info.node_id == self.local_id {
                        continue;
                    }
                    candidates.entry(info.node_id).or_insert(info);
                }
            }
        }

        let mut result: Vec<DhtNodeInfo> = candidates.into_values().collect();
        result.sort_by(|a, b| {
            target
                .xor_distance(&a.node_id)
                .cmp(&target.xor_distance(&b.node_id))
        });
        result.truncate(K);
        result
    }

    /// One FIND_NODE round trip with the per-query deadline.
    async fn find_node_query(&self, peer: NodeId, target: NodeId) -> Result<Vec<DhtNodeInfo>> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(request_id, tx);

        let payload = encode_payload(&DiscoveryPayload::FindNode { target, request_id })?;
        if let Err(e) = self.peer.send(peer, FrameKind::PeerDiscovery, payload).await {
            self.pending.write().await.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(nodes)) => {
                // A responding node is live routing state.
                self.table.write().await.touch(&peer);
                Ok(nodes)
            }
            _ => {
                self.pending.write().await.remove(&request_id);
                warn!(peer = %peer, "FIND_NODE query timed out");
                Err(MeshError::QueryTimeout)
            }
        }
    }

    /// Handle the routing subset of discovery payloads.
    pub async fn handle_payload(&self, from: NodeId, payload: DiscoveryPayload) {
        match payload {
            DiscoveryPayload::FindNode { target, request_id } => {
                let nodes = self.closest(&target, K).await;
                let response = DiscoveryPayload::FindNodeResp { request_id, nodes };
                if let Ok(bytes) = encode_payload(&response) {
                    let _ = self.peer.send(from, FrameKind::PeerDiscovery, bytes).await;
                }
            }
            DiscoveryPayload::FindNodeResp { request_id, nodes } => {
                if let Some(waiter) = self.pending.write().await.remove(&request_id) {
                    let _ = waiter.send(nodes);
                }
            }
            _ => {}
        }
    }

    /// Bucket refresh loop: any bucket holding a node older than five
    /// minutes gets a lookup aimed inside its address range.
    pub fn start(self: &Arc<Self>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.refresh_interval);
            loop {
                interval.tick().await;
                if service.shutdown.load(Ordering::Relaxed) {
                    break;
                }

                let stale = service.table.read().await.stale_buckets(NODE_STALE);
                for index in stale {
                    let target = NodeId::random_in_bucket(&service.local_id, index);
                    debug!(bucket = index, "refreshing stale bucket");
                    let _ = service.lookup(target).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{CapabilitySnapshot, ComputeTier, ThermalState};

    fn caps() -> CapabilitySnapshot {
        CapabilitySnapshot {
            tier: ComputeTier::Medium,
            cpu_cores: 4,
            ram_gb: 8,
            storage_gb: 64,
            gpu_available: false,
            bandwidth_mbps: 25.0,
            battery_pct: None,
            thermal: ThermalState::Nominal,
        }
    }

    fn info(id: NodeId) -> DhtNodeInfo {
        DhtNodeInfo {
            node_id: id,
            capabilities: caps(),
            reputation: 0.5,
            last_seen_ms: 0,
        }
    }

    fn id_with_low_byte(b: u8) -> NodeId {
        let mut arr = [0u8; 20];
        arr[19] = b;
        NodeId::from_bytes(arr)
    }

    #[test]
    fn test_local_id_never_inserted() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local);
        assert!(matches!(table.upsert(info(local)), UpsertOutcome::Rejected));
        assert!(table.is_empty());
    }

    #[test]
    fn test_node_in_exactly_one_bucket() {
        let local = id_with_low_byte(0);
        let mut table = RoutingTable::new(local);

        for b in 1..=30u8 {
            table.upsert(info(id_with_low_byte(b)));
        }
        assert_eq!(table.len(), 30);

        // Re-inserting moves, never duplicates.
        table.upsert(info(id_with_low_byte(7)));
        assert_eq!(table.len(), 30);

        for b in 1..=30u8 {
            let id = id_with_low_byte(b);
            let expected =
                NodeId::bucket_index(&local.xor_distance(&id)).unwrap();
            let found: Vec<usize> = table
                .buckets
                .iter()
                .enumerate()
                .filter(|(_, bucket)| bucket.iter().any(|n| n.info.node_id == id))
                .map(|(i, _)| i)
                .collect();
            assert_eq!(found, vec![expected]);
        }
    }

    #[test]
    fn test_bucket_full_reports_lru() {
        let local = id_with_low_byte(0);
        let mut table = RoutingTable::new(local);

        // Bucket 7 covers distances 128..=255.
        let mut inserted = Vec::new();
        for b in 128..(128 + K as u16) {
            let id = id_with_low_byte(b as u8);
            assert!(matches!(table.upsert(info(id)), UpsertOutcome::Inserted));
            inserted.push(id);
        }

        let newcomer = id_with_low_byte((128 + K as u16) as u8);
        match table.upsert(info(newcomer)) {
            UpsertOutcome::BucketFull { lru } => assert_eq!(lru, inserted[0]),
            _ => panic!("expected full bucket"),
        }

        // Touching the LRU moves it to the tail; the next full insert
        // reports the new head.
        table.touch(&inserted[0]);
        match table.upsert(info(newcomer)) {
            UpsertOutcome::BucketFull { lru } => assert_eq!(lru, inserted[1]),
            _ => panic!("expected full bucket"),
        }

        // Eviction admits the newcomer in the LRU's place.
        table.replace(&inserted[1], info(newcomer));
        assert!(table.contains(&newcomer));
        assert!(!table.contains(&inserted[1]));
    }

    #[test]
    fn test_closest_sorted_by_distance() {
        let local = id_with_low_byte(0);
        let mut table = RoutingTable::new(local);
        for b in [200u8, 3, 90, 17, 255, 44] {
            table.upsert(info(id_with_low_byte(b)));
        }

        let target = id_with_low_byte(16);
        let closest = table.closest(&target, 3);
        assert_eq!(closest.len(), 3);
        for pair in closest.windows(2) {
            assert!(
                target.xor_distance(&pair[0].node_id) <= target.xor_distance(&pair[1].node_id)
            );
        }
        // 17 ^ 16 = 1 is the minimum.
        assert_eq!(closest[0].node_id, id_with_low_byte(17));
    }

    #[test]
    fn test_stale_buckets() {
        let local = id_with_low_byte(0);
        let mut table = RoutingTable::new(local);
        table.upsert(info(id_with_low_byte(1)));
        assert!(table.stale_buckets(Duration::from_secs(300)).is_empty());
        assert_eq!(table.stale_buckets(Duration::from_nanos(0)), vec![0]);
    }
}
