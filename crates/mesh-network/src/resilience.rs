//! Network resilience: health, partitions, circuit breakers, security.
//!
//! The health composite is sampled every 10 s. A connected/known ratio
//! strictly below 0.3 is a partition; healing runs up to three cycles of
//! direct reconnects, bridge catalog exchange and forced discovery. The
//! security monitor quarantines misbehaving peers and guards downstream
//! services with per-key circuit breakers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use mesh_types::{
    frame::encode_payload, AlertSeverity, DiscoveryPayload, FrameKind, MeshError, NodeId, Result,
};

use crate::config::MeshConfig;
use crate::dht::DhtService;
use crate::discovery::PeerDiscovery;
use crate::events::{EventBus, MeshEvent};
use crate::now_ms;
use crate::peer::{PeerManager, PeerStatus};
use crate::verification::TaskVerification;

const PARTITION_RATIO: f64 = 0.3;
const PARTITION_HEAL_FRACTION: f64 = 0.8;
const MAX_HEALING_ATTEMPTS: u32 = 3;
const MAX_RECOVERY_ATTEMPTS: u32 = 3;
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_HISTORY: usize = 100;
const SPAM_FRAMES_PER_SEC: usize = 50;
const CRITICAL_EVENT_WINDOW: Duration = Duration::from_secs(60);
const REPLACEMENT_CORE_SLACK: u32 = 2;
const REPLACEMENT_RAM_SLACK: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    Network,
    Dht,
    Verification,
    Discovery,
}

impl ServiceKey {
    fn name(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Dht => "dht",
            Self::Verification => "verification",
            Self::Discovery => "discovery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: 0,
            last_failure: None,
            opened_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
    Detected,
    Healing,
    Healed,
    Permanent,
}

#[derive(Debug, Clone)]
pub struct NetworkPartition {
    pub id: u64,
    pub detected_at_ms: i64,
    pub affected: Vec<NodeId>,
    pub bridges: Vec<NodeId>,
    pub healing_attempts: u32,
    pub status: PartitionStatus,
}

#[derive(Debug, Clone)]
pub struct HealthSample {
    pub connectivity: f64,
    pub latency: f64,
    pub throughput: f64,
    pub reliability: f64,
    pub security: f64,
    pub overall: f64,
    pub timestamp_ms: i64,
}

pub struct NetworkResilience {
    peer: Arc<PeerManager>,
    dht: Arc<DhtService>,
    discovery: Arc<PeerDiscovery>,
    verification: Arc<TaskVerification>,
    trusted: HashSet<NodeId>,
    blacklist: Arc<RwLock<HashSet<NodeId>>>,
    partitions: Arc<RwLock<HashMap<u64, NetworkPartition>>>,
    next_partition_id: AtomicU64,
    breakers: Arc<RwLock<HashMap<ServiceKey, CircuitBreaker>>>,
    health_history: Arc<RwLock<VecDeque<HealthSample>>>,
    critical_events: Arc<RwLock<VecDeque<Instant>>>,
    seen_invalid_signatures: Arc<RwLock<HashMap<NodeId, u64>>>,
    recovering: Arc<RwLock<HashSet<NodeId>>>,
    health_interval: Duration,
    security_interval: Duration,
    recovery_interval: Duration,
    recovery_backoff: Duration,
    events: EventBus,
    shutdown: Arc<AtomicBool>,
}

impl NetworkResilience {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        peer: Arc<PeerManager>,
        dht: Arc<DhtService>,
        discovery: Arc<PeerDiscovery>,
        verification: Arc<TaskVerification>,
        config: &MeshConfig,
        events: EventBus,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            dht,
            discovery,
            verification,
            trusted: config.trusted_peers.iter().copied().collect(),
            blacklist: Arc::new(RwLock::new(HashSet::new())),
            partitions: Arc::new(RwLock::new(HashMap::new())),
            next_partition_id: AtomicU64::new(1),
            breakers: Arc::new(RwLock::new(HashMap::new())),
            health_history: Arc::new(RwLock::new(VecDeque::new())),
            critical_events: Arc::new(RwLock::new(VecDeque::new())),
            seen_invalid_signatures: Arc::new(RwLock::new(HashMap::new())),
            recovering: Arc::new(RwLock::new(HashSet::new())),
            health_interval: config.health_interval,
            security_interval: config.security_interval,
            recovery_interval: config.recovery_interval,
            recovery_backoff: config.recovery_backoff,
            events,
            shutdown,
        })
    }

    pub async fn is_blacklisted(&self, peer: &NodeId) -> bool {
        self.blacklist.read().await.contains(peer)
    }

    pub async fn latest_health(&self) -> Option<HealthSample> {
        self.health_history.read().await.back().cloned()
    }

    pub async fn partitions(&self) -> Vec<NetworkPartition> {
        self.partitions.read().await.values().cloned().collect()
    }

    // ── Circuit breakers ────────────────────────────────────────────────

    /// Gate a call to a downstream service. Open breakers fail fast;
    /// a breaker past its timeout moves to half-open and lets one call
    /// through.
    pub async fn guard(&self, service: ServiceKey) -> Result<()> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(service).or_insert_with(CircuitBreaker::new);
        match breaker.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let expired = breaker
                    .opened_at
                    .map(|t| t.elapsed() > BREAKER_TIMEOUT)
                    .unwrap_or(true);
                if expired {
                    breaker.state = BreakerState::HalfOpen;
                    info!(service = service.name(), "circuit breaker half-open");
                    Ok(())
                } else {
                    Err(MeshError::CircuitBreakerOpen(service.name()))
                }
            }
        }
    }

    pub async fn record_success(&self, service: ServiceKey) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(service).or_insert_with(CircuitBreaker::new);
        breaker.failures = 0;
        if breaker.state == BreakerState::HalfOpen {
            breaker.state = BreakerState::Closed;
            breaker.opened_at = None;
            info!(service = service.name(), "circuit breaker closed");
        }
    }

    pub async fn record_failure(&self, service: ServiceKey) {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.entry(service).or_insert_with(CircuitBreaker::new);
        breaker.failures += 1;
        breaker.last_failure = Some(Instant::now());

        let crossed = breaker.failures >= BREAKER_THRESHOLD;
        match breaker.state {
            BreakerState::Closed if crossed => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
                warn!(service = service.name(), "⚡ Circuit breaker opened");
            }
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
                warn!(service = service.name(), "circuit breaker re-opened");
            }
            _ => {}
        }
    }

    pub async fn breaker_state(&self, service: ServiceKey) -> BreakerState {
        self.breakers
            .read()
            .await
            .get(&service)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    // ── Health and partitions ───────────────────────────────────────────

    /// Compute one composite health sample and append it to the history.
    pub async fn sample_health(&self) -> HealthSample {
        let records = self.peer.all_peers().await;
        let known = records.len();
        let connected = records
            .iter()
            .filter(|r| r.status == PeerStatus::Connected)
            .count();

        let connectivity = connected as f64 / known.max(1) as f64;

        let latencies: Vec<u64> = records.iter().filter_map(|r| r.latency_ms).collect();
        let latency = if latencies.is_empty() {
            1.0
        } else {
            let avg = latencies.iter().sum::<u64>() as f64 / latencies.len() as f64;
            (1.0 - avg / 1000.0).max(0.0)
        };

        let throughput = (connected as f64 / 10.0).min(1.0);
        let reliability = self.verification.approval_rate().await;

        let recent_critical = {
            let mut events = self.critical_events.write().await;
            let now = Instant::now();
            while let Some(front) = events.front() {
                if now.duration_since(*front) > CRITICAL_EVENT_WINDOW {
                    events.pop_front();
                } else {
                    break;
                }
            }
            events.len()
        };
        let security = (1.0 - 0.2 * recent_critical as f64).max(0.0);

        let overall = 0.25 * connectivity
            + 0.2 * latency
            + 0.2 * throughput
            + 0.25 * reliability
            + 0.1 * security;

        let sample = HealthSample {
            connectivity,
            latency,
            throughput,
            reliability,
            security,
            overall,
            timestamp_ms: now_ms(),
        };

        let mut history = self.health_history.write().await;
        history.push_back(sample.clone());
        while history.len() > HEALTH_HISTORY {
            history.pop_front();
        }
        drop(history);

        self.events.emit(MeshEvent::HealthUpdated { overall });
        sample
    }

    /// Partition check: strictly below the 0.3 ratio with no partition
    /// already being worked emits a new `Detected` partition.
    pub async fn check_partition(&self) -> Option<u64> {
        let records = self.peer.all_peers().await;
        let known = records.len();
        if known == 0 {
            return None;
        }
        let connected: Vec<NodeId> = records
            .iter()
            .filter(|r| r.status == PeerStatus::Connected)
            .map(|r| r.node_id)
            .collect();
        let ratio = connected.len() as f64 / known.max(1) as f64;
        if ratio >= PARTITION_RATIO {
            return None;
        }

        let mut partitions = self.partitions.write().await;
        let active = partitions
            .values()
            .any(|p| matches!(p.status, PartitionStatus::Detected | PartitionStatus::Healing));
        if active {
            return None;
        }

        let affected: Vec<NodeId> = records
            .iter()
            .filter(|r| r.status != PeerStatus::Connected)
            .map(|r| r.node_id)
            .collect();
        let id = self.next_partition_id.fetch_add(1, Ordering::Relaxed);
        partitions.insert(
            id,
            NetworkPartition {
                id,
                detected_at_ms: now_ms(),
                affected: affected.clone(),
                bridges: connected,
                healing_attempts: 0,
                status: PartitionStatus::Detected,
            },
        );
        drop(partitions);

        warn!(
            partition_id = id,
            affected = affected.len(),
            ratio = ratio,
            "🔀 Network partition detected"
        );
        self.events
            .emit(MeshEvent::PartitionDetected { partition_id: id, affected });
        Some(id)
    }

    /// One healing cycle over every partition still being worked.
    pub async fn heal_partitions(&self) {
        let targets: Vec<NetworkPartition> = {
            let partitions = self.partitions.read().await;
            partitions
                .values()
                .filter(|p| {
                    matches!(p.status, PartitionStatus::Detected | PartitionStatus::Healing)
                })
                .cloned()
                .collect()
        };

        for partition in targets {
            self.heal_one(partition).await;
        }
    }

    async fn heal_one(&self, partition: NetworkPartition) {
        {
            let mut partitions = self.partitions.write().await;
            if let Some(p) = partitions.get_mut(&partition.id) {
                p.status = PartitionStatus::Healing;
                p.healing_attempts += 1;
            }
        }

        // Strategy 1: direct reconnects.
        for peer in &partition.affected {
            if self.is_blacklisted(peer).await {
                continue;
            }
            let _ = self.peer.connect(*peer).await;
        }

        // Strategy 2: catalog exchange through still-connected bridges.
        for bridge in &partition.bridges {
            match self
                .discovery
                .request_healing(*bridge, partition.affected.clone())
                .await
            {
                Ok(peers) => {
                    for summary in peers {
                        self.peer
                            .register_peer(
                                summary.node_id,
                                summary.public_key,
                                Some(summary.capabilities),
                                Some(summary.reputation),
                            )
                            .await;
                        if partition.affected.contains(&summary.node_id) {
                            let _ = self.peer.connect(summary.node_id).await;
                        }
                    }
                }
                Err(_) => continue,
            }
        }

        // Strategy 3: force a discovery round.
        self.discovery.discover().await;

        // Evaluate.
        let reconnected = {
            let mut count = 0usize;
            for peer in &partition.affected {
                let connected = self
                    .peer
                    .peer_info(peer)
                    .await
                    .map(|r| r.status == PeerStatus::Connected)
                    .unwrap_or(false);
                if connected {
                    count += 1;
                }
            }
            count
        };
        let fraction = reconnected as f64 / partition.affected.len().max(1) as f64;

        let mut partitions = self.partitions.write().await;
        let Some(p) = partitions.get_mut(&partition.id) else {
            return;
        };
        if fraction >= PARTITION_HEAL_FRACTION {
            p.status = PartitionStatus::Healed;
            info!(partition_id = p.id, reconnected, "🩹 Partition healed");
            self.events
                .emit(MeshEvent::PartitionHealed { partition_id: p.id });
        } else if p.healing_attempts >= MAX_HEALING_ATTEMPTS {
            p.status = PartitionStatus::Permanent;
            warn!(partition_id = p.id, "partition marked permanent");
        }
    }

    // ── Security monitoring ─────────────────────────────────────────────

    /// One pass of the 5 s security monitor.
    pub async fn run_security_scan(&self) {
        // Malicious peers by verification track record.
        for score in self.verification.reputation_snapshot().await {
            let malicious = (score.score < 0.2 && score.total >= 5)
                || (score.error_rate() > 0.5 && score.total >= 10);
            if malicious {
                self.quarantine(score.peer, AlertSeverity::High, "verification record")
                    .await;
            }
        }

        // Spam: over the frame-rate budget opens the network breaker.
        for (peer, rate) in self.peer.frame_rates().await {
            if rate > SPAM_FRAMES_PER_SEC {
                warn!(peer = %peer, rate, "frame rate over budget");
                self.note_critical_event().await;
                self.record_failure(ServiceKey::Network).await;
                self.quarantine(peer, AlertSeverity::Critical, "frame flood")
                    .await;
            }
        }

        // Invalid signatures observed since the last scan count against
        // reputation.
        let mut seen = self.seen_invalid_signatures.write().await;
        for record in self.peer.all_peers().await {
            let prior = seen.get(&record.node_id).copied().unwrap_or(0);
            let current = record.stats.invalid_signatures;
            if current > prior {
                seen.insert(record.node_id, current);
                self.note_critical_event().await;
                self.verification
                    .penalize_invalid_signature(record.node_id)
                    .await;
            }
        }
    }

    /// Blacklist, disconnect, and alert trusted peers. Trusted peers are
    /// exempt from reputation-driven quarantine.
    pub async fn quarantine(&self, peer: NodeId, severity: AlertSeverity, reason: &str) {
        if self.trusted.contains(&peer) {
            debug!(peer = %peer, reason, "trusted peer exempt from quarantine");
            return;
        }
        if !self.blacklist.write().await.insert(peer) {
            return;
        }

        warn!(peer = %peer, severity = ?severity, reason, "🚨 Quarantining peer");
        self.note_critical_event().await;
        self.peer.disconnect(&peer).await;
        self.dht.remove_peer(&peer).await;

        let alert = DiscoveryPayload::SecurityAlert {
            malicious_peer: peer,
            severity,
            timestamp_ms: now_ms(),
        };
        if let Ok(payload) = encode_payload(&alert) {
            for trusted in &self.trusted {
                let _ = self
                    .peer
                    .send(*trusted, FrameKind::PeerDiscovery, payload.clone())
                    .await;
            }
        }
    }

    /// Inbound security alert from another node.
    pub async fn handle_alert(&self, from: NodeId, malicious_peer: NodeId, severity: AlertSeverity) {
        self.events.emit(MeshEvent::SecurityAlertReceived {
            malicious_peer,
            severity,
        });
        // Only alerts from our own trusted set carry enough weight to act
        // on directly.
        if self.trusted.contains(&from) && !self.trusted.contains(&malicious_peer) {
            self.blacklist.write().await.insert(malicious_peer);
            self.peer.disconnect(&malicious_peer).await;
            self.dht.remove_peer(&malicious_peer).await;
        }
    }

    async fn note_critical_event(&self) {
        self.critical_events.write().await.push_back(Instant::now());
    }

    // ── Recovery ────────────────────────────────────────────────────────

    /// Reconnect a lost peer with 1 s / 2 s / 4 s backoff; after three
    /// failures, connect a replacement with similar capabilities.
    pub async fn recover_peer(self: &Arc<Self>, peer: NodeId) {
        if self.is_blacklisted(&peer).await {
            return;
        }
        {
            let mut recovering = self.recovering.write().await;
            if !recovering.insert(peer) {
                return;
            }
        }

        let resilience = Arc::clone(self);
        tokio::spawn(async move {
            let mut recovered = false;
            for attempt in 0..MAX_RECOVERY_ATTEMPTS {
                tokio::time::sleep(resilience.recovery_backoff * 2u32.pow(attempt)).await;
                if resilience.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if resilience.peer.connect(peer).await.is_ok() {
                    info!(peer = %peer, attempt = attempt + 1, "peer recovered");
                    recovered = true;
                    break;
                }
            }

            if !recovered && !resilience.shutdown.load(Ordering::Relaxed) {
                resilience.connect_replacement(peer).await;
            }
            resilience.recovering.write().await.remove(&peer);
        });
    }

    /// Find a known, unconnected peer within ±2 cores / ±4 GB ram and the
    /// same gpu flag as the lost peer, and connect it.
    async fn connect_replacement(&self, lost: NodeId) {
        let Some(lost_caps) = self
            .peer
            .peer_info(&lost)
            .await
            .and_then(|r| r.capabilities)
        else {
            return;
        };

        for record in self.peer.all_peers().await {
            if record.node_id == lost
                || record.status == PeerStatus::Connected
                || self.is_blacklisted(&record.node_id).await
            {
                continue;
            }
            let Some(caps) = &record.capabilities else {
                continue;
            };
            let similar = caps.cpu_cores.abs_diff(lost_caps.cpu_cores) <= REPLACEMENT_CORE_SLACK
                && caps.ram_gb.abs_diff(lost_caps.ram_gb) <= REPLACEMENT_RAM_SLACK
                && caps.gpu_available == lost_caps.gpu_available;
            if !similar {
                continue;
            }
            if self.peer.connect(record.node_id).await.is_ok() {
                info!(lost = %lost, replacement = %record.node_id, "replacement peer connected");
                return;
            }
        }
        debug!(lost = %lost, "no replacement peer found");
    }

    /// Clear breakers and partition state and force a discovery round.
    pub async fn reset_network(&self) {
        self.breakers.write().await.clear();
        self.partitions.write().await.clear();
        self.discovery.discover().await;
        self.events.emit(MeshEvent::NetworkReset);
        info!("network state reset");
    }

    /// Health, security and recovery loops.
    pub fn start(self: &Arc<Self>) {
        let resilience = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(resilience.health_interval);
            loop {
                interval.tick().await;
                if resilience.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                resilience.sample_health().await;
                resilience.check_partition().await;
            }
        });

        let resilience = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(resilience.security_interval);
            loop {
                interval.tick().await;
                if resilience.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                resilience.run_security_scan().await;
            }
        });

        let resilience = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(resilience.recovery_interval);
            loop {
                interval.tick().await;
                if resilience.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                resilience.heal_partitions().await;
            }
        });

        // Disconnect events feed the per-peer recovery ladder.
        let resilience = Arc::clone(self);
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if resilience.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                if let MeshEvent::PeerDisconnected { peer } = event {
                    resilience.recover_peer(peer).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::StaticTelemetry;
    use crate::transport::MemoryHub;
    use mesh_crypto::MeshKeypair;
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

    struct Fixture {
        resilience: Arc<NetworkResilience>,
        peer: Arc<PeerManager>,
        hub: Arc<MemoryHub>,
    }

    async fn fixture() -> Fixture {
        let hub = MemoryHub::new();
        let config = MeshConfig::default();
        let shutdown = Arc::new(AtomicBool::new(false));
        let events = EventBus::new();

        let keypair = Arc::new(MeshKeypair::generate());
        let transport = Arc::new(hub.attach(keypair.node_id()).await);
        let peer = PeerManager::new(
            Arc::clone(&keypair),
            transport,
            Arc::new(StaticTelemetry::new(caps())),
            &config,
            events.clone(),
            Arc::clone(&shutdown),
        );
        peer.start();
        let dht = DhtService::new(Arc::clone(&peer), &config, Arc::clone(&shutdown));
        let discovery = PeerDiscovery::new(
            Arc::clone(&keypair),
            Arc::clone(&peer),
            Arc::clone(&dht),
            &config,
            events.clone(),
            Arc::clone(&shutdown),
        );
        let verification = TaskVerification::new(
            Arc::clone(&keypair),
            Arc::clone(&peer),
            &config,
            events.clone(),
            Arc::clone(&shutdown),
        );
        let resilience = NetworkResilience::new(
            Arc::clone(&peer),
            dht,
            discovery,
            verification,
            &config,
            events,
            shutdown,
        );
        Fixture {
            resilience,
            peer,
            hub,
        }
    }

    #[tokio::test]
    async fn test_breaker_opens_exactly_at_threshold() {
        let fx = fixture().await;
        let r = &fx.resilience;

        for _ in 0..4 {
            r.record_failure(ServiceKey::Dht).await;
            assert_eq!(r.breaker_state(ServiceKey::Dht).await, BreakerState::Closed);
            assert!(r.guard(ServiceKey::Dht).await.is_ok());
        }

        r.record_failure(ServiceKey::Dht).await;
        assert_eq!(r.breaker_state(ServiceKey::Dht).await, BreakerState::Open);
        assert!(matches!(
            r.guard(ServiceKey::Dht).await,
            Err(MeshError::CircuitBreakerOpen("dht"))
        ));
    }

    #[tokio::test]
    async fn test_breaker_half_open_transitions() {
        let fx = fixture().await;
        let r = &fx.resilience;

        for _ in 0..BREAKER_THRESHOLD {
            r.record_failure(ServiceKey::Verification).await;
        }
        assert_eq!(
            r.breaker_state(ServiceKey::Verification).await,
            BreakerState::Open
        );

        // Force the timeout to look expired.
        {
            let mut breakers = r.breakers.write().await;
            let breaker = breakers.get_mut(&ServiceKey::Verification).unwrap();
            breaker.opened_at = Some(Instant::now() - BREAKER_TIMEOUT - Duration::from_secs(1));
        }
        assert!(r.guard(ServiceKey::Verification).await.is_ok());
        assert_eq!(
            r.breaker_state(ServiceKey::Verification).await,
            BreakerState::HalfOpen
        );

        // One success closes it.
        r.record_success(ServiceKey::Verification).await;
        assert_eq!(
            r.breaker_state(ServiceKey::Verification).await,
            BreakerState::Closed
        );

        // Re-open from half-open on any failure.
        for _ in 0..BREAKER_THRESHOLD {
            r.record_failure(ServiceKey::Verification).await;
        }
        {
            let mut breakers = r.breakers.write().await;
            let breaker = breakers.get_mut(&ServiceKey::Verification).unwrap();
            breaker.opened_at = Some(Instant::now() - BREAKER_TIMEOUT - Duration::from_secs(1));
        }
        assert!(r.guard(ServiceKey::Verification).await.is_ok());
        r.record_failure(ServiceKey::Verification).await;
        assert_eq!(
            r.breaker_state(ServiceKey::Verification).await,
            BreakerState::Open
        );
    }

    #[tokio::test]
    async fn test_partition_threshold_boundary() {
        let fx = fixture().await;

        // 3 connected of 10 known: ratio exactly 0.3, no partition.
        let mut live = Vec::new();
        for _ in 0..3 {
            let keypair = Arc::new(MeshKeypair::generate());
            let transport = Arc::new(fx.hub.attach(keypair.node_id()).await);
            let remote = PeerManager::new(
                keypair,
                transport,
                Arc::new(StaticTelemetry::new(caps())),
                &MeshConfig::default(),
                EventBus::new(),
                Arc::new(AtomicBool::new(false)),
            );
            remote.start();
            fx.peer.connect(remote.local_id()).await.unwrap();
            live.push(remote);
        }
        for _ in 0..7 {
            fx.peer
                .register_peer(NodeId::random(), None, Some(caps()), None)
                .await;
        }
        assert_eq!(fx.peer.known_count().await, 10);
        assert!(fx.resilience.check_partition().await.is_none());

        // Dropping one connection moves strictly below the threshold.
        fx.peer.disconnect(&live[0].local_id()).await;
        let id = fx.resilience.check_partition().await.unwrap();
        let partitions = fx.resilience.partitions().await;
        let partition = partitions.iter().find(|p| p.id == id).unwrap();
        assert_eq!(partition.status, PartitionStatus::Detected);
        assert_eq!(partition.affected.len(), 8);

        // A second check does not raise a duplicate while one is active.
        assert!(fx.resilience.check_partition().await.is_none());
    }

    #[tokio::test]
    async fn test_quarantine_blacklists_and_disconnects() {
        let fx = fixture().await;

        let keypair = Arc::new(MeshKeypair::generate());
        let transport = Arc::new(fx.hub.attach(keypair.node_id()).await);
        let remote = PeerManager::new(
            keypair,
            transport,
            Arc::new(StaticTelemetry::new(caps())),
            &MeshConfig::default(),
            EventBus::new(),
            Arc::new(AtomicBool::new(false)),
        );
        remote.start();
        fx.peer.connect(remote.local_id()).await.unwrap();

        fx.resilience
            .quarantine(remote.local_id(), AlertSeverity::High, "test")
            .await;

        assert!(fx.resilience.is_blacklisted(&remote.local_id()).await);
        let record = fx.peer.peer_info(&remote.local_id()).await.unwrap();
        assert_eq!(record.status, PeerStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_malicious_peer_detected_by_scan() {
        let fx = fixture().await;
        let bad = NodeId::random();

        // Six verifications, every one against consensus: the score lands
        // far below the 0.2 bar.
        let mut record = mesh_types::ReputationScore::new(bad, 0);
        for _ in 0..6 {
            record.record(true, false, 1);
        }
        assert!(record.score < 0.2);
        fx.resilience.verification.insert_reputation(record).await;

        fx.resilience.run_security_scan().await;
        assert!(fx.resilience.is_blacklisted(&bad).await);
    }

    #[tokio::test]
    async fn test_health_sample_weights() {
        let fx = fixture().await;
        // No peers known: connectivity 0/1, latency and reliability default
        // to 1, throughput 0, security 1.
        let sample = fx.resilience.sample_health().await;
        assert!((sample.overall - (0.2 + 0.25 + 0.1)).abs() < 1e-9);
        assert_eq!(fx.resilience.latest_health().await.unwrap().timestamp_ms, sample.timestamp_ms);
    }
}
