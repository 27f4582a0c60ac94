use mesh_types::{DiscoveryMethod, NodeId};
use std::time::Duration;

/// Engine configuration. Every interval is a real timer period; tests
/// shrink them, production keeps the defaults.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Soft upper bound on the peer catalog size.
    pub max_peers: usize,
    /// Seed node ids contacted on first boot.
    pub bootstrap_nodes: Vec<NodeId>,
    /// Enabled discovery mechanisms, tried in priority order.
    pub discovery_methods: Vec<DiscoveryMethod>,
    /// When false, completions are surfaced without verifier consensus.
    pub verification_required: bool,
    /// Toggles the partition/security monitoring loops.
    pub network_resilience: bool,
    /// Peers exempt from reputation-only blacklisting.
    pub trusted_peers: Vec<NodeId>,

    pub task_timeout: Duration,
    pub verification_timeout: Duration,
    pub ping_interval: Duration,
    pub discovery_interval: Duration,
    pub topology_interval: Duration,
    pub health_interval: Duration,
    pub security_interval: Duration,
    pub recovery_interval: Duration,
    pub bucket_refresh_interval: Duration,
    /// Peers idle longer than this are evicted.
    pub peer_stale_timeout: Duration,
    /// Deadline for a single remote query (FIND_NODE, directory lookups).
    pub query_timeout: Duration,
    /// Deadline for a single path-discovery probe.
    pub path_query_timeout: Duration,
    /// Base delay between failed connect attempts.
    pub connect_backoff: Duration,
    /// Base delay of the per-peer recovery backoff (doubles per attempt).
    pub recovery_backoff: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            bootstrap_nodes: vec![],
            discovery_methods: vec![
                DiscoveryMethod::Dht,
                DiscoveryMethod::PeerExchange,
                DiscoveryMethod::Bootstrap,
                DiscoveryMethod::Relay,
            ],
            verification_required: true,
            network_resilience: true,
            trusted_peers: vec![],
            task_timeout: Duration::from_secs(300),
            verification_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(30),
            topology_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(10),
            security_interval: Duration::from_secs(5),
            recovery_interval: Duration::from_secs(30),
            bucket_refresh_interval: Duration::from_secs(60),
            peer_stale_timeout: Duration::from_secs(300),
            query_timeout: Duration::from_secs(5),
            path_query_timeout: Duration::from_secs(3),
            connect_backoff: Duration::from_millis(500),
            recovery_backoff: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol() {
        let config = MeshConfig::default();
        assert_eq!(config.max_peers, 50);
        assert!(config.verification_required);
        assert!(config.network_resilience);
        assert_eq!(config.task_timeout, Duration::from_secs(300));
        assert_eq!(config.verification_timeout, Duration::from_secs(60));
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert!(!config.discovery_methods.contains(&DiscoveryMethod::Mdns));
    }
}
