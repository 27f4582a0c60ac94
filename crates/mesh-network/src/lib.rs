//! The meshcompute P2P coordination engine.
//!
//! [`MeshEngine`] composes the peer manager, routing layer, discovery,
//! dispatch, verification and resilience subsystems, boots them in
//! dependency order and exposes the single public surface of the fabric.

pub mod config;
pub mod dht;
pub mod discovery;
pub mod dispatch;
pub mod events;
pub mod peer;
pub mod resilience;
pub mod telemetry;
pub mod transport;
pub mod verification;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mesh_crypto::MeshKeypair;
use mesh_types::{
    frame::decode_payload, DiscoveryPayload, Frame, FrameKind, MeshError, NodeId, Result,
    TaskAnnounce, TaskId, TaskRequirements, TaskResponsePayload, TaskResultPayload, TaskType,
    VerificationPayload,
};

pub use crate::config::MeshConfig;
pub use crate::dht::DhtService;
pub use crate::discovery::PeerDiscovery;
pub use crate::dispatch::{ApproveAll, DecisionHelper, DigestExecutor, TaskDispatch, TaskExecutor};
pub use crate::events::{EventBus, MeshEvent};
pub use crate::peer::{PeerManager, PeerRecord, PeerStatus};
pub use crate::resilience::{NetworkResilience, ServiceKey};
pub use crate::telemetry::{StaticTelemetry, TelemetrySource};
pub use crate::transport::{MemoryHub, MemoryTransport, Transport};
pub use crate::verification::TaskVerification;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Public façade over the five subsystems.
pub struct MeshEngine {
    config: MeshConfig,
    node_id: NodeId,
    peer: Arc<PeerManager>,
    dht: Arc<DhtService>,
    discovery: Arc<PeerDiscovery>,
    dispatch: Arc<TaskDispatch>,
    verification: Arc<TaskVerification>,
    resilience: Arc<NetworkResilience>,
    decision: Arc<dyn DecisionHelper>,
    events: EventBus,
    shutdown_signal: Arc<AtomicBool>,
}

impl MeshEngine {
    /// Build the engine. Components come up in dependency order: peer
    /// manager, routing, discovery, dispatch, verification, resilience.
    pub fn new(
        config: MeshConfig,
        keypair: Arc<MeshKeypair>,
        transport: Arc<dyn Transport>,
        telemetry: Arc<dyn TelemetrySource>,
        decision: Arc<dyn DecisionHelper>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<Self> {
        let node_id = keypair.node_id();
        info!(node_id = %node_id, "🚀 Engine initialization started");

        let events = EventBus::new();
        let shutdown_signal = Arc::new(AtomicBool::new(false));

        let peer = PeerManager::new(
            Arc::clone(&keypair),
            transport,
            telemetry,
            &config,
            events.clone(),
            Arc::clone(&shutdown_signal),
        );
        let dht = DhtService::new(Arc::clone(&peer), &config, Arc::clone(&shutdown_signal));
        let discovery = PeerDiscovery::new(
            Arc::clone(&keypair),
            Arc::clone(&peer),
            Arc::clone(&dht),
            &config,
            events.clone(),
            Arc::clone(&shutdown_signal),
        );
        let dispatch = TaskDispatch::new(
            Arc::clone(&keypair),
            Arc::clone(&peer),
            Arc::clone(&dht),
            executor,
            &config,
            events.clone(),
            Arc::clone(&shutdown_signal),
        );
        let verification = TaskVerification::new(
            Arc::clone(&keypair),
            Arc::clone(&peer),
            &config,
            events.clone(),
            Arc::clone(&shutdown_signal),
        );
        let resilience = NetworkResilience::new(
            Arc::clone(&peer),
            Arc::clone(&dht),
            Arc::clone(&discovery),
            Arc::clone(&verification),
            &config,
            events.clone(),
            Arc::clone(&shutdown_signal),
        );

        info!(
            node_id = %node_id,
            max_peers = config.max_peers,
            bootstrap_nodes = config.bootstrap_nodes.len(),
            verification_required = config.verification_required,
            "🌐 Engine initialized"
        );

        Ok(Self {
            config,
            node_id,
            peer,
            dht,
            discovery,
            dispatch,
            verification,
            resilience,
            decision,
            events,
            shutdown_signal,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub fn peer(&self) -> &Arc<PeerManager> {
        &self.peer
    }

    pub fn dht(&self) -> &Arc<DhtService> {
        &self.dht
    }

    pub fn discovery(&self) -> &Arc<PeerDiscovery> {
        &self.discovery
    }

    pub fn dispatch(&self) -> &Arc<TaskDispatch> {
        &self.dispatch
    }

    pub fn verification(&self) -> &Arc<TaskVerification> {
        &self.verification
    }

    pub fn resilience(&self) -> &Arc<NetworkResilience> {
        &self.resilience
    }

    /// Start every subsystem loop, wire the inbound fan-out, contact the
    /// bootstrap set and announce ourselves.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(node_id = %self.node_id, "🌐 Starting engine");

        for trusted in &self.config.trusted_peers {
            self.peer.register_peer(*trusted, None, None, None).await;
        }

        self.peer.start();
        self.dht.start();
        self.discovery.start();
        if self.config.network_resilience {
            self.resilience.start();
        }

        let inbound = self
            .peer
            .take_inbound()
            .await
            .ok_or_else(|| MeshError::Network("inbound queue already taken".to_string()))?;
        self.spawn_fanout(inbound);

        for node in self.config.bootstrap_nodes.clone() {
            if node == self.node_id {
                continue;
            }
            if let Err(e) = self.peer.connect(node).await {
                warn!(node = %node, error = %e, "bootstrap connect failed");
            }
        }
        if let Err(e) = self.discovery.advertise_self().await {
            debug!(error = %e, "initial advertisement skipped");
        }

        self.events.emit(MeshEvent::Initialized {
            node_id: self.node_id,
        });
        info!(node_id = %self.node_id, "✅ Engine started");
        Ok(())
    }

    /// Submit a task into the fabric.
    pub async fn submit_task(
        self: &Arc<Self>,
        task_type: TaskType,
        payload: Vec<u8>,
        requirements: TaskRequirements,
        reward: f64,
        deadline_ms: i64,
    ) -> Result<TaskId> {
        self.resilience.guard(ServiceKey::Dht).await?;
        let submitted = self
            .dispatch
            .submit(task_type, payload, requirements, reward, deadline_ms)
            .await;
        match &submitted {
            Ok(_) => self.resilience.record_success(ServiceKey::Dht).await,
            Err(MeshError::Network(_)) | Err(MeshError::TransportUnavailable(_)) => {
                self.resilience.record_failure(ServiceKey::Dht).await
            }
            Err(_) => {}
        }
        submitted
    }

    /// Local capability snapshot, straight from the telemetry seam.
    pub async fn local_capabilities(&self) -> Result<mesh_types::CapabilitySnapshot> {
        self.peer.local_capabilities().await
    }

    /// Clear breaker and partition state and force rediscovery.
    pub async fn reset_network(&self) {
        self.resilience.reset_network().await;
    }

    /// Cooperative shutdown in reverse boot order: loops stop, in-flight
    /// verifications are finalized, tasks are cancelled, channels close.
    pub async fn shutdown(&self) {
        info!(node_id = %self.node_id, "shutting down");
        self.shutdown_signal.store(true, Ordering::Relaxed);

        self.verification.finalize_in_flight().await;
        self.dispatch.cancel_all().await;
        self.peer.stop().await;

        self.events.emit(MeshEvent::Shutdown);
        info!(node_id = %self.node_id, "👋 Engine stopped");
    }

    fn spawn_fanout(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Frame>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                if engine.shutdown_signal.load(Ordering::Relaxed) {
                    break;
                }
                engine.route_frame(frame).await;
            }
            debug!("inbound fan-out stopped");
        });
    }

    /// Fan inbound frames out to their owning subsystem by kind.
    async fn route_frame(self: &Arc<Self>, frame: Frame) {
        let from = frame.from;
        if self.resilience.is_blacklisted(&from).await {
            debug!(peer = %from, "dropping frame from blacklisted peer");
            return;
        }

        match frame.kind {
            FrameKind::TaskRequest => {
                let Ok(announce) = decode_payload::<TaskAnnounce>(&frame.payload) else {
                    return;
                };
                if let Some(request) = self.dispatch.handle_announce(from, announce).await {
                    // Primary assignment: only the external decision helper
                    // can green-light execution.
                    if self.decision.approve(&request).await {
                        if let Err(e) = self.dispatch.accept(request.task_id).await {
                            warn!(task_id = %request.task_id, error = %e, "accept failed");
                        }
                    } else {
                        self.dispatch
                            .reject(request.task_id, "declined by local policy")
                            .await;
                    }
                }
            }
            FrameKind::TaskResponse => {
                let Ok(payload) = decode_payload::<TaskResponsePayload>(&frame.payload) else {
                    return;
                };
                self.dispatch.handle_response(from, payload).await;
            }
            FrameKind::TaskResult => {
                let Ok(payload) = decode_payload::<TaskResultPayload>(&frame.payload) else {
                    return;
                };
                if let Some((request, result)) = self.dispatch.handle_result(from, payload).await {
                    if self.config.verification_required {
                        match self.resilience.guard(ServiceKey::Verification).await {
                            Ok(()) => {
                                match self
                                    .verification
                                    .request_verification(&request, &result)
                                    .await
                                {
                                    Ok(_) => {
                                        self.resilience
                                            .record_success(ServiceKey::Verification)
                                            .await
                                    }
                                    Err(e) => {
                                        warn!(task_id = %request.task_id, error = %e, "verification request failed");
                                        self.resilience
                                            .record_failure(ServiceKey::Verification)
                                            .await;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(task_id = %request.task_id, error = %e, "verification skipped");
                            }
                        }
                    }
                }
            }
            FrameKind::PeerDiscovery => {
                let Ok(payload) = decode_payload::<DiscoveryPayload>(&frame.payload) else {
                    return;
                };
                match payload {
                    DiscoveryPayload::FindNode { .. } | DiscoveryPayload::FindNodeResp { .. } => {
                        self.dht.handle_payload(from, payload).await;
                    }
                    DiscoveryPayload::SecurityAlert {
                        malicious_peer,
                        severity,
                        ..
                    } => {
                        self.resilience
                            .handle_alert(from, malicious_peer, severity)
                            .await;
                    }
                    other => self.discovery.handle_payload(from, other).await,
                }
            }
            FrameKind::VerificationRequest => {
                let Ok(payload) = decode_payload::<VerificationPayload>(&frame.payload) else {
                    return;
                };
                match payload {
                    VerificationPayload::Request(request) => {
                        self.verification.handle_request(from, request).await;
                    }
                    VerificationPayload::Response(response) => {
                        if let Err(e) = self.verification.record_response(response).await {
                            debug!(error = %e, "verification response dropped");
                        }
                    }
                }
            }
            // Liveness frames never reach the fan-out.
            FrameKind::Ping | FrameKind::Pong => {}
        }
    }
}
