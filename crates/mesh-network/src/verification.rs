//! Result verification and reputation.
//!
//! A completed result is attested by three to seven independent verifiers.
//! Consensus needs a ≥67 % agreement over at least three responses; the
//! deadline finalizes whatever has arrived by then. Reputation is updated
//! only at finalization, from each responder's agreement with the majority.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use mesh_crypto::{verify_signature, MeshKeypair};
use mesh_types::{
    canonical::canonical_sha256, frame::encode_payload, ConsensusDecision, FrameKind, MeshError,
    NodeId, ReputationScore, Result, TaskRequest, TaskResult, ThermalState, VerificationChecks,
    VerificationId, VerificationOutcome, VerificationPayload, VerificationRequest,
    VerificationResponse,
};

use crate::config::MeshConfig;
use crate::events::{EventBus, MeshEvent};
use crate::now_ms;
use crate::peer::PeerManager;

pub const MIN_VERIFIERS: usize = 3;
pub const MAX_VERIFIERS: usize = 7;
const CONSENSUS_RATIO: f64 = 0.67;
const MIN_VERIFIER_REPUTATION: f64 = 0.3;
const MIN_EXECUTION_MS: u64 = 100;
const MAX_EXECUTION_MS: u64 = 300_000;
const SUSPECT_OUTPUT_MARKERS: [&str; 3] = ["error", "failed", "timeout"];

pub struct TaskVerification {
    local_id: NodeId,
    keypair: Arc<MeshKeypair>,
    peer: Arc<PeerManager>,
    outcomes: Arc<RwLock<HashMap<VerificationId, VerificationOutcome>>>,
    selected: Arc<RwLock<HashMap<VerificationId, HashSet<NodeId>>>>,
    reputation: Arc<RwLock<HashMap<NodeId, ReputationScore>>>,
    verification_timeout: Duration,
    events: EventBus,
    shutdown: Arc<AtomicBool>,
}

impl TaskVerification {
    pub fn new(
        keypair: Arc<MeshKeypair>,
        peer: Arc<PeerManager>,
        config: &MeshConfig,
        events: EventBus,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: keypair.node_id(),
            keypair,
            peer,
            outcomes: Arc::new(RwLock::new(HashMap::new())),
            selected: Arc::new(RwLock::new(HashMap::new())),
            reputation: Arc::new(RwLock::new(HashMap::new())),
            verification_timeout: config.verification_timeout,
            events,
            shutdown,
        })
    }

    pub async fn outcome(&self, id: &VerificationId) -> Option<VerificationOutcome> {
        self.outcomes.read().await.get(id).cloned()
    }

    pub async fn reputation(&self, peer: &NodeId) -> f64 {
        self.reputation
            .read()
            .await
            .get(peer)
            .map(|r| r.score)
            .unwrap_or(ReputationScore::INITIAL)
    }

    pub async fn reputation_snapshot(&self) -> Vec<ReputationScore> {
        self.reputation.read().await.values().cloned().collect()
    }

    /// Fixture hook: install a full track record.
    pub async fn insert_reputation(&self, score: ReputationScore) {
        let value = score.score;
        let peer = score.peer;
        self.reputation.write().await.insert(peer, score);
        self.peer.set_reputation(&peer, value).await;
    }

    /// Fixture hook, mirrored from the peer record write-through.
    pub async fn set_reputation(&self, peer: NodeId, value: f64) {
        let mut reputation = self.reputation.write().await;
        let entry = reputation
            .entry(peer)
            .or_insert_with(|| ReputationScore::new(peer, now_ms()));
        entry.score = value.clamp(0.0, 1.0);
        drop(reputation);
        self.peer.set_reputation(&peer, value).await;
    }

    /// Fraction of finalized outcomes that were approved. Feeds the health
    /// composite.
    pub async fn approval_rate(&self) -> f64 {
        let outcomes = self.outcomes.read().await;
        let finalized: Vec<&VerificationOutcome> =
            outcomes.values().filter(|o| o.is_finalized()).collect();
        if finalized.is_empty() {
            return 1.0;
        }
        let approved = finalized
            .iter()
            .filter(|o| o.decision == ConsensusDecision::Approved)
            .count();
        approved as f64 / finalized.len() as f64
    }

    /// Select verifiers and broadcast a signed request for attestation.
    pub async fn request_verification(
        self: &Arc<Self>,
        request: &TaskRequest,
        result: &TaskResult,
    ) -> Result<VerificationId> {
        let verifiers = self.select_verifiers(request, result.completed_by).await;
        let verification_id = VerificationId::random();

        let mut message = VerificationRequest {
            verification_id,
            task_id: request.task_id,
            result: result.clone(),
            submitter: self.local_id,
            created_at_ms: now_ms(),
            required_verifiers: verifiers.len().clamp(MIN_VERIFIERS, MAX_VERIFIERS),
            deadline_ms: now_ms() + self.verification_timeout.as_millis() as i64,
            signature: None,
        };
        message.signature = Some(self.keypair.sign(&message.signable()?));

        self.outcomes.write().await.insert(
            verification_id,
            VerificationOutcome::new(verification_id, request.task_id, verifiers.len()),
        );
        self.selected
            .write()
            .await
            .insert(verification_id, verifiers.iter().copied().collect());

        let payload = encode_payload(&VerificationPayload::Request(message))?;
        for verifier in &verifiers {
            if let Err(e) = self
                .peer
                .send(*verifier, FrameKind::VerificationRequest, payload.clone())
                .await
            {
                debug!(verifier = %verifier, error = %e, "verification request send failed");
            }
        }

        info!(
            verification_id = %verification_id,
            task_id = %request.task_id,
            verifiers = verifiers.len(),
            "🔎 Verification requested"
        );
        self.events.emit(MeshEvent::VerificationRequested {
            verification_id,
            task_id: request.task_id,
        });

        self.spawn_deadline(verification_id);
        Ok(verification_id)
    }

    /// All connected peers except the executor, filtered and ranked.
    async fn select_verifiers(&self, request: &TaskRequest, executor: NodeId) -> Vec<NodeId> {
        let half_cores = request.requirements.cpu_cores.div_ceil(2);
        let half_ram = request.requirements.memory_gb.div_ceil(2);

        let mut ranked: Vec<(f64, NodeId)> = Vec::new();
        for record in self.peer.all_peers().await {
            if record.node_id == executor || record.node_id == self.local_id {
                continue;
            }
            if record.status != crate::peer::PeerStatus::Connected {
                continue;
            }
            let Some(caps) = &record.capabilities else {
                continue;
            };
            if caps.cpu_cores < half_cores
                || caps.ram_gb < half_ram
                || caps.thermal == ThermalState::Critical
            {
                continue;
            }
            let reputation = self.reputation(&record.node_id).await;
            if reputation < MIN_VERIFIER_REPUTATION {
                continue;
            }
            let latency = record.latency_ms.unwrap_or(100) as f64;
            let rank = 0.7 * reputation + 0.3 * ((200.0 - latency).max(0.0) / 200.0);
            ranked.push((rank, record.node_id));
        }

        ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
        ranked
            .into_iter()
            .take(MAX_VERIFIERS)
            .map(|(_, id)| id)
            .collect()
    }

    /// Verifier-side re-check of a result. The sub-checks here are the
    /// floor; task-type-specific validation hangs off the executor seam.
    pub fn perform_verification(&self, request: &VerificationRequest) -> Result<VerificationResponse> {
        let result = &request.result;

        let result_hash = canonical_sha256(&result.output)
            .map(|digest| digest.to_vec())
            .unwrap_or_default();
        let execution_time_valid = (MIN_EXECUTION_MS..=MAX_EXECUTION_MS)
            .contains(&result.execution_time_ms);
        let resource_usage_valid = result.usage.is_plausible();

        let rendered = String::from_utf8_lossy(&result.output).to_lowercase();
        let output_valid = !result.output.is_empty()
            && !SUSPECT_OUTPUT_MARKERS
                .iter()
                .any(|marker| rendered.contains(marker));

        let checks = VerificationChecks {
            result_hash,
            execution_time_valid,
            resource_usage_valid,
            output_valid,
        };
        let confidence = checks.confidence();
        let is_valid = confidence >= 0.7 && output_valid;

        let mut response = VerificationResponse {
            verification_id: request.verification_id,
            verifier: self.local_id,
            task_id: request.task_id,
            is_valid,
            confidence,
            checks,
            timestamp_ms: now_ms(),
            signature: None,
        };
        response.signature = Some(self.keypair.sign(&response.signable()?));
        Ok(response)
    }

    /// Inbound request on a verifier node: attest and reply to the
    /// requester.
    pub async fn handle_request(&self, from: NodeId, request: VerificationRequest) {
        if let Some(key) = self.peer.peer_info(&from).await.and_then(|r| r.public_key) {
            let valid = match (request.signable(), &request.signature) {
                (Ok(bytes), Some(sig)) => verify_signature(&key, &bytes, sig),
                _ => false,
            };
            if !valid {
                warn!(from = %from, "dropping verification request with bad signature");
                return;
            }
        }

        let Ok(response) = self.perform_verification(&request) else {
            return;
        };
        let Ok(payload) = encode_payload(&VerificationPayload::Response(response)) else {
            return;
        };
        if let Err(e) = self
            .peer
            .send(request.submitter, FrameKind::VerificationRequest, payload)
            .await
        {
            debug!(to = %request.submitter, error = %e, "verification response send failed");
        }
    }

    /// Record one verifier attestation; finalizes when consensus is
    /// reached.
    pub async fn record_response(&self, response: VerificationResponse) -> Result<()> {
        let verifier = response.verifier;

        // Identity: the responder must be one of the selected verifiers.
        let was_selected = self
            .selected
            .read()
            .await
            .get(&response.verification_id)
            .map(|set| set.contains(&verifier))
            .unwrap_or(false);
        if !was_selected {
            return Err(MeshError::InvalidMessage(format!(
                "response from unselected verifier {}",
                verifier
            )));
        }

        // Signature: required, and checked whenever the key is known.
        let Some(signature) = &response.signature else {
            return Err(MeshError::SignatureInvalid);
        };
        if let Some(key) = self.peer.peer_info(&verifier).await.and_then(|r| r.public_key) {
            let bytes = response.signable()?;
            if !verify_signature(&key, &bytes, signature) {
                self.penalize_invalid_signature(verifier).await;
                return Err(MeshError::SignatureInvalid);
            }
        }

        let decided = {
            let mut outcomes = self.outcomes.write().await;
            let outcome = outcomes
                .get_mut(&response.verification_id)
                .ok_or_else(|| {
                    MeshError::InvalidMessage("response for unknown verification".to_string())
                })?;
            if outcome.is_finalized() {
                return Ok(());
            }
            if outcome.responses.iter().any(|r| r.verifier == verifier) {
                return Err(MeshError::InvalidMessage(format!(
                    "duplicate response from {}",
                    verifier
                )));
            }

            if response.is_valid {
                outcome.approvals += 1;
            } else {
                outcome.rejections += 1;
            }
            outcome.responses.push(response.clone());
            let n = outcome.total_responses() as f64;
            outcome.average_confidence =
                outcome.responses.iter().map(|r| r.confidence).sum::<f64>() / n;

            let approvals = outcome.approvals as f64;
            let rejections = outcome.rejections as f64;
            if outcome.total_responses() >= MIN_VERIFIERS && approvals / n >= CONSENSUS_RATIO {
                Some(ConsensusDecision::Approved)
            } else if outcome.total_responses() >= MIN_VERIFIERS
                && rejections / n >= CONSENSUS_RATIO
            {
                Some(ConsensusDecision::Rejected)
            } else {
                None
            }
        };

        if let Some(decision) = decided {
            self.finalize(response.verification_id, decision).await;
        }
        Ok(())
    }

    async fn finalize(&self, verification_id: VerificationId, decision: ConsensusDecision) {
        let (task_id, responses) = {
            let mut outcomes = self.outcomes.write().await;
            let Some(outcome) = outcomes.get_mut(&verification_id) else {
                return;
            };
            if outcome.is_finalized() {
                return;
            }
            outcome.decision = decision;
            outcome.finalized_at_ms = Some(now_ms());
            (outcome.task_id, outcome.responses.clone())
        };
        self.selected.write().await.remove(&verification_id);

        let majority_valid = decision == ConsensusDecision::Approved;
        let mut reputation = self.reputation.write().await;
        for response in &responses {
            let entry = reputation
                .entry(response.verifier)
                .or_insert_with(|| ReputationScore::new(response.verifier, now_ms()));
            entry.record(response.is_valid, majority_valid, now_ms());
        }
        let updates: Vec<(NodeId, f64)> = responses
            .iter()
            .filter_map(|r| reputation.get(&r.verifier).map(|s| (r.verifier, s.score)))
            .collect();
        drop(reputation);

        for (peer, score) in updates {
            self.peer.set_reputation(&peer, score).await;
        }

        info!(
            verification_id = %verification_id,
            task_id = %task_id,
            decision = ?decision,
            responses = responses.len(),
            "⚖️ Verification finalized"
        );
        self.events.emit(MeshEvent::VerificationFinalized {
            verification_id,
            task_id,
            decision,
        });
    }

    fn spawn_deadline(self: &Arc<Self>, verification_id: VerificationId) {
        let verification = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(verification.verification_timeout).await;
            if verification.shutdown.load(Ordering::Relaxed) {
                return;
            }
            verification.finalize_due(verification_id).await;
        });
    }

    /// Deadline finalization: three or more responses decide by the larger
    /// ratio (tie rejects); fewer reject outright.
    async fn finalize_due(&self, verification_id: VerificationId) {
        let pending = {
            let outcomes = self.outcomes.read().await;
            outcomes
                .get(&verification_id)
                .filter(|o| !o.is_finalized())
                .map(|o| (o.total_responses(), o.approvals, o.rejections))
        };
        let Some((n, approvals, rejections)) = pending else {
            return;
        };

        let decision = if n >= MIN_VERIFIERS {
            if approvals > rejections {
                ConsensusDecision::Approved
            } else {
                ConsensusDecision::Rejected
            }
        } else {
            warn!(
                verification_id = %verification_id,
                responses = n,
                "verification deadline with insufficient responses"
            );
            ConsensusDecision::Rejected
        };
        self.finalize(verification_id, decision).await;
    }

    /// Invalid frame signatures count against the sender's track record.
    pub async fn penalize_invalid_signature(&self, peer: NodeId) {
        let score = {
            let mut reputation = self.reputation.write().await;
            let entry = reputation
                .entry(peer)
                .or_insert_with(|| ReputationScore::new(peer, now_ms()));
            entry.penalize(now_ms());
            entry.score
        };
        self.peer.set_reputation(&peer, score).await;
    }

    /// Shutdown rule: in-flight outcomes with at least three responses are
    /// finalized by ratio, the rest are rejected.
    pub async fn finalize_in_flight(&self) {
        let pending: Vec<VerificationId> = {
            let outcomes = self.outcomes.read().await;
            outcomes
                .values()
                .filter(|o| !o.is_finalized())
                .map(|o| o.verification_id)
                .collect()
        };
        for verification_id in pending {
            self.finalize_due(verification_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::StaticTelemetry;
    use crate::transport::MemoryHub;
    use mesh_types::{CapabilitySnapshot, ComputeTier, ResourceUsage, TaskId};

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

    async fn fixture() -> (Arc<TaskVerification>, Arc<crate::peer::PeerManager>) {
        let hub = MemoryHub::new();
        let keypair = Arc::new(MeshKeypair::generate());
        let transport = Arc::new(hub.attach(keypair.node_id()).await);
        let peer = crate::peer::PeerManager::new(
            Arc::clone(&keypair),
            transport,
            Arc::new(StaticTelemetry::new(caps())),
            &MeshConfig::default(),
            EventBus::new(),
            Arc::new(AtomicBool::new(false)),
        );
        let verification = TaskVerification::new(
            keypair,
            Arc::clone(&peer),
            &MeshConfig::default(),
            EventBus::new(),
            Arc::new(AtomicBool::new(false)),
        );
        (verification, peer)
    }

    fn result_with_output(output: Vec<u8>) -> TaskResult {
        TaskResult {
            task_id: TaskId::random(),
            output,
            completed_by: NodeId::random(),
            completed_at_ms: now_ms(),
            execution_time_ms: 5_000,
            usage: ResourceUsage {
                cpu_pct: 20.0,
                memory_pct: 10.0,
                network_kb: 1.0,
            },
            signature: None,
        }
    }

    fn request_for(result: &TaskResult) -> VerificationRequest {
        VerificationRequest {
            verification_id: VerificationId::random(),
            task_id: result.task_id,
            result: result.clone(),
            submitter: NodeId::random(),
            created_at_ms: now_ms(),
            required_verifiers: 3,
            deadline_ms: now_ms() + 60_000,
            signature: None,
        }
    }

    #[tokio::test]
    async fn test_perform_verification_happy() {
        let (verification, _) = fixture().await;
        let result = result_with_output(b"ok-bytes".to_vec());
        let response = verification
            .perform_verification(&request_for(&result))
            .unwrap();

        assert!(response.is_valid);
        assert!((response.confidence - 1.0).abs() < 1e-9);
        assert!(response.checks.output_valid);
        assert!(response.signature.is_some());
    }

    #[tokio::test]
    async fn test_perform_verification_flags_bad_output() {
        let (verification, _) = fixture().await;
        let result = result_with_output(b"Task FAILED midway".to_vec());
        let response = verification
            .perform_verification(&request_for(&result))
            .unwrap();

        assert!(!response.checks.output_valid);
        assert!(!response.is_valid);
    }

    async fn seed_outcome(
        verification: &Arc<TaskVerification>,
        verifiers: &[NodeId],
    ) -> VerificationId {
        let verification_id = VerificationId::random();
        verification.outcomes.write().await.insert(
            verification_id,
            VerificationOutcome::new(verification_id, TaskId::random(), verifiers.len()),
        );
        verification
            .selected
            .write()
            .await
            .insert(verification_id, verifiers.iter().copied().collect());
        verification_id
    }

    fn vote(
        verification_id: VerificationId,
        verifier: NodeId,
        is_valid: bool,
        confidence: f64,
    ) -> VerificationResponse {
        VerificationResponse {
            verification_id,
            verifier,
            task_id: TaskId::random(),
            is_valid,
            confidence,
            checks: VerificationChecks {
                result_hash: vec![1; 32],
                execution_time_valid: true,
                resource_usage_valid: true,
                output_valid: is_valid,
            },
            timestamp_ms: now_ms(),
            signature: Some(mesh_types::Signature::new(vec![7; 64])),
        }
    }

    #[tokio::test]
    async fn test_byzantine_approval() {
        let (verification, _peer) = fixture().await;
        let verifiers: Vec<NodeId> = (0..5).map(|_| NodeId::random()).collect();
        let id = seed_outcome(&verification, &verifiers).await;

        // Two approvals then a dissent keep the outcome pending (2/3 is
        // below the 0.67 bar).
        verification
            .record_response(vote(id, verifiers[0], true, 0.8))
            .await
            .unwrap();
        verification
            .record_response(vote(id, verifiers[1], true, 0.8))
            .await
            .unwrap();
        verification
            .record_response(vote(id, verifiers[2], false, 0.9))
            .await
            .unwrap();
        assert!(!verification.outcome(&id).await.unwrap().is_finalized());

        // A fourth approval crosses the threshold: 3/4 ≥ 0.67.
        verification
            .record_response(vote(id, verifiers[3], true, 0.8))
            .await
            .unwrap();
        let outcome = verification.outcome(&id).await.unwrap();
        assert_eq!(outcome.decision, ConsensusDecision::Approved);
        assert_eq!(outcome.approvals, 3);
        assert_eq!(outcome.rejections, 1);

        // The dissenter voted against the majority: one false negative.
        let scores = verification.reputation.read().await;
        let dissenter = scores.get(&verifiers[2]).unwrap();
        assert_eq!(dissenter.false_negative, 1);
        assert_eq!(dissenter.correct, 0);
        let agree = scores.get(&verifiers[0]).unwrap();
        assert_eq!(agree.correct, 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_unselected_rejected() {
        let (verification, _peer) = fixture().await;
        let verifiers: Vec<NodeId> = (0..5).map(|_| NodeId::random()).collect();
        let id = seed_outcome(&verification, &verifiers).await;

        verification
            .record_response(vote(id, verifiers[0], true, 0.8))
            .await
            .unwrap();
        assert!(verification
            .record_response(vote(id, verifiers[0], true, 0.8))
            .await
            .is_err());
        assert!(verification
            .record_response(vote(id, NodeId::random(), true, 0.8))
            .await
            .is_err());
        assert_eq!(verification.outcome(&id).await.unwrap().total_responses(), 1);
    }

    #[tokio::test]
    async fn test_deadline_with_two_responses_rejects() {
        let (verification, _peer) = fixture().await;
        let verifiers: Vec<NodeId> = (0..5).map(|_| NodeId::random()).collect();
        let id = seed_outcome(&verification, &verifiers).await;

        verification
            .record_response(vote(id, verifiers[0], true, 0.9))
            .await
            .unwrap();
        verification
            .record_response(vote(id, verifiers[1], true, 0.9))
            .await
            .unwrap();

        verification.finalize_due(id).await;
        let outcome = verification.outcome(&id).await.unwrap();
        assert_eq!(outcome.decision, ConsensusDecision::Rejected);
    }

    #[tokio::test]
    async fn test_deadline_tie_rejects() {
        let (verification, _peer) = fixture().await;
        let verifiers: Vec<NodeId> = (0..6).map(|_| NodeId::random()).collect();
        let id = seed_outcome(&verification, &verifiers).await;

        verification
            .record_response(vote(id, verifiers[0], true, 0.9))
            .await
            .unwrap();
        verification
            .record_response(vote(id, verifiers[1], true, 0.9))
            .await
            .unwrap();
        verification
            .record_response(vote(id, verifiers[2], false, 0.9))
            .await
            .unwrap();
        verification
            .record_response(vote(id, verifiers[3], false, 0.9))
            .await
            .unwrap();

        verification.finalize_due(id).await;
        assert_eq!(
            verification.outcome(&id).await.unwrap().decision,
            ConsensusDecision::Rejected
        );
    }

    #[tokio::test]
    async fn test_finalized_outcome_never_reverts() {
        let (verification, _peer) = fixture().await;
        let verifiers: Vec<NodeId> = (0..5).map(|_| NodeId::random()).collect();
        let id = seed_outcome(&verification, &verifiers).await;

        for verifier in verifiers.iter().take(3) {
            verification
                .record_response(vote(id, *verifier, true, 0.9))
                .await
                .unwrap();
        }
        assert_eq!(
            verification.outcome(&id).await.unwrap().decision,
            ConsensusDecision::Approved
        );

        // Late and repeated finalization attempts change nothing.
        verification.finalize_due(id).await;
        let outcome = verification.outcome(&id).await.unwrap();
        assert_eq!(outcome.decision, ConsensusDecision::Approved);
        assert_eq!(outcome.total_responses(), 3);
    }

    #[tokio::test]
    async fn test_perform_verification_flags_exec_time() {
        let (verification, _) = fixture().await;
        let mut result = result_with_output(b"fine".to_vec());
        result.execution_time_ms = 10; // faster than plausible
        let response = verification
            .perform_verification(&request_for(&result))
            .unwrap();

        assert!(!response.checks.execution_time_valid);
        // 0.4 + 0.2 + 0.2 = 0.8, still valid overall.
        assert!(response.is_valid);

        result.usage.cpu_pct = 400.0;
        let response = verification
            .perform_verification(&request_for(&result))
            .unwrap();
        // 0.4 + 0.2 = 0.6 < 0.7.
        assert!(!response.is_valid);
    }
}
