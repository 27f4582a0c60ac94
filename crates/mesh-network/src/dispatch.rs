//! Task submission, assignment and execution.
//!
//! Dispatch owns the live task table. A submitted task is routed toward the
//! hash of its requirements, assigned to the best-scoring candidate with up
//! to three ordered backups, and watched by a per-task timer. Executor-side
//! failures flow back as response frames; the submitter promotes backups
//! until none remain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use mesh_crypto::MeshKeypair;
use mesh_types::{
    frame::encode_payload, CapabilitySnapshot, DhtNodeInfo, FrameKind, MeshError, NodeId,
    ResourceUsage, Result, TaskAnnounce, TaskAssignment, TaskId, TaskRequest, TaskRequirements,
    TaskResponsePayload, TaskResult, TaskResultPayload, TaskState, TaskType, ThermalState,
};

use crate::config::MeshConfig;
use crate::dht::DhtService;
use crate::events::{EventBus, MeshEvent};
use crate::now_ms;
use crate::peer::PeerManager;

const BACKUP_COUNT: usize = 3;
const MIN_CANDIDATE_REPUTATION: f64 = 0.5;
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Type-selected execution handler. Implementations must return promptly
/// once the surrounding future is dropped; dispatch aborts execution when a
/// task leaves the Active state.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &TaskRequest) -> Result<(Vec<u8>, ResourceUsage)>;
}

/// External decision helper consulted before accepting inbound work.
#[async_trait]
pub trait DecisionHelper: Send + Sync {
    async fn approve(&self, request: &TaskRequest) -> bool;
}

/// Accepts every assignment; the default for nodes without a local policy.
pub struct ApproveAll;

#[async_trait]
impl DecisionHelper for ApproveAll {
    async fn approve(&self, _request: &TaskRequest) -> bool {
        true
    }
}

/// Hashes the task payload. Stands in for real work in tests and for
/// Compute tasks with no registered handler.
pub struct DigestExecutor;

#[async_trait]
impl TaskExecutor for DigestExecutor {
    async fn execute(&self, request: &TaskRequest) -> Result<(Vec<u8>, ResourceUsage)> {
        let digest = mesh_types::canonical::canonical_sha256(&request.payload)
            .map_err(|e| MeshError::Serialization(e.to_string()))?;
        Ok((
            digest.to_vec(),
            ResourceUsage {
                cpu_pct: 12.0,
                memory_pct: 4.0,
                network_kb: 0.0,
            },
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskRole {
    Submitter,
    Executor { backup: bool },
}

struct ActiveTask {
    request: TaskRequest,
    assignment: Option<TaskAssignment>,
    state: TaskState,
    role: TaskRole,
    result: Option<TaskResult>,
    watchdog: Option<JoinHandle<()>>,
}

pub struct TaskDispatch {
    local_id: NodeId,
    keypair: Arc<MeshKeypair>,
    peer: Arc<PeerManager>,
    dht: Arc<DhtService>,
    executor: Arc<dyn TaskExecutor>,
    tasks: Arc<RwLock<HashMap<TaskId, ActiveTask>>>,
    task_timeout: Duration,
    events: EventBus,
    shutdown: Arc<AtomicBool>,
}

impl TaskDispatch {
    pub fn new(
        keypair: Arc<MeshKeypair>,
        peer: Arc<PeerManager>,
        dht: Arc<DhtService>,
        executor: Arc<dyn TaskExecutor>,
        config: &MeshConfig,
        events: EventBus,
        shutdown: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id: keypair.node_id(),
            keypair,
            peer,
            dht,
            executor,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            task_timeout: config.task_timeout,
            events,
            shutdown,
        })
    }

    pub async fn task_state(&self, task_id: &TaskId) -> Option<TaskState> {
        self.tasks.read().await.get(task_id).map(|t| t.state)
    }

    pub async fn task_result(&self, task_id: &TaskId) -> Option<TaskResult> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .and_then(|t| t.result.clone())
    }

    pub async fn assignment(&self, task_id: &TaskId) -> Option<TaskAssignment> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .and_then(|t| t.assignment.clone())
    }

    /// Submit a task: hash its requirements, look candidates up in the
    /// routing layer, assign primary plus backups, arm the watchdog.
    pub async fn submit(
        self: &Arc<Self>,
        task_type: TaskType,
        payload: Vec<u8>,
        requirements: TaskRequirements,
        reward: f64,
        deadline_ms: i64,
    ) -> Result<TaskId> {
        let task_id = TaskId::random();
        let mut request = TaskRequest {
            task_id,
            task_type,
            payload,
            requirements,
            reward,
            deadline_ms,
            submitter: self.local_id,
            created_at_ms: now_ms(),
            signature: None,
        };
        request.signature = Some(self.keypair.sign(&request.signable()?));

        let target = request.requirements.routing_target()?;
        let candidates = self.dht.lookup(target).await;
        let ranked = self.rank_candidates(&candidates, &request.requirements).await;
        if ranked.is_empty() {
            return Err(MeshError::NoSuitableCandidates);
        }

        let primary = ranked[0];
        let backups: Vec<NodeId> = ranked.iter().skip(1).take(BACKUP_COUNT).copied().collect();
        let assignment = TaskAssignment {
            task_id,
            primary,
            assigned_at_ms: now_ms(),
            expected_completion_ms: now_ms() + self.task_timeout.as_millis() as i64,
            backups,
        };

        let watchdog = self.spawn_watchdog(task_id);
        self.tasks.write().await.insert(
            task_id,
            ActiveTask {
                request: request.clone(),
                assignment: Some(assignment.clone()),
                state: TaskState::Active,
                role: TaskRole::Submitter,
                result: None,
                watchdog: Some(watchdog),
            },
        );

        self.announce(&request, &assignment).await;
        info!(
            task_id = %task_id,
            primary = %assignment.primary,
            backups = assignment.backups.len(),
            "📋 Task submitted"
        );
        self.events.emit(MeshEvent::TaskSubmitted { task_id });
        Ok(task_id)
    }

    async fn announce(&self, request: &TaskRequest, assignment: &TaskAssignment) {
        let mut targets = vec![(assignment.primary, false)];
        targets.extend(assignment.backups.iter().map(|b| (*b, true)));

        for (node, is_backup) in targets {
            let announce = TaskAnnounce {
                request: request.clone(),
                assignment: assignment.clone(),
                is_backup,
            };
            let Ok(payload) = encode_payload(&announce) else {
                continue;
            };
            // Candidates come from the routing table and may not have an
            // open channel yet.
            let _ = self.peer.connect(node).await;
            if let Err(e) = self.peer.send(node, FrameKind::TaskRequest, payload).await {
                warn!(task_id = %request.task_id, node = %node, error = %e, "assignment send failed");
            }
        }
    }

    /// Score and filter lookup candidates against the requirements.
    async fn rank_candidates(
        &self,
        candidates: &[DhtNodeInfo],
        requirements: &TaskRequirements,
    ) -> Vec<NodeId> {
        let mut scored: Vec<(f64, NodeId)> = Vec::new();
        for info in candidates {
            if info.node_id == self.local_id {
                continue;
            }
            // Prefer the live peer record over possibly stale table data.
            let record = self.peer.peer_info(&info.node_id).await;
            let reputation = record.as_ref().map(|r| r.reputation).unwrap_or(info.reputation);
            let latency = record.as_ref().and_then(|r| r.latency_ms);
            let caps = record
                .as_ref()
                .and_then(|r| r.capabilities.clone())
                .unwrap_or_else(|| info.capabilities.clone());

            if !Self::eligible(&caps, requirements, reputation) {
                continue;
            }
            scored.push((
                Self::candidate_score(&caps, requirements, reputation, latency),
                info.node_id,
            ));
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.into_iter().map(|(_, id)| id).collect()
    }

    fn eligible(
        caps: &CapabilitySnapshot,
        requirements: &TaskRequirements,
        reputation: f64,
    ) -> bool {
        caps.satisfies(requirements)
            && caps.thermal != ThermalState::Critical
            && reputation >= MIN_CANDIDATE_REPUTATION
    }

    fn candidate_score(
        caps: &CapabilitySnapshot,
        requirements: &TaskRequirements,
        reputation: f64,
        latency_ms: Option<u64>,
    ) -> f64 {
        let cores = (caps.cpu_cores as f64 / requirements.cpu_cores.max(1) as f64).min(2.0) * 30.0;
        let ram = (caps.ram_gb as f64 / requirements.memory_gb.max(1) as f64).min(2.0) * 25.0;
        let reputation = reputation * 20.0;
        let latency = match latency_ms {
            Some(l) if l < 100 => 15.0,
            Some(l) if l < 200 => 10.0,
            _ => 5.0,
        };
        let thermal = match caps.thermal {
            ThermalState::Nominal => 10.0,
            ThermalState::Fair => 5.0,
            ThermalState::Serious => -5.0,
            ThermalState::Critical => -20.0,
        };
        cores + ram + reputation + latency + thermal
    }

    fn spawn_watchdog(self: &Arc<Self>, task_id: TaskId) -> JoinHandle<()> {
        let dispatch = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(dispatch.task_timeout).await;
            if dispatch.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let still_active = dispatch.task_state(&task_id).await == Some(TaskState::Active);
            if still_active {
                warn!(task_id = %task_id, "⏰ Task watchdog fired");
                dispatch.report_failure(task_id, "timeout").await;
            }
        })
    }

    /// Inbound assignment on the executor side. Returns the request when
    /// this node is the primary, so the engine can consult the decision
    /// helper before calling `accept`.
    pub async fn handle_announce(&self, from: NodeId, announce: TaskAnnounce) -> Option<TaskRequest> {
        let TaskAnnounce {
            request,
            assignment,
            is_backup,
        } = announce;

        let addressed = if is_backup {
            assignment.backups.contains(&self.local_id)
        } else {
            assignment.primary == self.local_id
        };
        if !addressed {
            debug!(task_id = %request.task_id, from = %from, "ignoring misdirected assignment");
            return None;
        }
        if assignment.backups.contains(&assignment.primary) {
            warn!(task_id = %request.task_id, "rejecting assignment with primary among backups");
            return None;
        }

        let task_id = request.task_id;
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task_id) {
            Some(existing) => {
                // Re-announcement after a promotion; roles may flip.
                existing.role = TaskRole::Executor { backup: is_backup };
                existing.assignment = Some(assignment);
            }
            None => {
                tasks.insert(
                    task_id,
                    ActiveTask {
                        request: request.clone(),
                        assignment: Some(assignment),
                        state: TaskState::Pending,
                        role: TaskRole::Executor { backup: is_backup },
                        result: None,
                        watchdog: None,
                    },
                );
            }
        }
        drop(tasks);

        self.events.emit(MeshEvent::TaskReceived { task_id, is_backup });
        if is_backup {
            None
        } else {
            Some(request)
        }
    }

    /// Accept an assignment (post decision-helper approval) and execute.
    pub async fn accept(self: &Arc<Self>, task_id: TaskId) -> Result<()> {
        let request = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(&task_id).ok_or(MeshError::UnknownTask(task_id))?;
            if !matches!(task.role, TaskRole::Executor { backup: false }) {
                return Err(MeshError::InvalidMessage(
                    "accept on a task not assigned to this node".to_string(),
                ));
            }
            if !task.state.can_transition_to(TaskState::Active) {
                return Err(MeshError::InvalidMessage(format!(
                    "accept in state {:?}",
                    task.state
                )));
            }
            task.state = TaskState::Active;
            task.request.clone()
        };

        self.events.emit(MeshEvent::TaskAccepted { task_id });
        self.respond(
            request.submitter,
            TaskResponsePayload::Accept { task_id },
        )
        .await;

        let dispatch = Arc::clone(self);
        tokio::spawn(async move {
            dispatch.run_execution(request).await;
        });
        Ok(())
    }

    /// Reject an assignment the decision helper turned down.
    pub async fn reject(&self, task_id: TaskId, reason: &str) {
        let submitter = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            if task.state.can_transition_to(TaskState::Cancelled) {
                task.state = TaskState::Cancelled;
            }
            task.request.submitter
        };
        self.respond(
            submitter,
            TaskResponsePayload::Reject {
                task_id,
                reason: reason.to_string(),
            },
        )
        .await;
    }

    async fn run_execution(self: &Arc<Self>, request: TaskRequest) {
        let task_id = request.task_id;
        let started = Instant::now();

        let cancelled = {
            let dispatch = Arc::clone(self);
            async move {
                loop {
                    tokio::time::sleep(CANCEL_POLL).await;
                    let state = dispatch.task_state(&task_id).await;
                    if state != Some(TaskState::Active) {
                        break;
                    }
                }
            }
        };

        let outcome = tokio::select! {
            outcome = self.executor.execute(&request) => Some(outcome),
            _ = cancelled => None,
        };

        match outcome {
            None => {
                // State left Active during execution; the handler future was
                // dropped and nothing more is owed.
                debug!(task_id = %task_id, "execution aborted by state change");
            }
            Some(Err(e)) => {
                warn!(task_id = %task_id, error = %e, "execution failed");
                self.fail_local_execution(task_id, &e.to_string()).await;
            }
            Some(Ok((output, usage))) => {
                let mut result = TaskResult {
                    task_id,
                    output,
                    completed_by: self.local_id,
                    completed_at_ms: now_ms(),
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    usage,
                    signature: None,
                };
                if let Ok(signable) = result.signable() {
                    result.signature = Some(self.keypair.sign(&signable));
                }
                self.submit_result(task_id, result).await;
            }
        }
    }

    /// Record a finished execution and return the result to the submitter.
    pub async fn submit_result(&self, task_id: TaskId, result: TaskResult) {
        let submitter = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            if !task.state.can_transition_to(TaskState::Completed) {
                return;
            }
            task.state = TaskState::Completed;
            task.result = Some(result.clone());
            task.request.submitter
        };

        let payload = TaskResultPayload {
            task_id,
            result: Some(result),
            error: None,
        };
        if let Ok(bytes) = encode_payload(&payload) {
            if let Err(e) = self.peer.send(submitter, FrameKind::TaskResult, bytes).await {
                warn!(task_id = %task_id, error = %e, "result send failed");
            }
        }
        self.events.emit(MeshEvent::TaskCompleted { task_id });
        info!(task_id = %task_id, "✅ Task completed locally");
    }

    async fn fail_local_execution(&self, task_id: TaskId, reason: &str) {
        let submitter = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            if task.state.can_transition_to(TaskState::Failed) {
                task.state = TaskState::Failed;
            }
            task.request.submitter
        };
        self.respond(
            submitter,
            TaskResponsePayload::Failure {
                task_id,
                reason: reason.to_string(),
            },
        )
        .await;
    }

    async fn respond(&self, to: NodeId, payload: TaskResponsePayload) {
        if let Ok(bytes) = encode_payload(&payload) {
            if let Err(e) = self.peer.send(to, FrameKind::TaskResponse, bytes).await {
                debug!(to = %to, error = %e, "task response send failed");
            }
        }
    }

    /// Submitter-side handling of executor responses.
    pub async fn handle_response(self: &Arc<Self>, from: NodeId, payload: TaskResponsePayload) {
        match payload {
            TaskResponsePayload::Accept { task_id } => {
                debug!(task_id = %task_id, executor = %from, "assignment accepted");
            }
            TaskResponsePayload::Reject { task_id, reason }
            | TaskResponsePayload::Failure { task_id, reason } => {
                let from_primary = self
                    .assignment(&task_id)
                    .await
                    .map(|a| a.primary == from)
                    .unwrap_or(false);
                if from_primary {
                    self.report_failure(task_id, &reason).await;
                } else {
                    debug!(task_id = %task_id, from = %from, "ignoring failure from non-primary");
                }
            }
        }
    }

    /// Submitter-side handling of the returned result. Gives the caller the
    /// request/result pair so verification can be kicked off.
    pub async fn handle_result(
        self: &Arc<Self>,
        from: NodeId,
        payload: TaskResultPayload,
    ) -> Option<(TaskRequest, TaskResult)> {
        let task_id = payload.task_id;
        if let Some(error) = payload.error {
            self.report_failure(task_id, &error).await;
            return None;
        }
        let result = payload.result?;
        if result.completed_by != from {
            warn!(task_id = %task_id, from = %from, "result sender does not match executor");
            return None;
        }

        let request = {
            let mut tasks = self.tasks.write().await;
            let task = tasks.get_mut(&task_id)?;
            if task.role != TaskRole::Submitter {
                return None;
            }
            if !task.state.can_transition_to(TaskState::Completed) {
                debug!(task_id = %task_id, state = ?task.state, "late result ignored");
                return None;
            }
            task.state = TaskState::Completed;
            task.result = Some(result.clone());
            if let Some(watchdog) = task.watchdog.take() {
                watchdog.abort();
            }
            task.request.clone()
        };

        self.events.emit(MeshEvent::TaskCompleted { task_id });
        info!(task_id = %task_id, executor = %result.completed_by, "✅ Task result received");
        Some((request, result))
    }

    /// Promote the next backup or fail the task terminally.
    pub async fn report_failure(self: &Arc<Self>, task_id: TaskId, reason: &str) {
        let promoted = {
            let mut tasks = self.tasks.write().await;
            let Some(task) = tasks.get_mut(&task_id) else {
                return;
            };
            if task.state.is_terminal() {
                return;
            }
            let deadline = now_ms() + self.task_timeout.as_millis() as i64;
            match task.assignment.as_mut() {
                Some(assignment) => {
                    if assignment.promote_backup(now_ms(), deadline) {
                        Some((task.request.clone(), assignment.clone()))
                    } else {
                        task.state = TaskState::Failed;
                        if let Some(watchdog) = task.watchdog.take() {
                            watchdog.abort();
                        }
                        None
                    }
                }
                None => {
                    task.state = TaskState::Failed;
                    if let Some(watchdog) = task.watchdog.take() {
                        watchdog.abort();
                    }
                    None
                }
            }
        };

        match promoted {
            Some((request, assignment)) => {
                info!(
                    task_id = %task_id,
                    new_primary = %assignment.primary,
                    reason = reason,
                    "🔁 Promoting backup"
                );
                self.announce(&request, &assignment).await;
                // The new assignee gets a live completion timer of its own.
                let watchdog = self.spawn_watchdog(task_id);
                let mut tasks = self.tasks.write().await;
                if let Some(task) = tasks.get_mut(&task_id) {
                    if let Some(old) = task.watchdog.replace(watchdog) {
                        old.abort();
                    }
                }
            }
            None => {
                warn!(task_id = %task_id, reason = reason, "❌ Task failed");
                self.events.emit(MeshEvent::TaskFailed {
                    task_id,
                    reason: reason.to_string(),
                });
            }
        }
    }

    /// Abort every non-terminal task. Called at shutdown.
    pub async fn cancel_all(&self) {
        let mut tasks = self.tasks.write().await;
        for task in tasks.values_mut() {
            if !task.state.is_terminal() {
                task.state = TaskState::Cancelled;
            }
            if let Some(watchdog) = task.watchdog.take() {
                watchdog.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{ComputeTier, TaskPriority};

    fn caps(cores: u32, ram: u32, thermal: ThermalState) -> CapabilitySnapshot {
        CapabilitySnapshot {
            tier: ComputeTier::Medium,
            cpu_cores: cores,
            ram_gb: ram,
            storage_gb: 64,
            gpu_available: false,
            bandwidth_mbps: 25.0,
            battery_pct: None,
            thermal,
        }
    }

    fn requirements() -> TaskRequirements {
        TaskRequirements {
            cpu_cores: 2,
            memory_gb: 4,
            gpu_required: false,
            estimated_duration_ms: 1_000,
            priority: TaskPriority::Medium,
        }
    }

    #[test]
    fn test_eligibility_filter() {
        let req = requirements();
        assert!(TaskDispatch::eligible(
            &caps(4, 8, ThermalState::Nominal),
            &req,
            0.6
        ));
        // Insufficient cores.
        assert!(!TaskDispatch::eligible(
            &caps(1, 8, ThermalState::Nominal),
            &req,
            0.6
        ));
        // Critical thermal state.
        assert!(!TaskDispatch::eligible(
            &caps(4, 8, ThermalState::Critical),
            &req,
            0.6
        ));
        // Reputation below the floor.
        assert!(!TaskDispatch::eligible(
            &caps(4, 8, ThermalState::Nominal),
            &req,
            0.49
        ));
    }

    #[test]
    fn test_score_caps_resource_ratios() {
        let req = requirements();
        let modest = TaskDispatch::candidate_score(
            &caps(4, 8, ThermalState::Nominal),
            &req,
            0.5,
            Some(50),
        );
        // 2x cores/ram both hit the cap already; more hardware is not more
        // score.
        let huge = TaskDispatch::candidate_score(
            &caps(64, 512, ThermalState::Nominal),
            &req,
            0.5,
            Some(50),
        );
        assert_eq!(modest, huge);
        // 60 + 50 + 10 + 15 + 10
        assert!((modest - 145.0).abs() < 1e-9);
    }

    #[test]
    fn test_score_latency_and_thermal_bands() {
        let req = requirements();
        let fast = TaskDispatch::candidate_score(
            &caps(2, 4, ThermalState::Nominal),
            &req,
            0.5,
            Some(10),
        );
        let medium = TaskDispatch::candidate_score(
            &caps(2, 4, ThermalState::Nominal),
            &req,
            0.5,
            Some(150),
        );
        let unknown =
            TaskDispatch::candidate_score(&caps(2, 4, ThermalState::Nominal), &req, 0.5, None);
        assert!(fast > medium && medium > unknown);

        let serious = TaskDispatch::candidate_score(
            &caps(2, 4, ThermalState::Serious),
            &req,
            0.5,
            Some(10),
        );
        assert!((fast - serious - 15.0).abs() < 1e-9);
    }
}
