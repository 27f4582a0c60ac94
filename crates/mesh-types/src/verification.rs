use crate::{NodeId, Signature, TaskId, TaskResult, VerificationId};
use serde::{Deserialize, Serialize};

/// Broadcast to selected verifiers by the node requesting attestation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub verification_id: VerificationId,
    pub task_id: TaskId,
    pub result: TaskResult,
    pub submitter: NodeId,
    pub created_at_ms: i64,
    pub required_verifiers: usize,
    pub deadline_ms: i64,
    pub signature: Option<Signature>,
}

impl VerificationRequest {
    pub fn signable(&self) -> crate::Result<Vec<u8>> {
        let unsigned = VerificationRequest {
            signature: None,
            ..self.clone()
        };
        Ok(crate::canonical::to_canonical_json(&unsigned)?.into_bytes())
    }
}

/// The individual sub-checks a verifier performs over a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationChecks {
    pub result_hash: Vec<u8>,
    pub execution_time_valid: bool,
    pub resource_usage_valid: bool,
    pub output_valid: bool,
}

impl VerificationChecks {
    /// Weighted confidence over the sub-checks.
    pub fn confidence(&self) -> f64 {
        let mut c = 0.0;
        if self.output_valid {
            c += 0.4;
        }
        if self.execution_time_valid {
            c += 0.2;
        }
        if self.resource_usage_valid {
            c += 0.2;
        }
        if !self.result_hash.is_empty() {
            c += 0.2;
        }
        c
    }
}

/// A signed attestation from a single verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub verification_id: VerificationId,
    pub verifier: NodeId,
    pub task_id: TaskId,
    pub is_valid: bool,
    pub confidence: f64,
    pub checks: VerificationChecks,
    pub timestamp_ms: i64,
    pub signature: Option<Signature>,
}

impl VerificationResponse {
    pub fn signable(&self) -> crate::Result<Vec<u8>> {
        let unsigned = VerificationResponse {
            signature: None,
            ..self.clone()
        };
        Ok(crate::canonical::to_canonical_json(&unsigned)?.into_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusDecision {
    Pending,
    Approved,
    Rejected,
}

/// Aggregated verifier attestations for one result. The decision moves
/// Pending → Approved|Rejected exactly once and never reverts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub verification_id: VerificationId,
    pub task_id: TaskId,
    pub decision: ConsensusDecision,
    pub expected_verifiers: usize,
    pub approvals: usize,
    pub rejections: usize,
    pub average_confidence: f64,
    pub finalized_at_ms: Option<i64>,
    pub responses: Vec<VerificationResponse>,
}

impl VerificationOutcome {
    pub fn new(
        verification_id: VerificationId,
        task_id: TaskId,
        expected_verifiers: usize,
    ) -> Self {
        Self {
            verification_id,
            task_id,
            decision: ConsensusDecision::Pending,
            expected_verifiers,
            approvals: 0,
            rejections: 0,
            average_confidence: 0.0,
            finalized_at_ms: None,
            responses: Vec::new(),
        }
    }

    pub fn total_responses(&self) -> usize {
        self.responses.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.decision != ConsensusDecision::Pending
    }
}

/// Peer-local verification track record. Initial score 0.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationScore {
    pub peer: NodeId,
    pub score: f64,
    pub total: u64,
    pub correct: u64,
    pub false_positive: u64,
    pub false_negative: u64,
    pub last_updated_ms: i64,
}

impl ReputationScore {
    pub const INITIAL: f64 = 0.5;

    pub fn new(peer: NodeId, now_ms: i64) -> Self {
        Self {
            peer,
            score: Self::INITIAL,
            total: 0,
            correct: 0,
            false_positive: 0,
            false_negative: 0,
            last_updated_ms: now_ms,
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.false_positive + self.false_negative) as f64 / self.total as f64
    }

    /// Record one attestation against the final consensus and recompute the
    /// score: clamp(accuracy − 0.5·error_rate, 0, 1).
    pub fn record(&mut self, voted_valid: bool, majority_valid: bool, now_ms: i64) {
        self.total += 1;
        if voted_valid == majority_valid {
            self.correct += 1;
        } else if voted_valid {
            self.false_positive += 1;
        } else {
            self.false_negative += 1;
        }

        let accuracy = self.correct as f64 / self.total as f64;
        self.score = (accuracy - 0.5 * self.error_rate()).clamp(0.0, 1.0);
        self.last_updated_ms = now_ms;
    }

    /// Count a protocol violation (an invalid signature) as a wrong
    /// attestation so it degrades the score through the same formula.
    pub fn penalize(&mut self, now_ms: i64) {
        self.total += 1;
        self.false_positive += 1;
        let accuracy = self.correct as f64 / self.total as f64;
        self.score = (accuracy - 0.5 * self.error_rate()).clamp(0.0, 1.0);
        self.last_updated_ms = now_ms;
    }
}
