use crate::canonical::canonical_sha256;
use crate::{NodeId, Signature, TaskId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Compute,
    Storage,
    Network,
    AiInference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequirements {
    pub cpu_cores: u32,
    pub memory_gb: u32,
    pub gpu_required: bool,
    pub estimated_duration_ms: u64,
    pub priority: TaskPriority,
}

impl TaskRequirements {
    /// DHT routing target for this requirement profile: the first 20 bytes
    /// of the SHA-256 over the canonical encoding.
    pub fn routing_target(&self) -> crate::Result<NodeId> {
        let digest = canonical_sha256(self)?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&digest[..20]);
        Ok(NodeId::from_bytes(arr))
    }
}

/// A submitted unit of work. Never mutated after signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub payload: Vec<u8>,
    pub requirements: TaskRequirements,
    pub reward: f64,
    pub deadline_ms: i64,
    pub submitter: NodeId,
    pub created_at_ms: i64,
    pub signature: Option<Signature>,
}

impl TaskRequest {
    /// Bytes covered by the submitter signature (everything but the
    /// signature itself).
    pub fn signable(&self) -> crate::Result<Vec<u8>> {
        let unsigned = TaskRequest {
            signature: None,
            ..self.clone()
        };
        Ok(crate::canonical::to_canonical_json(&unsigned)?.into_bytes())
    }
}

/// Replicated assignment: one primary, ordered backups promoted in order on
/// primary failure. Primary is never a member of `backups`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub primary: NodeId,
    pub assigned_at_ms: i64,
    pub expected_completion_ms: i64,
    pub backups: Vec<NodeId>,
}

impl TaskAssignment {
    /// Promote the head backup to primary. Returns false when no backups
    /// remain.
    pub fn promote_backup(&mut self, now_ms: i64, expected_completion_ms: i64) -> bool {
        if self.backups.is_empty() {
            return false;
        }
        self.primary = self.backups.remove(0);
        self.assigned_at_ms = now_ms;
        self.expected_completion_ms = expected_completion_ms;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub network_kb: f64,
}

impl ResourceUsage {
    pub fn is_plausible(&self) -> bool {
        (0.0..=100.0).contains(&self.cpu_pct)
            && (0.0..=100.0).contains(&self.memory_pct)
            && self.network_kb >= 0.0
    }
}

/// Immutable once submitted by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub output: Vec<u8>,
    pub completed_by: NodeId,
    pub completed_at_ms: i64,
    pub execution_time_ms: u64,
    pub usage: ResourceUsage,
    pub signature: Option<Signature>,
}

impl TaskResult {
    pub fn signable(&self) -> crate::Result<Vec<u8>> {
        let unsigned = TaskResult {
            signature: None,
            ..self.clone()
        };
        Ok(crate::canonical::to_canonical_json(&unsigned)?.into_bytes())
    }

    /// SHA-256 over the canonical encoding of the output payload.
    pub fn output_hash(&self) -> crate::Result<[u8; 32]> {
        Ok(canonical_sha256(&self.output)?)
    }
}

/// Per-task lifecycle. Exactly one terminal transition per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Active) => true,
            (Self::Pending, Self::Failed | Self::Cancelled) => true,
            (Self::Active, Self::Active) => true, // reassignment to a backup
            (Self::Active, Self::Completed | Self::Failed | Self::Cancelled) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requirements() -> TaskRequirements {
        TaskRequirements {
            cpu_cores: 2,
            memory_gb: 4,
            gpu_required: false,
            estimated_duration_ms: 60_000,
            priority: TaskPriority::High,
        }
    }

    #[test]
    fn test_routing_target_deterministic() {
        let a = requirements().routing_target().unwrap();
        let b = requirements().routing_target().unwrap();
        assert_eq!(a, b);

        let mut other = requirements();
        other.cpu_cores = 3;
        assert_ne!(a, other.routing_target().unwrap());
    }

    #[test]
    fn test_assignment_promotion() {
        let primary = NodeId::random();
        let b1 = NodeId::random();
        let b2 = NodeId::random();
        let mut assignment = TaskAssignment {
            task_id: TaskId::random(),
            primary,
            assigned_at_ms: 0,
            expected_completion_ms: 1,
            backups: vec![b1, b2],
        };

        assert!(assignment.promote_backup(10, 20));
        assert_eq!(assignment.primary, b1);
        assert_eq!(assignment.backups, vec![b2]);
        assert!(!assignment.backups.contains(&assignment.primary));

        assert!(assignment.promote_backup(30, 40));
        assert!(!assignment.promote_backup(50, 60));
    }

    #[test]
    fn test_state_machine() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Active));
        assert!(TaskState::Active.can_transition_to(TaskState::Completed));
        assert!(TaskState::Active.can_transition_to(TaskState::Active));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Failed));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Active));
        assert!(TaskState::Completed.is_terminal());
    }

    #[test]
    fn test_usage_plausibility() {
        let good = ResourceUsage {
            cpu_pct: 55.0,
            memory_pct: 20.0,
            network_kb: 128.0,
        };
        assert!(good.is_plausible());
        assert!(!ResourceUsage {
            cpu_pct: 120.0,
            ..good
        }
        .is_plausible());
        assert!(!ResourceUsage {
            network_kb: -1.0,
            ..good
        }
        .is_plausible());
    }
}
