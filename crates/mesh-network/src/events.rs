//! Typed event bus.
//!
//! Every externally visible state change is a variant of [`MeshEvent`];
//! subscribers match on the tag. There is no string-keyed dispatch.

use mesh_types::{AlertSeverity, ConsensusDecision, NodeId, TaskId, VerificationId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MeshEvent {
    Initialized {
        node_id: NodeId,
    },
    PeerConnected {
        peer: NodeId,
    },
    PeerDisconnected {
        peer: NodeId,
    },
    PeersDiscovered {
        peers: Vec<NodeId>,
    },
    TaskSubmitted {
        task_id: TaskId,
    },
    TaskReceived {
        task_id: TaskId,
        is_backup: bool,
    },
    TaskAccepted {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
    },
    VerificationRequested {
        verification_id: VerificationId,
        task_id: TaskId,
    },
    VerificationFinalized {
        verification_id: VerificationId,
        task_id: TaskId,
        decision: ConsensusDecision,
    },
    HealthUpdated {
        overall: f64,
    },
    PartitionDetected {
        partition_id: u64,
        affected: Vec<NodeId>,
    },
    PartitionHealed {
        partition_id: u64,
    },
    SecurityAlertReceived {
        malicious_peer: NodeId,
        severity: AlertSeverity,
    },
    NetworkReset,
    Shutdown,
}

/// Broadcast bus shared by all subsystems. Slow subscribers lose the
/// oldest events rather than blocking producers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: MeshEvent) {
        // A send error only means nobody is subscribed right now.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
