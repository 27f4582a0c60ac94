pub mod canonical;
pub mod capability;
pub mod error;
pub mod frame;
pub mod id;
pub mod keys;
pub mod task;
pub mod verification;

pub use capability::{CapabilitySnapshot, ComputeTier, ThermalState};
pub use error::{MeshError, Result};
pub use frame::{
    AlertSeverity, DhtNodeInfo, DiscoveryMethod, DiscoveryPayload, Frame, FrameKind,
    PeerAdvertisement, PeerSummary, PingPayload, PongPayload, TaskAnnounce, TaskResponsePayload,
    TaskResultPayload, VerificationPayload,
};
pub use id::{Distance, NodeId, TaskId, VerificationId};
pub use keys::{PublicKey, Signature};
pub use task::{
    ResourceUsage, TaskAssignment, TaskPriority, TaskRequest, TaskRequirements, TaskResult,
    TaskState, TaskType,
};
pub use verification::{
    ConsensusDecision, ReputationScore, VerificationChecks, VerificationOutcome,
    VerificationRequest, VerificationResponse,
};
