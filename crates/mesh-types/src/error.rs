use crate::{NodeId, TaskId, VerificationId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Connect attempts exhausted for peer {0}")]
    ConnectAttemptsExhausted(NodeId),

    #[error("Query timed out")]
    QueryTimeout,

    #[error("No suitable candidates for task requirements")]
    NoSuitableCandidates,

    #[error("Task {0} timed out")]
    TaskTimeout(TaskId),

    #[error("Verification {0} received too few responses")]
    VerificationInsufficient(VerificationId),

    #[error("Signature verification failed")]
    SignatureInvalid,

    #[error("Circuit breaker open for service {0}")]
    CircuitBreakerOpen(&'static str),

    #[error("Telemetry source unavailable")]
    TelemetryUnavailable,

    #[error("Unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("Unknown task {0}")]
    UnknownTask(TaskId),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<crate::canonical::CanonicalError> for MeshError {
    fn from(e: crate::canonical::CanonicalError) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
