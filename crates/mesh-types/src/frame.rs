//! Wire frames.
//!
//! Every byte sequence exchanged between peers is the canonical JSON
//! encoding of a [`Frame`]. The `kind` tag selects the subsystem that
//! consumes the payload; the payload itself is the kind-specific canonical
//! encoding defined by the enums below.

use crate::capability::CapabilitySnapshot;
use crate::task::{TaskAssignment, TaskRequest, TaskResult};
use crate::verification::{VerificationRequest, VerificationResponse};
use crate::{MeshError, NodeId, PublicKey, Result, Signature, TaskId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Ping,
    Pong,
    TaskRequest,
    TaskResponse,
    TaskResult,
    PeerDiscovery,
    VerificationRequest,
}

/// The envelope shared by all upper layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub frame_id: u64,
    pub kind: FrameKind,
    pub from: NodeId,
    pub to: NodeId,
    pub timestamp_ms: i64,
    pub payload: Vec<u8>,
    pub signature: Option<Signature>,
}

impl Frame {
    /// Bytes covered by the frame signature:
    /// `(kind, from, to, timestamp, payload)` in canonical encoding.
    pub fn signable_bytes(&self) -> Result<Vec<u8>> {
        #[derive(Serialize)]
        struct Signable<'a> {
            kind: FrameKind,
            from: &'a NodeId,
            to: &'a NodeId,
            timestamp_ms: i64,
            payload: &'a [u8],
        }
        let signable = Signable {
            kind: self.kind,
            from: &self.from,
            to: &self.to,
            timestamp_ms: self.timestamp_ms,
            payload: &self.payload,
        };
        Ok(crate::canonical::to_canonical_json(&signable)?.into_bytes())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(crate::canonical::to_canonical_json(self)?.into_bytes())
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        serde_json::from_slice(bytes).map_err(|e| MeshError::InvalidMessage(e.to_string()))
    }
}

/// Canonical-encode a kind-specific payload.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(crate::canonical::to_canonical_json(value)?.into_bytes())
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| MeshError::InvalidMessage(e.to_string()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PingPayload {
    pub nonce: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PongPayload {
    pub nonce: u64,
    /// Timestamp of the originating Ping, echoed back for latency
    /// measurement.
    pub echo_timestamp_ms: i64,
}

/// Assignment announcement sent to the primary and each backup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAnnounce {
    pub request: TaskRequest,
    pub assignment: TaskAssignment,
    pub is_backup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskResponsePayload {
    Accept { task_id: TaskId },
    Reject { task_id: TaskId, reason: String },
    Failure { task_id: TaskId, reason: String },
}

/// The single result frame a submitter receives per task. `error` is set
/// instead of `result` when the task reached a failed terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResultPayload {
    pub task_id: TaskId,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Dht,
    PeerExchange,
    Bootstrap,
    Relay,
    Mdns,
}

/// Wire form of a routing-table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtNodeInfo {
    pub node_id: NodeId,
    pub capabilities: CapabilitySnapshot,
    pub reputation: f64,
    pub last_seen_ms: i64,
}

/// Wire form of a peer catalog entry, served by directory queries. The
/// public key may be absent when the serving node has not yet seen an
/// advertisement from the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    pub node_id: NodeId,
    pub public_key: Option<PublicKey>,
    pub capabilities: CapabilitySnapshot,
    pub reputation: f64,
    pub latency_ms: Option<u64>,
    pub last_seen_ms: i64,
}

/// Self-advertisement broadcast on each discovery period. TTL bounds how
/// long receivers may serve it from their catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerAdvertisement {
    pub node_id: NodeId,
    pub public_key: PublicKey,
    pub capabilities: CapabilitySnapshot,
    pub endpoints: Vec<String>,
    pub methods: Vec<DiscoveryMethod>,
    pub timestamp_ms: i64,
    pub ttl_ms: u64,
    pub signature: Option<Signature>,
}

impl PeerAdvertisement {
    pub fn signable(&self) -> Result<Vec<u8>> {
        let unsigned = PeerAdvertisement {
            signature: None,
            ..self.clone()
        };
        Ok(crate::canonical::to_canonical_json(&unsigned)?.into_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Payloads recognized by peer discovery and routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryPayload {
    FindNode {
        target: NodeId,
        request_id: u64,
    },
    FindNodeResp {
        request_id: u64,
        nodes: Vec<DhtNodeInfo>,
    },
    NeighborRequest {
        request_id: u64,
    },
    NeighborResponse {
        request_id: u64,
        peers: Vec<PeerSummary>,
    },
    PeerListRequest {
        request_id: u64,
    },
    PeerListResponse {
        request_id: u64,
        peers: Vec<PeerSummary>,
    },
    PathQuery {
        destination: NodeId,
        request_id: u64,
    },
    PathResponse {
        request_id: u64,
        has_path: bool,
    },
    Advertisement {
        advertisement: PeerAdvertisement,
    },
    SecurityAlert {
        malicious_peer: NodeId,
        severity: AlertSeverity,
        timestamp_ms: i64,
    },
    PartitionHealing {
        affected_peers: Vec<NodeId>,
        request_id: u64,
    },
    PartitionHealingResponse {
        request_id: u64,
        peers: Vec<PeerSummary>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerificationPayload {
    Request(VerificationRequest),
    Response(VerificationResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> Frame {
        Frame {
            frame_id: 7,
            kind: FrameKind::Ping,
            from: NodeId::from_bytes([1; 20]),
            to: NodeId::from_bytes([2; 20]),
            timestamp_ms: 1_700_000_000_000,
            payload: encode_payload(&PingPayload { nonce: 42 }).unwrap(),
            signature: None,
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let f = frame();
        let bytes = f.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.frame_id, 7);
        assert_eq!(decoded.kind, FrameKind::Ping);
        let ping: PingPayload = decode_payload(&decoded.payload).unwrap();
        assert_eq!(ping.nonce, 42);
    }

    #[test]
    fn test_signable_bytes_exclude_frame_id_and_signature() {
        let mut a = frame();
        let mut b = frame();
        b.frame_id = 9;
        b.signature = Some(Signature::new(vec![0; 64]));
        assert_eq!(a.signable_bytes().unwrap(), b.signable_bytes().unwrap());

        a.timestamp_ms += 1;
        assert_ne!(a.signable_bytes().unwrap(), b.signable_bytes().unwrap());
    }

    #[test]
    fn test_discovery_payload_tagging() {
        let payload = DiscoveryPayload::FindNode {
            target: NodeId::from_bytes([3; 20]),
            request_id: 11,
        };
        let bytes = encode_payload(&payload).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains(r#""type":"find_node""#));

        match decode_payload(&bytes).unwrap() {
            DiscoveryPayload::FindNode { request_id, .. } => assert_eq!(request_id, 11),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame_rejected() {
        assert!(Frame::decode(b"{not json").is_err());
    }
}
