//! Transport seam.
//!
//! The fabric treats the transport as an external primitive: something that
//! can open a bidirectional, ordered, frame-level channel to a peer known
//! by node id. NAT traversal, encryption and congestion control all live on
//! the other side of this trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use mesh_types::{Frame, MeshError, NodeId, Result};

/// Frames buffered per direction before sends start failing. Sends never
/// block: a full channel is a send failure at the peer-manager layer.
pub const CHANNEL_CAPACITY: usize = 256;

/// One open link to a remote peer. Frame ordering is preserved per
/// channel; nothing is guaranteed across channels.
pub struct TransportChannel {
    pub sender: mpsc::Sender<Frame>,
    pub receiver: mpsc::Receiver<Frame>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a channel to `remote`. Fails when the remote is unreachable.
    async fn dial(&self, remote: NodeId) -> Result<TransportChannel>;

    /// Wait for the next inbound channel. `None` once the transport is
    /// closed.
    async fn accept(&self) -> Option<(NodeId, TransportChannel)>;
}

type AcceptQueue = mpsc::UnboundedSender<(NodeId, TransportChannel)>;

/// In-process hub wiring paired channels between registered nodes. Serves
/// as the loopback transport and as the fixture for every multi-node test.
#[derive(Default)]
pub struct MemoryHub {
    nodes: Mutex<HashMap<NodeId, AcceptQueue>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `local` on the hub and get its transport endpoint.
    pub async fn attach(self: &Arc<Self>, local: NodeId) -> MemoryTransport {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        self.nodes.lock().await.insert(local, accept_tx);
        MemoryTransport {
            hub: Arc::clone(self),
            local,
            accept_rx: Mutex::new(accept_rx),
        }
    }

    /// Drop a node from the hub; subsequent dials to it fail.
    pub async fn detach(&self, node: &NodeId) {
        self.nodes.lock().await.remove(node);
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local: NodeId,
    accept_rx: Mutex<mpsc::UnboundedReceiver<(NodeId, TransportChannel)>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn dial(&self, remote: NodeId) -> Result<TransportChannel> {
        if remote == self.local {
            return Err(MeshError::TransportUnavailable(
                "refusing to dial self".to_string(),
            ));
        }

        let nodes = self.hub.nodes.lock().await;
        let accept = nodes
            .get(&remote)
            .ok_or_else(|| MeshError::TransportUnavailable(format!("{} unreachable", remote)))?;

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let remote_side = TransportChannel {
            sender: in_tx,
            receiver: out_rx,
        };
        accept
            .send((self.local, remote_side))
            .map_err(|_| MeshError::TransportUnavailable(format!("{} gone", remote)))?;

        debug!(local = %self.local, remote = %remote, "memory channel opened");
        Ok(TransportChannel {
            sender: out_tx,
            receiver: in_rx,
        })
    }

    async fn accept(&self) -> Option<(NodeId, TransportChannel)> {
        self.accept_rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{frame::encode_payload, FrameKind, PingPayload};

    fn ping_frame(from: NodeId, to: NodeId) -> Frame {
        Frame {
            frame_id: 1,
            kind: FrameKind::Ping,
            from,
            to,
            timestamp_ms: 0,
            payload: encode_payload(&PingPayload { nonce: 5 }).unwrap(),
            signature: None,
        }
    }

    #[tokio::test]
    async fn test_dial_and_accept() {
        let hub = MemoryHub::new();
        let a = NodeId::random();
        let b = NodeId::random();
        let ta = hub.attach(a).await;
        let tb = hub.attach(b).await;

        let mut chan_a = ta.dial(b).await.unwrap();
        let (from, mut chan_b) = tb.accept().await.unwrap();
        assert_eq!(from, a);

        chan_a.sender.send(ping_frame(a, b)).await.unwrap();
        let got = chan_b.receiver.recv().await.unwrap();
        assert_eq!(got.kind, FrameKind::Ping);

        chan_b.sender.send(ping_frame(b, a)).await.unwrap();
        assert!(chan_a.receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_dial_unknown_fails() {
        let hub = MemoryHub::new();
        let a = NodeId::random();
        let ta = hub.attach(a).await;

        assert!(matches!(
            ta.dial(NodeId::random()).await,
            Err(MeshError::TransportUnavailable(_))
        ));
        assert!(matches!(
            ta.dial(a).await,
            Err(MeshError::TransportUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_detach_makes_unreachable() {
        let hub = MemoryHub::new();
        let a = NodeId::random();
        let b = NodeId::random();
        let ta = hub.attach(a).await;
        let _tb = hub.attach(b).await;

        hub.detach(&b).await;
        assert!(ta.dial(b).await.is_err());
    }
}
