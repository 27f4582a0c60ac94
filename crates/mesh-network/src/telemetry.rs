//! Seam to the on-device telemetry source.
//!
//! The engine never fabricates capability values; everything comes from an
//! injected implementation of this trait.

use async_trait::async_trait;
use mesh_types::{CapabilitySnapshot, MeshError, Result};
use tokio::sync::RwLock;

#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Current capability snapshot of the local device. Fails with
    /// `TelemetryUnavailable` while the source is not ready.
    async fn capabilities(&self) -> Result<CapabilitySnapshot>;
}

/// Fixed-snapshot source for tests and single-host deployments.
pub struct StaticTelemetry {
    snapshot: RwLock<Option<CapabilitySnapshot>>,
}

impl StaticTelemetry {
    pub fn new(snapshot: CapabilitySnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Some(snapshot)),
        }
    }

    /// A source that is never ready; useful for exercising the
    /// `TelemetryUnavailable` path.
    pub fn unavailable() -> Self {
        Self {
            snapshot: RwLock::new(None),
        }
    }

    pub async fn set(&self, snapshot: CapabilitySnapshot) {
        *self.snapshot.write().await = Some(snapshot);
    }
}

#[async_trait]
impl TelemetrySource for StaticTelemetry {
    async fn capabilities(&self) -> Result<CapabilitySnapshot> {
        self.snapshot
            .read()
            .await
            .clone()
            .ok_or(MeshError::TelemetryUnavailable)
    }
}
