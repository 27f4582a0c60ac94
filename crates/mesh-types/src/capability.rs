use crate::task::TaskRequirements;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeTier {
    Low,
    Medium,
    High,
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// A device capability snapshot. Immutable once taken; refreshed whole on
/// each advertisement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySnapshot {
    pub tier: ComputeTier,
    pub cpu_cores: u32,
    pub ram_gb: u32,
    pub storage_gb: u32,
    pub gpu_available: bool,
    pub bandwidth_mbps: f64,
    pub battery_pct: Option<u8>,
    pub thermal: ThermalState,
}

impl CapabilitySnapshot {
    /// Conservative requirement check: cores, ram and the gpu flag must all
    /// be satisfied. Thermal and reputation gating happens at the selection
    /// layer, which has more context.
    pub fn satisfies(&self, req: &TaskRequirements) -> bool {
        self.cpu_cores >= req.cpu_cores
            && self.ram_gb >= req.memory_gb
            && (!req.gpu_required || self.gpu_available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskPriority;

    fn snapshot(cores: u32, ram: u32, gpu: bool) -> CapabilitySnapshot {
        CapabilitySnapshot {
            tier: ComputeTier::Medium,
            cpu_cores: cores,
            ram_gb: ram,
            storage_gb: 64,
            gpu_available: gpu,
            bandwidth_mbps: 50.0,
            battery_pct: Some(80),
            thermal: ThermalState::Nominal,
        }
    }

    fn requirements(cores: u32, ram: u32, gpu: bool) -> TaskRequirements {
        TaskRequirements {
            cpu_cores: cores,
            memory_gb: ram,
            gpu_required: gpu,
            estimated_duration_ms: 1_000,
            priority: TaskPriority::Medium,
        }
    }

    #[test]
    fn test_satisfies() {
        assert!(snapshot(4, 8, false).satisfies(&requirements(2, 4, false)));
        assert!(!snapshot(1, 8, false).satisfies(&requirements(2, 4, false)));
        assert!(!snapshot(4, 2, false).satisfies(&requirements(2, 4, false)));
        assert!(!snapshot(4, 8, false).satisfies(&requirements(2, 4, true)));
        assert!(snapshot(4, 8, true).satisfies(&requirements(2, 4, true)));
    }
}
