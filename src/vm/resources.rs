//! Memory/CPU budget for the managed VM.
//!
//! Memory is a quarter of host RAM in whole GiB, CPUs half the host cores,
//! both clamped to `[1, 4]`. The result never exceeds the host and the same
//! input always yields the same budget.

use serde::{Deserialize, Serialize};

use super::capability::HostCapabilities;

/// Resources handed to the VM for one start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmResourceBudget {
    pub memory_mb: u64,
    pub cpu_count: u32,
}

/// Allocation constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePolicy {
    pub memory_fraction: f64,
    pub min_memory_gib: u64,
    pub max_memory_gib: u64,
    pub min_cpus: u32,
    pub max_cpus: u32,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            memory_fraction: 0.25,
            min_memory_gib: 1,
            max_memory_gib: 4,
            min_cpus: 1,
            max_cpus: 4,
        }
    }
}

/// Compute the budget for `caps` under `policy`.
pub fn allocate(caps: &HostCapabilities, policy: &ResourcePolicy) -> VmResourceBudget {
    let total_gib = caps.total_memory_gib();
    let memory_gib = ((total_gib * policy.memory_fraction).floor() as u64)
        .clamp(policy.min_memory_gib, policy.max_memory_gib);

    let cpu_count = ((caps.cpu_core_count / 2) as u32).clamp(policy.min_cpus, policy.max_cpus);

    VmResourceBudget {
        memory_mb: memory_gib * 1024,
        cpu_count,
    }
}
