//! Host capability probing and minimum system requirements.
//!
//! Capabilities are captured fresh on every [`CapabilityProbe::probe`] call
//! and never cached: free disk and memory change underneath a long-running
//! host application.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, Disks, System};
use tracing::debug;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Snapshot of the host resources relevant to the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    pub total_memory_bytes: u64,
    pub cpu_core_count: usize,
    /// Free space on the disk holding the VM data directory.
    pub available_disk_bytes: u64,
}

impl HostCapabilities {
    pub fn total_memory_gib(&self) -> f64 {
        self.total_memory_bytes as f64 / GIB as f64
    }
}

/// Source of [`HostCapabilities`]. Implementations never fail; a query that
/// cannot be answered reports zero.
pub trait CapabilityProbe: Send + Sync {
    fn probe(&self) -> HostCapabilities;
}

/// Probe backed by `sysinfo`.
#[derive(Debug, Clone)]
pub struct SystemProbe {
    data_dir: PathBuf,
}

impl SystemProbe {
    /// `data_dir` selects which disk's free space is reported.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }
}

impl CapabilityProbe for SystemProbe {
    fn probe(&self) -> HostCapabilities {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_list(CpuRefreshKind::nothing());
        let disks = Disks::new_with_refreshed_list();

        let mounts: Vec<(PathBuf, u64)> = disks
            .iter()
            .map(|d| (d.mount_point().to_path_buf(), d.available_space()))
            .collect();

        let caps = HostCapabilities {
            total_memory_bytes: system.total_memory(),
            cpu_core_count: system.cpus().len(),
            available_disk_bytes: free_space_for(&self.data_dir, &mounts),
        };
        debug!(
            memory_bytes = caps.total_memory_bytes,
            cpus = caps.cpu_core_count,
            disk_bytes = caps.available_disk_bytes,
            "probed host capabilities"
        );
        caps
    }
}

/// A probe that always reports the same capabilities.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub HostCapabilities);

impl CapabilityProbe for FixedProbe {
    fn probe(&self) -> HostCapabilities {
        self.0
    }
}

/// Free space of the mount whose mount point is the longest prefix of `path`.
fn free_space_for(path: &Path, mounts: &[(PathBuf, u64)]) -> u64 {
    // The data dir may not exist yet; walk up to the first existing ancestor
    // so symlinked homes resolve to their real mount.
    let resolved = path
        .ancestors()
        .find_map(|p| p.canonicalize().ok())
        .unwrap_or_else(|| path.to_path_buf());

    mounts
        .iter()
        .filter(|(mount, _)| resolved.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, free)| *free)
        .unwrap_or(0)
}

/// Minimum host resources required to run the VM at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemRequirements {
    pub min_memory_mib: u64,
    pub min_cpu_cores: usize,
    pub min_disk_gib: u64,
}

impl Default for SystemRequirements {
    fn default() -> Self {
        Self {
            min_memory_mib: 4096,
            min_cpu_cores: 2,
            min_disk_gib: 10,
        }
    }
}

impl SystemRequirements {
    pub fn min_memory_bytes(&self) -> u64 {
        self.min_memory_mib * MIB
    }

    pub fn min_disk_bytes(&self) -> u64 {
        self.min_disk_gib * GIB
    }
}

/// Outcome of comparing capabilities against requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementsReport {
    pub shortfalls: Vec<String>,
}

impl RequirementsReport {
    pub fn is_satisfied(&self) -> bool {
        self.shortfalls.is_empty()
    }
}

/// Compare `caps` against `reqs`, naming every unmet requirement.
pub fn evaluate(caps: &HostCapabilities, reqs: &SystemRequirements) -> RequirementsReport {
    let mut report = evaluate_runtime(caps, reqs);
    if caps.available_disk_bytes < reqs.min_disk_bytes() {
        report.shortfalls.push(format!(
            "free disk {:.1} GiB < {} GiB",
            caps.available_disk_bytes as f64 / GIB as f64,
            reqs.min_disk_gib
        ));
    }
    report
}

/// Memory and CPU only. The disk minimum applies before the image is
/// unpacked; an installed image may leave less free space behind.
pub fn evaluate_runtime(caps: &HostCapabilities, reqs: &SystemRequirements) -> RequirementsReport {
    let mut shortfalls = Vec::new();

    if caps.total_memory_bytes < reqs.min_memory_bytes() {
        shortfalls.push(format!(
            "memory {:.1} GiB < {:.1} GiB",
            caps.total_memory_gib(),
            reqs.min_memory_mib as f64 / 1024.0
        ));
    }
    if caps.cpu_core_count < reqs.min_cpu_cores {
        shortfalls.push(format!(
            "cpu cores {} < {}",
            caps.cpu_core_count, reqs.min_cpu_cores
        ));
    }

    RequirementsReport { shortfalls }
}

/// True when the host meets every minimum requirement.
pub fn check_system_requirements(caps: &HostCapabilities, reqs: &SystemRequirements) -> bool {
    evaluate(caps, reqs).is_satisfied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(memory_gib: f64, cores: usize, disk_gib: u64) -> HostCapabilities {
        HostCapabilities {
            total_memory_bytes: (memory_gib * GIB as f64) as u64,
            cpu_core_count: cores,
            available_disk_bytes: disk_gib * GIB,
        }
    }

    #[test]
    fn exact_minimums_are_sufficient() {
        let reqs = SystemRequirements::default();
        assert!(check_system_requirements(&caps(4.0, 2, 10), &reqs));
    }

    #[test]
    fn just_under_memory_minimum_fails() {
        let reqs = SystemRequirements::default();
        assert!(!check_system_requirements(&caps(3.9, 2, 10), &reqs));
    }

    #[test]
    fn report_names_each_shortfall() {
        let report = evaluate(&caps(2.0, 1, 5), &SystemRequirements::default());
        assert_eq!(report.shortfalls.len(), 3);
        assert!(report.shortfalls[0].starts_with("memory"));
        assert!(report.shortfalls[1].starts_with("cpu"));
        assert!(report.shortfalls[2].starts_with("free disk"));
    }

    #[test]
    fn runtime_check_ignores_free_disk() {
        let reqs = SystemRequirements::default();
        assert!(evaluate_runtime(&caps(8.0, 4, 5), &reqs).is_satisfied());
        assert!(!evaluate(&caps(8.0, 4, 5), &reqs).is_satisfied());
        assert_eq!(evaluate_runtime(&caps(2.0, 4, 0), &reqs).shortfalls.len(), 1);
    }

    #[test]
    fn free_space_uses_longest_matching_mount() {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let mounts = vec![
            (PathBuf::from("/"), 10),
            (root.clone(), 99),
        ];
        // Non-existent child of the temp dir resolves through its ancestor.
        assert_eq!(free_space_for(&root.join("not/yet/created"), &mounts), 99);
    }

    #[test]
    fn free_space_without_matching_mount_is_zero() {
        assert_eq!(free_space_for(Path::new("/data"), &[]), 0);
    }

    #[test]
    fn system_probe_reports_something() {
        let caps = SystemProbe::new(std::env::temp_dir()).probe();
        assert!(caps.cpu_core_count >= 1);
        assert!(caps.total_memory_bytes > 0);
    }
}
