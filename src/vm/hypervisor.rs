//! Host platform detection and virtualization backend selection.
//!
//! ```text
//! windows ─► HyperV         (hypervisorlaunchtype enabled)
//!         └► VirtualBoxWin  (otherwise)
//! macos   ─► AppleHypervisor
//! linux   ─► Kvm            (/dev/kvm read-write)
//!         └► QemuFallback   (otherwise, unaccelerated TCG)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Host operating system family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Other(String),
}

impl Platform {
    /// Platform of the running process.
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    /// Map a `std::env::consts::OS` string.
    pub fn from_os(os: &str) -> Self {
        match os {
            "windows" => Platform::Windows,
            "macos" => Platform::MacOs,
            "linux" => Platform::Linux,
            other => Platform::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Windows => write!(f, "windows"),
            Platform::MacOs => write!(f, "macos"),
            Platform::Linux => write!(f, "linux"),
            Platform::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Virtualization technology driving the managed VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorBackend {
    /// QEMU accelerated by the Windows Hypervisor Platform.
    HyperV,
    /// VirtualBox running headless.
    VirtualBoxWin,
    /// Native helper on Apple's Virtualization.framework.
    AppleHypervisor,
    /// QEMU accelerated by `/dev/kvm`.
    Kvm,
    /// Unaccelerated QEMU (TCG).
    QemuFallback,
}

impl HypervisorBackend {
    /// The platform this backend belongs to.
    pub fn platform(&self) -> Platform {
        match self {
            HypervisorBackend::HyperV | HypervisorBackend::VirtualBoxWin => Platform::Windows,
            HypervisorBackend::AppleHypervisor => Platform::MacOs,
            HypervisorBackend::Kvm | HypervisorBackend::QemuFallback => Platform::Linux,
        }
    }

    /// Whether the backend uses hardware acceleration.
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, HypervisorBackend::QemuFallback)
    }
}

impl fmt::Display for HypervisorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HypervisorBackend::HyperV => "hyper-v",
            HypervisorBackend::VirtualBoxWin => "virtualbox",
            HypervisorBackend::AppleHypervisor => "apple-hypervisor",
            HypervisorBackend::Kvm => "kvm",
            HypervisorBackend::QemuFallback => "qemu-tcg",
        };
        f.write_str(name)
    }
}

/// Pick the backend for `platform`.
///
/// `accel_available` is the platform's acceleration flag: Hyper-V launch
/// type on Windows, `/dev/kvm` access on Linux. Ignored on macOS.
pub fn select(platform: &Platform, accel_available: bool) -> Result<HypervisorBackend> {
    match platform {
        Platform::Windows if accel_available => Ok(HypervisorBackend::HyperV),
        Platform::Windows => Ok(HypervisorBackend::VirtualBoxWin),
        Platform::MacOs => Ok(HypervisorBackend::AppleHypervisor),
        Platform::Linux if accel_available => Ok(HypervisorBackend::Kvm),
        Platform::Linux => Ok(HypervisorBackend::QemuFallback),
        Platform::Other(name) => Err(Error::UnsupportedPlatform(name.clone())),
    }
}

/// Detect the current platform, probe acceleration and select a backend.
pub fn detect() -> Result<HypervisorBackend> {
    let platform = Platform::current();
    let accel = probe_acceleration(&platform);
    let backend = select(&platform, accel)?;
    info!(%platform, accel, %backend, "selected hypervisor backend");
    Ok(backend)
}

/// Query the platform's acceleration flag. Never fails; errors read as
/// "not available".
pub fn probe_acceleration(platform: &Platform) -> bool {
    match platform {
        Platform::Windows => hyperv_launch_enabled(),
        Platform::Linux => kvm_accessible(),
        Platform::MacOs | Platform::Other(_) => false,
    }
}

fn kvm_accessible() -> bool {
    let ok = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/kvm")
        .is_ok();
    debug!(ok, "probed /dev/kvm");
    ok
}

fn hyperv_launch_enabled() -> bool {
    match std::process::Command::new("bcdedit")
        .args(["/enum", "{current}"])
        .output()
    {
        Ok(output) if output.status.success() => {
            parse_hypervisor_launch_type(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            debug!(code = ?output.status.code(), "bcdedit failed");
            false
        }
        Err(e) => {
            debug!(error = %e, "failed to run bcdedit");
            false
        }
    }
}

/// Parse `bcdedit /enum {current}` output; `Auto` or `On` means enabled.
fn parse_hypervisor_launch_type(output: &str) -> bool {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some(key) if key.eq_ignore_ascii_case("hypervisorlaunchtype") => parts.next(),
                _ => None,
            }
        })
        .any(|value| value.eq_ignore_ascii_case("auto") || value.eq_ignore_ascii_case("on"))
}
