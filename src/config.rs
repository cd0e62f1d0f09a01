//! User-editable settings for the managed VM, stored as `vm.toml`.
//!
//! Every section is `#[serde(default)]`, so a partial file only overrides the
//! keys it names:
//!
//! ```toml
//! [agent]
//! port = 9090
//!
//! [timeouts]
//! startup_ms = 120000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::vm::capability::SystemRequirements;
use crate::vm::hypervisor::HypervisorBackend;
use crate::vm::resources::ResourcePolicy;
use crate::{Error, Result};

/// File name of the bundled, zstd-compressed VM image archive.
pub const BUNDLED_ARCHIVE_NAME: &str = "luna-vm.tar.zst";

/// Root settings container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub agent: AgentSettings,
    pub timeouts: TimeoutSettings,
    pub resources: ResourcePolicy,
    pub requirements: SystemRequirements,
    pub image: ImageSettings,
    pub binaries: BinarySettings,
    pub launch: LaunchSettings,
}

/// Where the agent inside the VM is reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Host-side TCP port forwarded into the VM.
    pub port: u16,
    /// Port the agent listens on inside the guest.
    pub guest_port: u16,
    pub health_path: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            port: 8080,
            guest_port: 8080,
            health_path: "/health".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Overall budget for the agent to report ready after spawn.
    pub startup_ms: u64,
    /// Wait between the graceful and the forced termination signal.
    pub shutdown_grace_ms: u64,
    pub poll_interval_ms: u64,
    /// Per-request timeout of a single health probe.
    pub request_ms: u64,
    /// Pause between stop and start during `restart`.
    pub restart_settle_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            startup_ms: 60_000,
            shutdown_grace_ms: 5_000,
            poll_interval_ms: 2_000,
            request_ms: 5_000,
            restart_settle_ms: 2_000,
        }
    }
}

impl TimeoutSettings {
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    /// Name of the VM; also the image directory name under `vms/`.
    pub vm_name: String,
    /// Bundled archive. `None` means `resources/luna-vm.tar.zst` next to the
    /// running executable.
    pub archive: Option<PathBuf>,
    /// Disk image file the archive must contain.
    pub disk_file: String,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            vm_name: "luna-vm".to_string(),
            archive: None,
            disk_file: "luna-vm.qcow2".to_string(),
        }
    }
}

impl ImageSettings {
    /// Resolve the archive path, falling back to the copy shipped with the
    /// host application.
    pub fn archive_path(&self) -> PathBuf {
        if let Some(path) = &self.archive {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("resources")
            .join(BUNDLED_ARCHIVE_NAME)
    }
}

/// External virtualization tools, looked up on `PATH` unless absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinarySettings {
    pub qemu: String,
    pub vbox_manage: String,
    pub vbox_headless: String,
    pub apple_helper: String,
}

impl Default for BinarySettings {
    fn default() -> Self {
        Self {
            qemu: "qemu-system-x86_64".to_string(),
            vbox_manage: "VBoxManage".to_string(),
            vbox_headless: "VBoxHeadless".to_string(),
            apple_helper: "luna-vm-helper".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// Force a backend instead of detecting one.
    pub backend: Option<HypervisorBackend>,
    /// Replace the backend launch command entirely. Supports the
    /// `{memory_mb}`, `{cpus}`, `{port}`, `{guest_port}`, `{disk}` and
    /// `{image_dir}` placeholders.
    pub custom_command: Option<Vec<String>>,
}

impl VmSettings {
    /// Load settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no settings file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Deserialize from a TOML string.
    pub fn from_toml(s: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.port == 0 {
            return Err(Error::Config("agent.port cannot be 0".into()));
        }
        if self.timeouts.poll_interval_ms == 0 {
            return Err(Error::Config("timeouts.poll_interval_ms must be positive".into()));
        }
        if self.resources.min_memory_gib > self.resources.max_memory_gib {
            return Err(Error::Config("resources.min_memory_gib exceeds max_memory_gib".into()));
        }
        if self.resources.min_cpus > self.resources.max_cpus {
            return Err(Error::Config("resources.min_cpus exceeds max_cpus".into()));
        }
        if let Some(cmd) = &self.launch.custom_command {
            if cmd.is_empty() {
                return Err(Error::Config("launch.custom_command cannot be empty".into()));
            }
        }
        Ok(())
    }

    /// The fixed local URL of the agent.
    pub fn endpoint(&self) -> String {
        format!("http://localhost:{}", self.agent.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let s = VmSettings::default();
        assert_eq!(s.agent.port, 8080);
        assert_eq!(s.timeouts.startup(), Duration::from_secs(60));
        assert_eq!(s.timeouts.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(s.timeouts.poll_interval(), Duration::from_secs(2));
        assert_eq!(s.timeouts.request(), Duration::from_secs(5));
        assert_eq!(s.resources.min_memory_gib, 1);
        assert_eq!(s.resources.max_memory_gib, 4);
        assert_eq!(s.resources.min_cpus, 1);
        assert_eq!(s.resources.max_cpus, 4);
        assert_eq!(s.endpoint(), "http://localhost:8080");
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let partial = r#"
[agent]
port = 9090

[launch]
custom_command = ["sleep", "60"]
"#;
        let s = VmSettings::from_toml(partial).expect("partial parse failed");
        assert_eq!(s.agent.port, 9090);
        assert_eq!(s.agent.guest_port, 8080);
        assert_eq!(s.timeouts.poll_interval_ms, 2_000);
        assert_eq!(s.image.vm_name, "luna-vm");
        assert_eq!(
            s.launch.custom_command,
            Some(vec!["sleep".to_string(), "60".to_string()])
        );
    }

    #[test]
    fn toml_roundtrip() {
        let mut original = VmSettings::default();
        original.launch.backend = Some(HypervisorBackend::QemuFallback);
        let parsed = VmSettings::from_toml(&original.to_toml()).expect("roundtrip parse failed");
        assert_eq!(parsed, original);
    }

    #[test]
    fn validate_rejects_inverted_clamps() {
        let mut s = VmSettings::default();
        s.resources.min_cpus = 8;
        assert!(matches!(s.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let s = VmSettings::load(&tmp.path().join("vm.toml")).unwrap();
        assert_eq!(s, VmSettings::default());
    }

    #[test]
    fn load_reports_parse_errors_as_config() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("vm.toml");
        std::fs::write(&path, "[agent]\nport = \"not a number\"\n").unwrap();
        assert!(matches!(VmSettings::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn explicit_archive_path_wins() {
        let mut image = ImageSettings::default();
        assert!(image.archive_path().ends_with("resources/luna-vm.tar.zst"));
        image.archive = Some(PathBuf::from("/opt/luna/image.tar.zst"));
        assert_eq!(image.archive_path(), PathBuf::from("/opt/luna/image.tar.zst"));
    }
}
