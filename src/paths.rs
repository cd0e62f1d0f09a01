//! Directory layout for luna-vm.
//!
//! - Config: `~/.config/luna-vm/` (XDG), `%APPDATA%\luna-vm\` on Windows
//! - Data:   `~/.local/share/luna-vm/`, `~/Library/Application Support/ai.luna.vm/`
//!   on macOS, `%LOCALAPPDATA%\luna-vm\` on Windows
//! - VMs:    `<data>/vms/<vm_name>/`
//! - Logs:   `<data>/logs/`, `~/Library/Logs/luna-vm/` on macOS

use std::path::{Path, PathBuf};
use tracing::debug;
#[cfg(target_os = "macos")]
use tracing::warn;

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const BUNDLE_ID: &str = "ai.luna.vm";
const APP_NAME: &str = "luna-vm";

/// All resolved application directory paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    /// Human-editable settings (`vm.toml`).
    pub config: PathBuf,
    /// Machine-managed data root.
    pub data: PathBuf,
    /// Provisioned VM images.
    pub vms: PathBuf,
    /// Application and VM console logs.
    pub logs: PathBuf,
}

impl AppPaths {
    /// Resolve the per-user paths. Does not create anything; see [`ensure`].
    ///
    /// [`ensure`]: AppPaths::ensure
    pub fn resolve() -> Option<Self> {
        let home = home_dir()?;
        let data = resolve_data_dir(&home);
        Some(Self {
            config: resolve_config_dir(&home),
            vms: data.join("vms"),
            logs: resolve_log_dir(&home, &data),
            data,
        })
    }

    /// Everything under one root. Used for tests and portable installs.
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let data = root.join("data");
        Self {
            config: root.join("config"),
            vms: data.join("vms"),
            logs: data.join("logs"),
            data,
        }
    }

    /// Default settings file.
    pub fn settings_file(&self) -> PathBuf {
        self.config.join("vm.toml")
    }

    /// Where the VM's serial console output is appended.
    pub fn console_log(&self) -> PathBuf {
        self.logs.join("vm-console.log")
    }

    /// Create all directories that don't already exist.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.config, &self.data, &self.vms, &self.logs] {
            std::fs::create_dir_all(dir)?;
            debug!(dir = %dir.display(), "ensured directory");
        }

        // VM disks are large and regenerable from the bundled archive.
        #[cfg(target_os = "macos")]
        exclude_from_time_machine(&self.vms);

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(windows))]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn resolve_config_dir(home: &Path) -> PathBuf {
    std::env::var_os("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join("AppData").join("Roaming"))
        .join(APP_NAME)
}

#[cfg(not(windows))]
fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(windows)]
fn resolve_data_dir(home: &Path) -> PathBuf {
    std::env::var_os("LOCALAPPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| home.join("AppData").join("Local"))
        .join(APP_NAME)
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(any(windows, target_os = "macos")))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path, _data: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(_home: &Path, data: &Path) -> PathBuf {
    data.join("logs")
}

#[cfg(target_os = "macos")]
fn exclude_from_time_machine(path: &Path) {
    match std::process::Command::new("tmutil")
        .arg("addexclusion")
        .arg(path)
        .output()
    {
        Ok(output) if output.status.success() => {}
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("tmutil addexclusion failed for {}: {}", path.display(), stderr.trim());
        }
        Err(e) => {
            warn!("failed to run tmutil for {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_produces_app_scoped_paths() {
        let paths = AppPaths::resolve().expect("home should be set in tests");
        let data = paths.data.to_string_lossy().into_owned();
        assert!(data.contains(APP_NAME) || data.contains(BUNDLE_ID));
        assert!(paths.config.to_string_lossy().contains(APP_NAME));
        assert!(paths.vms.ends_with("vms"));
        assert!(paths.settings_file().ends_with("vm.toml"));
    }

    #[test]
    fn ensure_creates_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let paths = AppPaths::under(tmp.path());

        paths.ensure().expect("ensure should succeed");

        assert!(paths.config.is_dir());
        assert!(paths.data.is_dir());
        assert!(paths.vms.is_dir());
        assert!(paths.logs.is_dir());
        assert!(paths.console_log().starts_with(&paths.logs));
    }
}
