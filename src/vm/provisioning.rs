//! First-run installation of the VM image.
//!
//! ```text
//! <data>/vms/<vm_name>.partial/   unpacked here first
//! <data>/vms/<vm_name>/
//!     luna-vm.qcow2               disk image from the archive
//!     backend.json                backend, budget and port forward
//!     .provisioned                written last; its presence means "done"
//! ```
//!
//! The bundled archive is a zstd-compressed tarball. A failed attempt removes
//! whatever it created, so the next call starts from scratch.

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::hypervisor::HypervisorBackend;
use super::resources::VmResourceBudget;
use crate::config::{AgentSettings, BinarySettings, ImageSettings};
use crate::error::ProvisioningError;

const MARKER_FILE: &str = ".provisioned";
const BACKEND_FILE: &str = "backend.json";

/// Result of [`ImageProvisioner::ensure_provisioned`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The image was unpacked and configured by this call.
    Provisioned,
    /// The marker was already present; nothing was done.
    AlreadyProvisioned,
}

/// Backend configuration persisted next to the disk image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub vm_name: String,
    pub backend: HypervisorBackend,
    pub budget: VmResourceBudget,
    pub host_port: u16,
    pub guest_port: u16,
    pub disk: PathBuf,
    pub provisioned_at: DateTime<Utc>,
}

/// Inputs that vary per provisioning attempt.
#[derive(Debug, Clone, Copy)]
pub struct ProvisionRequest {
    pub backend: HypervisorBackend,
    pub budget: VmResourceBudget,
    /// Free bytes on the disk holding the data directory.
    pub available_disk_bytes: u64,
    pub required_disk_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImageProvisioner {
    vms_dir: PathBuf,
    image: ImageSettings,
    agent: AgentSettings,
    binaries: BinarySettings,
}

impl ImageProvisioner {
    pub fn new(
        vms_dir: impl Into<PathBuf>,
        image: ImageSettings,
        agent: AgentSettings,
        binaries: BinarySettings,
    ) -> Self {
        Self {
            vms_dir: vms_dir.into(),
            image,
            agent,
            binaries,
        }
    }

    pub fn image_dir(&self) -> PathBuf {
        self.vms_dir.join(&self.image.vm_name)
    }

    pub fn disk_path(&self) -> PathBuf {
        self.image_dir().join(&self.image.disk_file)
    }

    fn staging_dir(&self) -> PathBuf {
        self.vms_dir.join(format!("{}.partial", self.image.vm_name))
    }

    /// The completion marker exists.
    pub fn is_provisioned(&self) -> bool {
        self.image_dir().join(MARKER_FILE).is_file()
    }

    /// Read back the persisted backend configuration.
    pub fn backend_config(&self) -> Result<BackendConfig, ProvisioningError> {
        let path = self.image_dir().join(BACKEND_FILE);
        let content =
            std::fs::read_to_string(&path).map_err(|e| ProvisioningError::io(&path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| ProvisioningError::Configure(format!("{}: {e}", path.display())))
    }

    /// Install the image unless the marker says it is already there.
    pub async fn ensure_provisioned(
        &self,
        request: ProvisionRequest,
    ) -> Result<ProvisionOutcome, ProvisioningError> {
        if self.is_provisioned() {
            debug!(dir = %self.image_dir().display(), "image already provisioned");
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }

        if request.available_disk_bytes < request.required_disk_bytes {
            return Err(ProvisioningError::InsufficientDisk {
                required: request.required_disk_bytes,
                available: request.available_disk_bytes,
            });
        }

        let archive = self.image.archive_path();
        if !archive.is_file() {
            return Err(ProvisioningError::ArchiveMissing(archive));
        }

        info!(
            archive = %archive.display(),
            dir = %self.image_dir().display(),
            backend = %request.backend,
            "provisioning VM image"
        );

        let staging = self.staging_dir();
        match self.install(&archive, &staging, request).await {
            Ok(()) => {
                info!(dir = %self.image_dir().display(), "VM image provisioned");
                Ok(ProvisionOutcome::Provisioned)
            }
            Err(e) => {
                warn!(error = %e, "provisioning failed, cleaning up");
                remove_dir_quietly(&staging);
                remove_dir_quietly(&self.image_dir());
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        archive: &Path,
        staging: &Path,
        request: ProvisionRequest,
    ) -> Result<(), ProvisioningError> {
        std::fs::create_dir_all(&self.vms_dir).map_err(|e| ProvisioningError::io(&self.vms_dir, e))?;
        // Leftovers from an interrupted run.
        remove_dir_quietly(staging);
        remove_dir_quietly(&self.image_dir());
        std::fs::create_dir_all(staging).map_err(|e| ProvisioningError::io(staging, e))?;

        let (archive_owned, staging_owned) = (archive.to_path_buf(), staging.to_path_buf());
        tokio::task::spawn_blocking(move || unpack_archive(&archive_owned, &staging_owned))
            .await
            .map_err(|e| ProvisioningError::Configure(format!("unpack task failed: {e}")))??;

        if !staging.join(&self.image.disk_file).is_file() {
            return Err(ProvisioningError::DiskImageMissing(self.image.disk_file.clone()));
        }

        let config = BackendConfig {
            vm_name: self.image.vm_name.clone(),
            backend: request.backend,
            budget: request.budget,
            host_port: self.agent.port,
            guest_port: self.agent.guest_port,
            disk: self.disk_path(),
            provisioned_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&config)
            .map_err(|e| ProvisioningError::Configure(e.to_string()))?;
        let backend_path = staging.join(BACKEND_FILE);
        std::fs::write(&backend_path, json).map_err(|e| ProvisioningError::io(&backend_path, e))?;

        let image_dir = self.image_dir();
        std::fs::rename(staging, &image_dir).map_err(|e| ProvisioningError::io(&image_dir, e))?;

        let virtualbox = request.backend == HypervisorBackend::VirtualBoxWin;
        if virtualbox {
            self.register_virtualbox(&config).await?;
        }

        let marker = image_dir.join(MARKER_FILE);
        if let Err(e) = std::fs::write(&marker, config.provisioned_at.to_rfc3339()) {
            if virtualbox {
                self.unregister_virtualbox(&config.vm_name).await;
            }
            return Err(ProvisioningError::io(&marker, e));
        }
        Ok(())
    }

    /// Register the unpacked VM with VirtualBox and apply resources and the
    /// agent port forward. A failed configuration step leaves the VM
    /// unregistered again.
    async fn register_virtualbox(&self, config: &BackendConfig) -> Result<(), ProvisioningError> {
        // A run that died before cleaning up may have left it registered.
        self.unregister_virtualbox(&config.vm_name).await;

        let vbox_file = self.image_dir().join(format!("{}.vbox", config.vm_name));
        run_tool(
            &self.binaries.vbox_manage,
            &["registervm".to_string(), vbox_file.display().to_string()],
        )
        .await?;

        let args = vec![
            "modifyvm".to_string(),
            config.vm_name.clone(),
            "--memory".to_string(),
            config.budget.memory_mb.to_string(),
            "--cpus".to_string(),
            config.budget.cpu_count.to_string(),
            "--natpf1".to_string(),
            format!(
                "agent,tcp,127.0.0.1,{},,{}",
                config.host_port, config.guest_port
            ),
        ];
        if let Err(e) = run_tool(&self.binaries.vbox_manage, &args).await {
            self.unregister_virtualbox(&config.vm_name).await;
            return Err(e);
        }
        Ok(())
    }

    /// Best effort; fails harmlessly when the VM is not registered.
    async fn unregister_virtualbox(&self, vm_name: &str) {
        let args = ["unregistervm".to_string(), vm_name.to_string()];
        if let Err(e) = run_tool(&self.binaries.vbox_manage, &args).await {
            debug!(vm = vm_name, error = %e, "unregistervm skipped");
        }
    }
}

fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), ProvisioningError> {
    let file = File::open(archive).map_err(|e| ProvisioningError::io(archive, e))?;
    let extraction = |source| ProvisioningError::Extraction {
        archive: archive.to_path_buf(),
        source,
    };
    let decoder = zstd::stream::Decoder::new(file).map_err(extraction)?;
    let mut tar = tar::Archive::new(decoder);
    tar.set_preserve_permissions(true);
    tar.unpack(dest).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProvisioningError::PermissionDenied(dest.to_path_buf())
        } else {
            extraction(e)
        }
    })
}

async fn run_tool(program: &str, args: &[String]) -> Result<(), ProvisioningError> {
    debug!(program, ?args, "running backend configuration tool");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ProvisioningError::Configure(format!("failed to run {program}: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ProvisioningError::Configure(format!(
            "{program} {} exited with {:?}: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

fn remove_dir_quietly(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_dir_all(path) {
            warn!(path = %path.display(), error = %e, "failed to remove directory");
        }
    }
}
