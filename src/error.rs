//! Error types for the VM lifecycle layer.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported platform: {0} (expected windows, macos or linux)")]
    UnsupportedPlatform(String),

    #[error("host does not meet minimum requirements: {}", .0.join("; "))]
    InsufficientResources(Vec<String>),

    #[error("provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("agent did not become ready within {}s ({attempts} health checks)", .waited.as_secs())]
    StartupTimeout { waited: Duration, attempts: u32 },

    #[error("VM process exited during startup (code {code:?}, signal {signal:?})")]
    ProcessCrash {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("a VM process is already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("launch preparation `{program}` failed: {detail}")]
    LaunchPrepare { program: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors a caller may sensibly retry (via `ensure_ready` or
    /// `restart`) without changing anything on the host.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::StartupTimeout { .. } | Error::ProcessCrash { .. } | Error::Cancelled
        )
    }
}

/// Failures while putting the VM image in place. None are retried locally.
#[derive(Error, Debug)]
pub enum ProvisioningError {
    #[error("bundled image archive not found at {0}")]
    ArchiveMissing(PathBuf),

    #[error("failed to extract {archive}: {source}")]
    Extraction {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive does not contain the disk image `{0}`")]
    DiskImageMissing(String),

    #[error("insufficient disk space: need {required} bytes, {available} available")]
    InsufficientDisk { required: u64, available: u64 },

    #[error("permission denied at {0}")]
    PermissionDenied(PathBuf),

    #[error("backend configuration failed: {0}")]
    Configure(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisioningError {
    /// Wrap an IO error for `path`, promoting permission errors to their own
    /// variant.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            ProvisioningError::PermissionDenied(path)
        } else {
            ProvisioningError::Io { path, source }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_errors_get_their_own_variant() {
        let err = ProvisioningError::io(
            "/var/lib/luna",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, ProvisioningError::PermissionDenied(_)));

        let err = ProvisioningError::io("/x", std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(matches!(err, ProvisioningError::Io { .. }));
    }

    #[test]
    fn insufficient_resources_lists_every_shortfall() {
        let err = Error::InsufficientResources(vec!["memory".into(), "disk".into()]);
        assert_eq!(
            err.to_string(),
            "host does not meet minimum requirements: memory; disk"
        );
    }

    #[test]
    fn recoverable_errors() {
        assert!(Error::Cancelled.is_recoverable());
        assert!(
            Error::StartupTimeout { waited: Duration::from_secs(60), attempts: 30 }
                .is_recoverable()
        );
        assert!(!Error::UnsupportedPlatform("freebsd".into()).is_recoverable());
    }
}
