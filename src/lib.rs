//! luna-vm: lifecycle orchestration for the Luna agent VM.
//!
//! The host application talks to one fixed local endpoint. This crate makes
//! sure something is answering there: it provisions the VM image on first
//! use, launches it with the best hypervisor the platform offers, waits for
//! the agent's health check and tears everything down on shutdown.
//!
//! ```no_run
//! # async fn demo() -> luna_vm::Result<()> {
//! use luna_vm::{AppPaths, LifecycleOrchestrator, VmSettings};
//!
//! let paths = AppPaths::resolve().expect("home directory");
//! let settings = VmSettings::load(&paths.settings_file())?;
//! let vm = LifecycleOrchestrator::new(settings, paths)?;
//! vm.ensure_ready().await?;
//! println!("agent at {}", vm.endpoint());
//! vm.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod vm;

pub use config::VmSettings;
pub use error::{Error, ProvisioningError, Result};
pub use paths::AppPaths;
pub use vm::{LifecycleEvent, LifecycleEventKind, LifecycleOrchestrator, StopOutcome, VmInstanceState};
