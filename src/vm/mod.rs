//! VM lifecycle management for luna-vm.
//!
//! Probes the host, picks a virtualization backend, provisions the bundled
//! image, supervises the hypervisor process and gates readiness on the
//! agent's health endpoint. [`LifecycleOrchestrator`] is the entry point.

pub mod capability;
pub mod health;
pub mod hypervisor;
pub mod launch;
pub mod lifecycle;
pub mod provisioning;
pub mod resources;
pub mod retry;
pub mod state;
pub mod supervisor;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use capability::{
    CapabilityProbe, FixedProbe, HostCapabilities, RequirementsReport, SystemProbe,
    SystemRequirements, check_system_requirements, evaluate_runtime,
};
pub use health::{HealthPoller, HealthStatus};
pub use hypervisor::{HypervisorBackend, Platform};
pub use launch::{BackendLauncher, CustomLauncher, LaunchCommand, LaunchContext, LaunchPlan, Launcher};
pub use lifecycle::{LifecycleEvent, LifecycleEventKind, LifecycleOrchestrator};
pub use provisioning::{BackendConfig, ImageProvisioner, ProvisionOutcome};
pub use resources::{ResourcePolicy, VmResourceBudget, allocate};
pub use state::VmInstanceState;
pub use supervisor::{ExitInfo, StopOutcome};
