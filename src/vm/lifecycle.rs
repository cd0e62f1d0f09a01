//! The lifecycle orchestrator: one managed VM behind one local endpoint.
//!
//! ## Architecture
//!
//! ```text
//! ensure_ready()
//!     ├─► apply pending ProcessEvents
//!     ├─► capability probe ─► requirements check
//!     ├─► ImageProvisioner   (Absent ─► Provisioned)
//!     ├─► live health check  (Running and ready ─► done)
//!     ├─► BackendLauncher / CustomLauncher ─► ProcessSupervisor::spawn
//!     └─► HealthPoller::wait_until_ready ◄─ races ─► process exit, cancellation
//! shutdown()
//!     └─► cancel readiness wait ─► lock ─► ProcessSupervisor::stop(grace)
//! ```
//!
//! `ensure_ready`, `is_running`, `restart` and `shutdown` serialize on one
//! async mutex. The readiness cancellation token lives outside that mutex so
//! `shutdown` can interrupt a start that is holding it.
//!
//! Dropping the orchestrator kills the VM process.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capability::{
    CapabilityProbe, HostCapabilities, RequirementsReport, SystemProbe, evaluate, evaluate_runtime,
};
use super::health::{HealthPoller, HealthStatus};
use super::hypervisor::{self, HypervisorBackend};
use super::launch::{BackendLauncher, CustomLauncher, LaunchContext, Launcher};
use super::provisioning::{ImageProvisioner, ProvisionOutcome, ProvisionRequest};
use super::resources::allocate;
use super::state::{Lifecycle, LifecycleInput, VmInstanceState};
use super::supervisor::{ExitInfo, ProcessEvent, ProcessSupervisor, StopOutcome};
use crate::config::VmSettings;
use crate::paths::AppPaths;
use crate::{Error, Result};

const EVENT_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

/// Notification delivered through [`LifecycleOrchestrator::subscribe`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LifecycleEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEventKind {
    StateChanged {
        from: VmInstanceState,
        to: VmInstanceState,
    },
    Provisioned {
        image_dir: PathBuf,
    },
    ProcessSpawned {
        pid: u32,
    },
    ProcessExited {
        pid: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl LifecycleEvent {
    fn now(kind: LifecycleEventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Mutable state guarded by the lifecycle mutex.
struct Inner {
    lifecycle: Lifecycle,
    supervisor: ProcessSupervisor,
    process_events: mpsc::UnboundedReceiver<ProcessEvent>,
    provisioner: ImageProvisioner,
}

enum StartupWait {
    Health(Result<HealthStatus>),
    Exited(ExitInfo),
}

pub struct LifecycleOrchestrator {
    settings: VmSettings,
    paths: AppPaths,
    probe: Arc<dyn CapabilityProbe>,
    /// Replaces the backend launcher when set.
    launcher: Option<Arc<dyn Launcher>>,
    poller: HealthPoller,
    events: broadcast::Sender<LifecycleEvent>,
    state_tx: watch::Sender<VmInstanceState>,
    readiness: std::sync::Mutex<Option<CancellationToken>>,
    inner: Mutex<Inner>,
}

impl LifecycleOrchestrator {
    /// Build an orchestrator for `settings`, keeping images under
    /// `paths.vms`. Starts `Provisioned` when the image is already on disk,
    /// `Absent` otherwise. Nothing is spawned until [`ensure_ready`].
    ///
    /// [`ensure_ready`]: LifecycleOrchestrator::ensure_ready
    pub fn new(settings: VmSettings, paths: AppPaths) -> Result<Self> {
        settings.validate()?;

        let poller = HealthPoller::new(
            &settings.endpoint(),
            &settings.agent.health_path,
            settings.timeouts.request(),
            settings.timeouts.poll_interval(),
        )?;

        let launcher = settings
            .launch
            .custom_command
            .clone()
            .and_then(CustomLauncher::new)
            .map(|l| Arc::new(l) as Arc<dyn Launcher>);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(events_tx, Some(paths.console_log()));
        let provisioner = ImageProvisioner::new(
            paths.vms.clone(),
            settings.image.clone(),
            settings.agent.clone(),
            settings.binaries.clone(),
        );

        let mut lifecycle = Lifecycle::new();
        if provisioner.is_provisioned() {
            lifecycle.apply(LifecycleInput::Provisioned);
        }
        let (state_tx, _) = watch::channel(lifecycle.state());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            probe: Arc::new(SystemProbe::new(paths.data.clone())),
            launcher,
            poller,
            events,
            state_tx,
            readiness: std::sync::Mutex::new(None),
            inner: Mutex::new(Inner {
                lifecycle,
                supervisor,
                process_events: events_rx,
                provisioner,
            }),
            settings,
            paths,
        })
    }

    /// Use `probe` instead of querying the host.
    pub fn with_probe(mut self, probe: impl CapabilityProbe + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Launch with `launcher` instead of the backend's command line.
    pub fn with_launcher(mut self, launcher: impl Launcher + 'static) -> Self {
        self.launcher = Some(Arc::new(launcher));
        self
    }

    /// The fixed agent URL. Valid whether or not the VM is up.
    pub fn endpoint(&self) -> String {
        self.settings.endpoint()
    }

    pub fn state(&self) -> VmInstanceState {
        self.state_tx.borrow().clone()
    }

    /// Follow state changes without taking the lifecycle lock.
    pub fn watch_state(&self) -> watch::Receiver<VmInstanceState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &VmSettings {
        &self.settings
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    /// Make the agent reachable: provision if needed, start if needed and
    /// wait for it to report ready. Returns at once when it already is.
    pub async fn ensure_ready(&self) -> Result<()> {
        let cancel = self.readiness_token();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.apply_process_events(inner);

        let caps = self.probe_and_check()?;
        self.provision(inner, &caps).await?;

        if inner.lifecycle.state() == VmInstanceState::Running {
            if !inner.supervisor.is_alive() {
                self.transition(inner, LifecycleInput::ProcessExited);
            } else if self.poller.check_once().await.ready {
                debug!("agent already ready");
                return Ok(());
            } else {
                self.transition(inner, LifecycleInput::HealthLost("agent unreachable".into()));
            }
        }

        self.start(inner, &caps, &cancel).await
    }

    /// Check requirements and install the image without starting anything.
    pub async fn ensure_provisioned(&self) -> Result<ProvisionOutcome> {
        let mut guard = self.inner.lock().await;
        let caps = self.probe_and_check()?;
        self.provision(&mut guard, &caps).await
    }

    /// Live check: a VM process is alive and the agent answers ready right
    /// now. A running VM whose agent stopped answering becomes `Failed`.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        self.apply_process_events(inner);

        if !inner.supervisor.is_alive() {
            return false;
        }

        let status = self.poller.check_once().await;
        let state = inner.lifecycle.state();
        if status.ready {
            // The agent came up after an earlier startup timeout.
            if matches!(state, VmInstanceState::Failed(_)) {
                self.transition(inner, LifecycleInput::StartRequested);
            }
            self.transition(inner, LifecycleInput::AgentReady);
            true
        } else {
            if state == VmInstanceState::Running {
                warn!(reachable = status.reachable, "agent stopped answering");
                self.transition(inner, LifecycleInput::HealthLost("agent unreachable".into()));
            }
            false
        }
    }

    /// Stop the VM if it is reachable, pause, then start it and wait for the
    /// agent. An unreachable VM is simply started.
    pub async fn restart(&self) -> Result<()> {
        if self.is_running().await {
            info!("restarting VM");
            self.shutdown().await;
            tokio::time::sleep(self.settings.timeouts.restart_settle()).await;
        } else {
            info!("VM not reachable, starting instead of restarting");
        }
        self.ensure_ready().await
    }

    /// Stop the VM, escalating to a forced kill after the grace period.
    /// Interrupts an in-flight `ensure_ready` first.
    pub async fn shutdown(&self) -> StopOutcome {
        if let Some(token) = self.take_readiness_token() {
            debug!("cancelling readiness wait");
            token.cancel();
        }

        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        self.apply_process_events(inner);

        if inner.lifecycle.state() == VmInstanceState::Absent {
            return StopOutcome::NotRunning;
        }

        self.transition(inner, LifecycleInput::StopRequested);
        let outcome = inner
            .supervisor
            .stop(self.settings.timeouts.shutdown_grace())
            .await;
        self.apply_process_events(inner);
        self.transition(inner, LifecycleInput::Halted);

        info!(?outcome, "VM shut down");
        outcome
    }

    // -----------------------------------------------------------------------
    // Start path
    // -----------------------------------------------------------------------

    /// Probe the host and apply the memory and CPU minimums.
    fn probe_and_check(&self) -> Result<HostCapabilities> {
        let caps = self.probe.probe();
        check_report(evaluate_runtime(&caps, &self.settings.requirements))?;
        Ok(caps)
    }

    async fn provision(
        &self,
        inner: &mut Inner,
        caps: &HostCapabilities,
    ) -> Result<ProvisionOutcome> {
        if inner.provisioner.is_provisioned() {
            self.transition(inner, LifecycleInput::Provisioned);
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }
        check_report(evaluate(caps, &self.settings.requirements))?;
        let request = ProvisionRequest {
            backend: self.provisioning_backend()?,
            budget: allocate(caps, &self.settings.resources),
            available_disk_bytes: caps.available_disk_bytes,
            required_disk_bytes: self.settings.requirements.min_disk_bytes(),
        };
        let outcome = inner.provisioner.ensure_provisioned(request).await?;
        if outcome == ProvisionOutcome::Provisioned {
            self.emit(LifecycleEventKind::Provisioned {
                image_dir: inner.provisioner.image_dir(),
            });
        }
        self.transition(inner, LifecycleInput::Provisioned);
        Ok(outcome)
    }

    async fn start(
        &self,
        inner: &mut Inner,
        caps: &HostCapabilities,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.transition(inner, LifecycleInput::StartRequested);

        if inner.supervisor.is_alive() {
            info!(pid = ?inner.supervisor.pid(), "VM process still alive, waiting for agent");
        } else if let Err(e) = self.spawn_vm(inner, caps).await {
            warn!(error = %e, "failed to launch VM");
            self.transition(inner, LifecycleInput::StartFailed(e.to_string()));
            return Err(e);
        }

        let generation = inner.supervisor.generation();
        let waited = tokio::select! {
            ready = self.poller.wait_until_ready(self.settings.timeouts.startup(), cancel) => {
                StartupWait::Health(ready)
            }
            exit = inner.supervisor.wait_for_exit() => StartupWait::Exited(exit),
        };

        match waited {
            StartupWait::Health(Ok(_)) => {
                self.transition(inner, LifecycleInput::AgentReady);
                Ok(())
            }
            StartupWait::Health(Err(Error::Cancelled)) => {
                info!("readiness wait cancelled");
                Err(Error::Cancelled)
            }
            StartupWait::Health(Err(e)) => {
                warn!(error = %e, pid = ?inner.supervisor.pid(), "agent did not become ready");
                self.transition(inner, LifecycleInput::StartFailed(e.to_string()));
                Err(e)
            }
            StartupWait::Exited(exit) => {
                warn!(code = ?exit.code, signal = ?exit.signal, "VM process exited during startup");
                self.apply_process_events(inner);
                if let Some(generation) = generation {
                    inner.supervisor.acknowledge_exit(generation);
                }
                self.transition(inner, LifecycleInput::StartFailed(crash_reason(exit)));
                Err(Error::ProcessCrash {
                    code: exit.code,
                    signal: exit.signal,
                })
            }
        }
    }

    async fn spawn_vm(&self, inner: &mut Inner, caps: &HostCapabilities) -> Result<()> {
        std::fs::create_dir_all(&self.paths.logs)?;

        let launcher: Arc<dyn Launcher> = match &self.launcher {
            Some(launcher) => launcher.clone(),
            None => Arc::new(BackendLauncher::new(
                self.launch_backend(&inner.provisioner)?,
                self.settings.binaries.clone(),
            )),
        };

        let budget = allocate(caps, &self.settings.resources);
        let image_dir = inner.provisioner.image_dir();
        let disk = inner.provisioner.disk_path();
        let plan = launcher.plan(&LaunchContext {
            budget,
            host_port: self.settings.agent.port,
            guest_port: self.settings.agent.guest_port,
            vm_name: &self.settings.image.vm_name,
            image_dir: &image_dir,
            disk: &disk,
        });

        info!(
            launcher = %launcher.describe(),
            memory_mb = budget.memory_mb,
            cpus = budget.cpu_count,
            port = self.settings.agent.port,
            "launching VM"
        );
        for step in &plan.prepare {
            inner.supervisor.run_prepare(step).await?;
        }
        let pid = inner.supervisor.spawn(&plan.main)?;
        self.emit(LifecycleEventKind::ProcessSpawned { pid });
        Ok(())
    }

    /// Backend for a fresh image: configured override, else detection.
    fn provisioning_backend(&self) -> Result<HypervisorBackend> {
        match self.settings.launch.backend {
            Some(backend) => Ok(backend),
            None => hypervisor::detect(),
        }
    }

    /// Backend for launching: configured override, else what the image was
    /// provisioned for, else detection.
    fn launch_backend(&self, provisioner: &ImageProvisioner) -> Result<HypervisorBackend> {
        if let Some(backend) = self.settings.launch.backend {
            return Ok(backend);
        }
        match provisioner.backend_config() {
            Ok(config) => Ok(config.backend),
            Err(e) => {
                debug!(error = %e, "no persisted backend, detecting");
                hypervisor::detect()
            }
        }
    }

    // -----------------------------------------------------------------------
    // State bookkeeping
    // -----------------------------------------------------------------------

    /// Drain exit notifications from the supervisor's monitor task.
    fn apply_process_events(&self, inner: &mut Inner) {
        while let Ok(event) = inner.process_events.try_recv() {
            let ProcessEvent::Exited {
                generation,
                pid,
                exit,
            } = event;
            self.emit(LifecycleEventKind::ProcessExited {
                pid,
                code: exit.code,
                signal: exit.signal,
            });

            if !inner.supervisor.acknowledge_exit(generation) {
                debug!(pid, generation, "exit of a previous VM process");
                continue;
            }
            match inner.lifecycle.state() {
                VmInstanceState::Running => {
                    warn!(pid, code = ?exit.code, signal = ?exit.signal, "VM process exited");
                    self.transition(inner, LifecycleInput::ProcessExited);
                }
                VmInstanceState::Starting => {
                    self.transition(inner, LifecycleInput::StartFailed(crash_reason(exit)));
                }
                _ => {}
            }
        }
    }

    fn transition(&self, inner: &mut Inner, input: LifecycleInput) {
        if let Some((from, to)) = inner.lifecycle.apply(input) {
            info!(%from, %to, "VM state changed");
            self.state_tx.send_replace(to.clone());
            self.emit(LifecycleEventKind::StateChanged { from, to });
        }
    }

    fn emit(&self, kind: LifecycleEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(LifecycleEvent::now(kind));
    }

    /// Token shared by every readiness wait until the next shutdown.
    fn readiness_token(&self) -> CancellationToken {
        self.readiness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(CancellationToken::new)
            .clone()
    }

    fn take_readiness_token(&self) -> Option<CancellationToken> {
        self.readiness
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl std::fmt::Debug for LifecycleOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleOrchestrator")
            .field("endpoint", &self.endpoint())
            .field("state", &self.state())
            .finish()
    }
}

fn check_report(report: RequirementsReport) -> Result<()> {
    if report.is_satisfied() {
        Ok(())
    } else {
        warn!(shortfalls = ?report.shortfalls, "host below minimum requirements");
        Err(Error::InsufficientResources(report.shortfalls))
    }
}

fn crash_reason(exit: ExitInfo) -> String {
    match (exit.code, exit.signal) {
        (_, Some(signal)) => format!("process killed by signal {signal} during startup"),
        (Some(code), None) => format!("process exited with code {code} during startup"),
        (None, None) => "process exited during startup".to_string(),
    }
}
