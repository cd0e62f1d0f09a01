//! VM lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! Absent ──Provisioned──► Installed (superstate, StopRequested ─► Stopping)
//!                            ├── Provisioned ──StartRequested──► Starting
//!                            ├── Starting    ──AgentReady──► Running
//!                            │               └─StartFailed──► Failed { reason }
//!                            ├── Running     ──ProcessExited──► Stopped
//!                            │               └─HealthLost──► Failed { reason }
//!                            ├── Stopping    ──Halted──► Stopped
//!                            ├── Stopped     ──StartRequested──► Starting
//!                            └── Failed      ──StartRequested──► Starting
//! ```
//!
//! Inputs that a state does not accept are swallowed; callers compare the
//! public [`VmInstanceState`] before and after to see whether anything moved.

use std::fmt;

use serde::{Deserialize, Serialize};
use statig::prelude::*;

// ---------------------------------------------------------------------------
// Public state
// ---------------------------------------------------------------------------

/// Observable lifecycle state of the managed VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum VmInstanceState {
    Absent,
    Provisioned,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

impl VmInstanceState {
    /// States from which a start attempt may begin.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            VmInstanceState::Provisioned | VmInstanceState::Stopped | VmInstanceState::Failed(_)
        )
    }
}

impl fmt::Display for VmInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmInstanceState::Absent => write!(f, "absent"),
            VmInstanceState::Provisioned => write!(f, "provisioned"),
            VmInstanceState::Starting => write!(f, "starting"),
            VmInstanceState::Running => write!(f, "running"),
            VmInstanceState::Stopping => write!(f, "stopping"),
            VmInstanceState::Stopped => write!(f, "stopped"),
            VmInstanceState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Inputs dispatched by the orchestrator.
#[derive(Debug, Clone)]
pub enum LifecycleInput {
    /// The image is unpacked and configured.
    Provisioned,
    /// A start attempt is beginning.
    StartRequested,
    /// The health endpoint reported ready.
    AgentReady,
    /// Spawn failure, startup timeout or a crash before readiness.
    StartFailed(String),
    /// The VM process ended while running.
    ProcessExited,
    /// The process is alive but the agent stopped answering.
    HealthLost(String),
    /// A shutdown began.
    StopRequested,
    /// The shutdown sequence finished.
    Halted,
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LifecycleMachine;

#[state_machine(
    initial = "State::absent()",
    state(derive(Debug, Clone, PartialEq))
)]
impl LifecycleMachine {
    /// Every state that has an image on disk.
    #[superstate]
    fn installed(&mut self, event: &LifecycleInput) -> Outcome<State> {
        match event {
            LifecycleInput::StopRequested => Transition(State::stopping()),
            _ => Handled,
        }
    }

    /// Nothing on disk yet.
    #[state]
    fn absent(&mut self, event: &LifecycleInput) -> Outcome<State> {
        match event {
            LifecycleInput::Provisioned => Transition(State::provisioned()),
            _ => Handled,
        }
    }

    #[state(superstate = "installed")]
    fn provisioned(&mut self, event: &LifecycleInput) -> Outcome<State> {
        match event {
            LifecycleInput::StartRequested => Transition(State::starting()),
            _ => Super,
        }
    }

    #[state(superstate = "installed")]
    fn starting(&mut self, event: &LifecycleInput) -> Outcome<State> {
        match event {
            LifecycleInput::AgentReady => Transition(State::running()),
            LifecycleInput::StartFailed(reason) => Transition(State::failed(reason.clone())),
            _ => Super,
        }
    }

    #[state(superstate = "installed")]
    fn running(&mut self, event: &LifecycleInput) -> Outcome<State> {
        match event {
            LifecycleInput::ProcessExited => Transition(State::stopped()),
            LifecycleInput::HealthLost(reason) => Transition(State::failed(reason.clone())),
            _ => Super,
        }
    }

    #[state]
    fn stopping(&mut self, event: &LifecycleInput) -> Outcome<State> {
        match event {
            LifecycleInput::Halted => Transition(State::stopped()),
            _ => Handled,
        }
    }

    #[state(superstate = "installed")]
    fn stopped(&mut self, event: &LifecycleInput) -> Outcome<State> {
        match event {
            LifecycleInput::StartRequested => Transition(State::starting()),
            // Already down.
            LifecycleInput::StopRequested => Handled,
            _ => Super,
        }
    }

    #[state(superstate = "installed")]
    fn failed(&mut self, event: &LifecycleInput, reason: &String) -> Outcome<State> {
        let _ = reason;
        match event {
            LifecycleInput::StartRequested => Transition(State::starting()),
            _ => Super,
        }
    }
}

impl From<&State> for VmInstanceState {
    fn from(state: &State) -> Self {
        match state {
            State::Absent {} => VmInstanceState::Absent,
            State::Provisioned {} => VmInstanceState::Provisioned,
            State::Starting {} => VmInstanceState::Starting,
            State::Running {} => VmInstanceState::Running,
            State::Stopping {} => VmInstanceState::Stopping,
            State::Stopped {} => VmInstanceState::Stopped,
            State::Failed { reason } => VmInstanceState::Failed(reason.clone()),
        }
    }
}

/// Owns the statig machine and reports public-state changes.
pub struct Lifecycle {
    machine: StateMachine<LifecycleMachine>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            machine: LifecycleMachine.state_machine(),
        }
    }

    pub fn state(&self) -> VmInstanceState {
        self.machine.state().into()
    }

    /// Dispatch `input`; returns `(from, to)` when the public state changed.
    pub fn apply(&mut self, input: LifecycleInput) -> Option<(VmInstanceState, VmInstanceState)> {
        let from = self.state();
        self.machine.handle(&input);
        let to = self.state();
        (from != to).then_some((from, to))
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle").field("state", &self.state()).finish()
    }
}
