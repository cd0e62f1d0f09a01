//! End-to-end lifecycle tests against a fake agent.
//!
//! Each test runs a real child process (`sh -c …`) through the custom launch
//! command and serves `/health` from an in-process axum server on an
//! ephemeral port, so the whole start/stop path runs without a hypervisor.
//! Unix-only because the stand-in VM is a shell script.

#![cfg(unix)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use axum::extract::State;
use chrono::{DateTime, Utc};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tempfile::TempDir;
use tokio::sync::broadcast;

use luna_vm::vm::{FixedProbe, HostCapabilities, HypervisorBackend};
use luna_vm::{
    AppPaths, Error, LifecycleEvent, LifecycleEventKind, LifecycleOrchestrator, ProvisioningError,
    StopOutcome, VmInstanceState, VmSettings,
};

const GIB: u64 = 1024 * 1024 * 1024;
const SLEEPER: &str = "sleep 30";

// ---------------------------------------------------------------------------
// Fake agent
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct FakeAgent {
    port: u16,
    hits: Arc<AtomicU32>,
    /// First request number (1-based) answered with "ready".
    ready_from: Arc<AtomicU32>,
    healthy: Arc<AtomicBool>,
}

impl FakeAgent {
    async fn spawn(ready_from: u32) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent = FakeAgent {
            port: listener.local_addr().unwrap().port(),
            hits: Arc::new(AtomicU32::new(0)),
            ready_from: Arc::new(AtomicU32::new(ready_from)),
            healthy: Arc::new(AtomicBool::new(true)),
        };
        let app = Router::new()
            .route("/health", get(health))
            .with_state(agent.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        agent
    }

    fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn health(State(agent): State<FakeAgent>) -> (StatusCode, Json<serde_json::Value>) {
    let n = agent.hits.fetch_add(1, Ordering::SeqCst) + 1;
    if agent.healthy.load(Ordering::SeqCst) && n >= agent.ready_from.load(Ordering::SeqCst) {
        (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ready", "version": "1.0.0"})),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "starting"})),
        )
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    _tmp: TempDir,
    paths: AppPaths,
    settings: VmSettings,
    agent: FakeAgent,
}

impl Harness {
    /// Fake agent ready from its `ready_from`-th request; the VM is `script`.
    async fn new(ready_from: u32, script: &str) -> Self {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("luna-vm.tar.zst");
        write_image_archive(&archive);

        let agent = FakeAgent::spawn(ready_from).await;

        let mut settings = VmSettings::default();
        settings.agent.port = agent.port;
        settings.timeouts.startup_ms = 3_000;
        settings.timeouts.poll_interval_ms = 50;
        settings.timeouts.request_ms = 500;
        settings.timeouts.shutdown_grace_ms = 1_000;
        settings.timeouts.restart_settle_ms = 50;
        settings.image.archive = Some(archive);
        settings.launch.backend = Some(HypervisorBackend::QemuFallback);
        settings.launch.custom_command =
            Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()]);

        Harness {
            paths: AppPaths::under(tmp.path()),
            _tmp: tmp,
            settings,
            agent,
        }
    }

    fn orchestrator(&self) -> LifecycleOrchestrator {
        self.orchestrator_with(roomy_host())
    }

    fn orchestrator_with(&self, caps: HostCapabilities) -> LifecycleOrchestrator {
        LifecycleOrchestrator::new(self.settings.clone(), self.paths.clone())
            .unwrap()
            .with_probe(FixedProbe(caps))
    }

    fn image_dir(&self) -> PathBuf {
        self.paths.vms.join(&self.settings.image.vm_name)
    }
}

fn roomy_host() -> HostCapabilities {
    HostCapabilities {
        total_memory_bytes: 16 * GIB,
        cpu_core_count: 8,
        available_disk_bytes: 100 * GIB,
    }
}

fn write_image_archive(path: &Path) {
    let file = File::create(path).unwrap();
    let encoder = zstd::stream::Encoder::new(file, 3).unwrap();
    let mut builder = tar::Builder::new(encoder);
    let data: &[u8] = b"qcow2 stand-in";
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "luna-vm.qcow2", data).unwrap();
    builder.into_inner().unwrap().finish().unwrap();
}

fn drain_events(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn drain(rx: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEventKind> {
    drain_events(rx).into_iter().map(|e| e.kind).collect()
}

/// Timestamp of the first transition into `state`.
fn entered_at(events: &[LifecycleEvent], state: &VmInstanceState) -> DateTime<Utc> {
    events
        .iter()
        .find_map(|e| match &e.kind {
            LifecycleEventKind::StateChanged { to, .. } if to == state => Some(e.at),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no transition into {state}"))
}

fn transitions(events: &[LifecycleEventKind]) -> Vec<(VmInstanceState, VmInstanceState)> {
    events
        .iter()
        .filter_map(|e| match e {
            LifecycleEventKind::StateChanged { from, to } => Some((from.clone(), to.clone())),
            _ => None,
        })
        .collect()
}

fn spawn_count(events: &[LifecycleEventKind]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, LifecycleEventKind::ProcessSpawned { .. }))
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ensure_ready_provisions_starts_and_is_idempotent() {
    let h = Harness::new(1, SLEEPER).await;
    let vm = h.orchestrator();
    let mut events = vm.subscribe();
    assert_eq!(vm.state(), VmInstanceState::Absent);

    vm.ensure_ready().await.unwrap();
    assert_eq!(vm.state(), VmInstanceState::Running);
    assert!(h.image_dir().join(".provisioned").is_file());
    assert!(vm.is_running().await);

    vm.ensure_ready().await.unwrap();
    assert_eq!(vm.state(), VmInstanceState::Running);

    let seen = drain(&mut events);
    assert_eq!(spawn_count(&seen), 1, "second ensure_ready must not spawn");
    assert!(seen
        .iter()
        .any(|e| matches!(e, LifecycleEventKind::Provisioned { .. })));
    assert_eq!(
        transitions(&seen),
        vec![
            (VmInstanceState::Absent, VmInstanceState::Provisioned),
            (VmInstanceState::Provisioned, VmInstanceState::Starting),
            (VmInstanceState::Starting, VmInstanceState::Running),
        ]
    );

    assert_eq!(vm.shutdown().await, StopOutcome::Graceful);
    assert_eq!(vm.state(), VmInstanceState::Stopped);
    assert!(!vm.is_running().await);
}

#[tokio::test]
async fn existing_image_starts_in_provisioned_state() {
    let h = Harness::new(1, SLEEPER).await;
    let first = h.orchestrator();
    first.ensure_provisioned().await.unwrap();
    drop(first);

    let second = h.orchestrator();
    assert_eq!(second.state(), VmInstanceState::Provisioned);
}

#[tokio::test]
async fn installed_image_starts_with_little_free_disk() {
    let h = Harness::new(1, SLEEPER).await;
    h.orchestrator().ensure_provisioned().await.unwrap();

    // Unpacking the image used up most of the space.
    let vm = h.orchestrator_with(HostCapabilities {
        available_disk_bytes: 5 * GIB,
        ..roomy_host()
    });
    assert_eq!(vm.state(), VmInstanceState::Provisioned);
    vm.ensure_ready().await.unwrap();
    assert_eq!(vm.state(), VmInstanceState::Running);
    assert!(vm.is_running().await);
    vm.shutdown().await;
}

#[tokio::test]
async fn low_disk_blocks_fresh_install() {
    let h = Harness::new(1, SLEEPER).await;
    let vm = h.orchestrator_with(HostCapabilities {
        available_disk_bytes: 5 * GIB,
        ..roomy_host()
    });

    let err = vm.ensure_ready().await.unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientResources(ref s) if s.len() == 1 && s[0].starts_with("free disk")
    ));
    assert_eq!(vm.state(), VmInstanceState::Absent);
    assert!(!h.image_dir().exists());
}

#[tokio::test]
async fn underpowered_host_is_rejected_before_provisioning() {
    let h = Harness::new(1, SLEEPER).await;
    let vm = h.orchestrator_with(HostCapabilities {
        total_memory_bytes: 2 * GIB,
        cpu_core_count: 8,
        available_disk_bytes: 100 * GIB,
    });

    let err = vm.ensure_ready().await.unwrap_err();
    assert!(matches!(err, Error::InsufficientResources(ref s) if s.len() == 1));
    assert_eq!(vm.state(), VmInstanceState::Absent);
    assert!(!h.image_dir().exists());
}

#[tokio::test]
async fn corrupt_archive_fails_provisioning_cleanly() {
    let h = Harness::new(1, SLEEPER).await;
    std::fs::write(h.settings.image.archive.as_ref().unwrap(), b"garbage").unwrap();
    let vm = h.orchestrator();

    let err = vm.ensure_ready().await.unwrap_err();
    assert!(matches!(
        err,
        Error::Provisioning(ProvisioningError::Extraction { .. })
    ));
    assert_eq!(vm.state(), VmInstanceState::Absent);
    assert!(!h.image_dir().exists());
}

#[tokio::test]
async fn startup_timeout_keeps_process_for_next_attempt() {
    let mut h = Harness::new(4, SLEEPER).await;
    h.settings.timeouts.poll_interval_ms = 100;
    h.settings.timeouts.startup_ms = 300;
    let vm = h.orchestrator();
    let mut events = vm.subscribe();

    let err = vm.ensure_ready().await.unwrap_err();
    assert!(
        matches!(err, Error::StartupTimeout { attempts: 3, .. }),
        "unexpected error: {err}"
    );
    assert_eq!(h.agent.hits(), 3);
    assert!(matches!(vm.state(), VmInstanceState::Failed(_)));

    // The fourth probe answers ready; the same process is reused.
    vm.ensure_ready().await.unwrap();
    assert_eq!(vm.state(), VmInstanceState::Running);
    assert_eq!(spawn_count(&drain(&mut events)), 1);

    vm.shutdown().await;
}

#[tokio::test]
async fn crash_during_boot_is_reported() {
    let h = Harness::new(u32::MAX, "exit 7").await;
    let vm = h.orchestrator();

    let err = vm.ensure_ready().await.unwrap_err();
    assert!(
        matches!(err, Error::ProcessCrash { code: Some(7), .. }),
        "unexpected error: {err}"
    );
    assert!(matches!(vm.state(), VmInstanceState::Failed(ref r) if r.contains("code 7")));
    assert!(!vm.is_running().await);
}

#[tokio::test]
async fn is_running_turns_false_when_agent_stops_answering() {
    let h = Harness::new(1, SLEEPER).await;
    let vm = h.orchestrator();
    vm.ensure_ready().await.unwrap();
    assert!(vm.is_running().await);

    h.agent.healthy.store(false, Ordering::SeqCst);
    assert!(!vm.is_running().await);
    assert_eq!(
        vm.state(),
        VmInstanceState::Failed("agent unreachable".to_string())
    );

    // Recovery goes through a fresh readiness wait on the same process.
    h.agent.healthy.store(true, Ordering::SeqCst);
    vm.ensure_ready().await.unwrap();
    assert_eq!(vm.state(), VmInstanceState::Running);
    vm.shutdown().await;
}

#[tokio::test]
async fn process_exit_while_running_is_observed() {
    let h = Harness::new(1, "sleep 1").await;
    let vm = h.orchestrator();
    vm.ensure_ready().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(!vm.is_running().await);
    assert_eq!(vm.state(), VmInstanceState::Stopped);
}

#[tokio::test]
async fn term_ignoring_vm_is_killed_after_grace() {
    let mut h = Harness::new(1, "trap '' TERM; while true; do sleep 1; done").await;
    h.settings.timeouts.shutdown_grace_ms = 300;
    let vm = h.orchestrator();
    vm.ensure_ready().await.unwrap();
    // Let the shell install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    assert_eq!(vm.shutdown().await, StopOutcome::Forced);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "stopped after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1_800), "stopped after {elapsed:?}");
    assert_eq!(vm.state(), VmInstanceState::Stopped);
    assert!(!vm.is_running().await);
}

#[tokio::test]
async fn restart_stops_before_starting() {
    let mut h = Harness::new(1, SLEEPER).await;
    h.settings.timeouts.restart_settle_ms = 300;
    let vm = h.orchestrator();
    vm.ensure_ready().await.unwrap();

    let mut events = vm.subscribe();
    vm.restart().await.unwrap();
    assert_eq!(vm.state(), VmInstanceState::Running);

    let timed = drain_events(&mut events);
    let settled = entered_at(&timed, &VmInstanceState::Starting)
        - entered_at(&timed, &VmInstanceState::Stopped);
    assert!(settled.num_milliseconds() >= 300, "settled for {settled}");

    let seen: Vec<_> = timed.into_iter().map(|e| e.kind).collect();
    assert_eq!(
        transitions(&seen),
        vec![
            (VmInstanceState::Running, VmInstanceState::Stopping),
            (VmInstanceState::Stopping, VmInstanceState::Stopped),
            (VmInstanceState::Stopped, VmInstanceState::Starting),
            (VmInstanceState::Starting, VmInstanceState::Running),
        ]
    );
    assert_eq!(spawn_count(&seen), 1);
    vm.shutdown().await;
}

#[tokio::test]
async fn restart_of_unreachable_vm_just_starts_it() {
    let h = Harness::new(1, SLEEPER).await;
    let vm = h.orchestrator();

    vm.restart().await.unwrap();
    assert_eq!(vm.state(), VmInstanceState::Running);
    vm.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_pending_ensure_ready() {
    let mut h = Harness::new(u32::MAX, SLEEPER).await;
    h.settings.timeouts.startup_ms = 30_000;
    let vm = Arc::new(h.orchestrator());

    let starter = {
        let vm = vm.clone();
        tokio::spawn(async move { vm.ensure_ready().await })
    };
    let mut state = vm.watch_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == VmInstanceState::Starting),
    )
    .await
    .unwrap()
    .unwrap();

    let started = Instant::now();
    vm.shutdown().await;
    let result = starter.await.unwrap();

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(vm.state(), VmInstanceState::Stopped);
}

#[tokio::test]
async fn endpoint_is_fixed_regardless_of_state() {
    let h = Harness::new(1, SLEEPER).await;
    let vm = h.orchestrator();
    let expected = format!("http://localhost:{}", h.agent.port);
    assert_eq!(vm.endpoint(), expected);
    vm.ensure_ready().await.unwrap();
    assert_eq!(vm.endpoint(), expected);
    vm.shutdown().await;
    assert_eq!(vm.endpoint(), expected);
}
