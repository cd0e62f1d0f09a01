//! luna-vm: operator CLI for the Luna agent VM.
//!
//! Thin wrapper over [`luna_vm::LifecycleOrchestrator`] for checking a host,
//! provisioning the image and running the VM in the foreground.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use luna_vm::vm::{HealthPoller, SystemProbe, allocate, capability, hypervisor};
use luna_vm::{AppPaths, LifecycleOrchestrator, VmSettings, logging};

/// Luna agent VM lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "luna-vm", version, about = "Luna agent VM lifecycle manager")]
struct Args {
    /// Settings file (defaults to <config>/vm.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Keep config, images and logs under this directory instead of the
    /// per-user locations
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report host capabilities, requirements and the selected backend
    Check,
    /// Unpack and configure the VM image without starting it
    Provision,
    /// Start the VM, wait for the agent and keep it running until Ctrl-C
    Run {
        /// Print lifecycle events as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Probe the agent's health endpoint once
    Status,
    /// Print the agent endpoint URL
    Endpoint,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let paths = match &args.root {
        Some(root) => AppPaths::under(root),
        None => AppPaths::resolve().context("cannot determine home directory")?,
    };
    let _log_guard = logging::init(Some(&paths.logs));

    let settings_file = args.config.clone().unwrap_or_else(|| paths.settings_file());
    let settings = VmSettings::load(&settings_file)
        .with_context(|| format!("loading {}", settings_file.display()))?;

    match args.command {
        Command::Check => check(&settings, &paths),
        Command::Endpoint => {
            println!("{}", settings.endpoint());
            Ok(())
        }
        Command::Status => status(&settings).await,
        Command::Provision => {
            paths.ensure().context("creating application directories")?;
            let vm = LifecycleOrchestrator::new(settings, paths)?;
            let outcome = vm.ensure_provisioned().await?;
            println!("{outcome:?}");
            Ok(())
        }
        Command::Run { events } => {
            paths.ensure().context("creating application directories")?;
            run(LifecycleOrchestrator::new(settings, paths)?, events).await
        }
    }
}

fn check(settings: &VmSettings, paths: &AppPaths) -> Result<()> {
    use luna_vm::vm::CapabilityProbe;

    let caps = SystemProbe::new(&paths.data).probe();
    let report = capability::evaluate(&caps, &settings.requirements);
    let budget = allocate(&caps, &settings.resources);
    let backend = match settings.launch.backend {
        Some(backend) => backend.to_string(),
        None => hypervisor::detect()
            .map(|b| b.to_string())
            .unwrap_or_else(|e| format!("none ({e})")),
    };

    println!("memory:    {:.1} GiB", caps.total_memory_gib());
    println!("cpu cores: {}", caps.cpu_core_count);
    println!(
        "free disk: {:.1} GiB",
        caps.available_disk_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
    );
    println!("backend:   {backend}");
    println!("budget:    {} MiB, {} vCPU", budget.memory_mb, budget.cpu_count);

    if report.is_satisfied() {
        println!("requirements: ok");
        Ok(())
    } else {
        for shortfall in &report.shortfalls {
            println!("requirements: {shortfall}");
        }
        bail!("host does not meet minimum requirements")
    }
}

async fn status(settings: &VmSettings) -> Result<()> {
    let poller = HealthPoller::new(
        &settings.endpoint(),
        &settings.agent.health_path,
        settings.timeouts.request(),
        settings.timeouts.poll_interval(),
    )?;
    let status = poller.check_once().await;
    let report = serde_json::json!({
        "endpoint": settings.endpoint(),
        "reachable": status.reachable,
        "ready": status.ready,
        "http_status": status.http_status,
        "version": status.version(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(vm: LifecycleOrchestrator, print_events: bool) -> Result<()> {
    let mut events = vm.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if print_events {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            }
        }
    });

    let result = tokio::select! {
        ready = vm.ensure_ready() => ready,
        _ = tokio::signal::ctrl_c() => Err(luna_vm::Error::Cancelled),
    };
    if let Err(e) = result {
        let outcome = vm.shutdown().await;
        info!(?outcome, "shut down after failed start");
        return Err(e).context("starting VM");
    }

    println!("agent ready at {}", vm.endpoint());
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    info!("Ctrl-C received, shutting down");
    let outcome = vm.shutdown().await;
    println!("stopped ({outcome:?})");

    drop(vm);
    let _ = printer.await;
    Ok(())
}
