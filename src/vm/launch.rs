//! Backend-specific launch command construction.
//!
//! Each [`HypervisorBackend`] variant maps to one argument builder; the
//! supervisor only ever sees the resulting [`LaunchPlan`], so no platform
//! checks leak into the orchestrator.

use std::path::Path;

use crate::config::BinarySettings;

use super::hypervisor::HypervisorBackend;
use super::resources::VmResourceBudget;

/// One external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Commands to run for one start attempt: `prepare` steps run to completion
/// in order, then `main` is spawned and supervised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub prepare: Vec<LaunchCommand>,
    pub main: LaunchCommand,
}

/// Everything a launcher needs to know about this start attempt.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub budget: VmResourceBudget,
    pub host_port: u16,
    pub guest_port: u16,
    pub vm_name: &'a str,
    pub image_dir: &'a Path,
    pub disk: &'a Path,
}

/// Strategy producing the launch plan.
pub trait Launcher: Send + Sync {
    fn plan(&self, ctx: &LaunchContext<'_>) -> LaunchPlan;

    /// Short name for logs.
    fn describe(&self) -> String;
}

/// Launcher for one of the built-in backends.
#[derive(Debug, Clone)]
pub struct BackendLauncher {
    backend: HypervisorBackend,
    binaries: BinarySettings,
}

impl BackendLauncher {
    pub fn new(backend: HypervisorBackend, binaries: BinarySettings) -> Self {
        Self { backend, binaries }
    }

    pub fn backend(&self) -> HypervisorBackend {
        self.backend
    }
}

impl Launcher for BackendLauncher {
    fn plan(&self, ctx: &LaunchContext<'_>) -> LaunchPlan {
        match self.backend {
            HypervisorBackend::Kvm => qemu_plan(&self.binaries.qemu, QemuAccel::Kvm, ctx),
            HypervisorBackend::QemuFallback => qemu_plan(&self.binaries.qemu, QemuAccel::Tcg, ctx),
            HypervisorBackend::HyperV => qemu_plan(&self.binaries.qemu, QemuAccel::Whpx, ctx),
            HypervisorBackend::VirtualBoxWin => virtualbox_plan(&self.binaries, ctx),
            HypervisorBackend::AppleHypervisor => apple_plan(&self.binaries.apple_helper, ctx),
        }
    }

    fn describe(&self) -> String {
        self.backend.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QemuAccel {
    Kvm,
    Tcg,
    Whpx,
}

fn qemu_plan(qemu: &str, accel: QemuAccel, ctx: &LaunchContext<'_>) -> LaunchPlan {
    let accel_arg = match accel {
        QemuAccel::Kvm => "kvm",
        QemuAccel::Tcg => "tcg",
        QemuAccel::Whpx => "whpx",
    };
    let format = match ctx.disk.extension().and_then(|e| e.to_str()) {
        Some("qcow2") => "qcow2",
        _ => "raw",
    };

    let mut main = LaunchCommand::new(qemu)
        .args(["-name", ctx.vm_name])
        .args(["-machine", "q35"])
        .args(["-accel", accel_arg]);
    if accel == QemuAccel::Kvm {
        main = main.args(["-cpu", "host"]);
    }
    let main = main
        .arg("-m")
        .arg(ctx.budget.memory_mb.to_string())
        .arg("-smp")
        .arg(ctx.budget.cpu_count.to_string())
        .arg("-drive")
        .arg(format!(
            "file={},format={format},if=virtio",
            ctx.disk.display()
        ))
        .arg("-netdev")
        .arg(format!(
            "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:{}",
            ctx.host_port, ctx.guest_port
        ))
        .args(["-device", "virtio-net-pci,netdev=net0"])
        .args(["-display", "none"])
        .args(["-serial", "stdio"]);

    LaunchPlan {
        prepare: Vec::new(),
        main,
    }
}

fn virtualbox_plan(binaries: &BinarySettings, ctx: &LaunchContext<'_>) -> LaunchPlan {
    // Resources are re-applied on every start since the budget is recomputed.
    let modify = LaunchCommand::new(&binaries.vbox_manage)
        .args(["modifyvm", ctx.vm_name])
        .arg("--memory")
        .arg(ctx.budget.memory_mb.to_string())
        .arg("--cpus")
        .arg(ctx.budget.cpu_count.to_string());

    let main = LaunchCommand::new(&binaries.vbox_headless).args(["--startvm", ctx.vm_name]);

    LaunchPlan {
        prepare: vec![modify],
        main,
    }
}

fn apple_plan(helper: &str, ctx: &LaunchContext<'_>) -> LaunchPlan {
    let main = LaunchCommand::new(helper)
        .arg("--headless")
        .arg("--port")
        .arg(ctx.host_port.to_string())
        .arg("--guest-port")
        .arg(ctx.guest_port.to_string())
        .arg("--memory")
        .arg(ctx.budget.memory_mb.to_string())
        .arg("--cpus")
        .arg(ctx.budget.cpu_count.to_string())
        .arg("--disk")
        .arg(ctx.disk.display().to_string());

    LaunchPlan {
        prepare: Vec::new(),
        main,
    }
}

/// Launcher running a user-supplied argv with placeholder substitution.
#[derive(Debug, Clone)]
pub struct CustomLauncher {
    argv: Vec<String>,
}

impl CustomLauncher {
    /// `argv` must not be empty.
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(Self { argv })
        }
    }
}

impl Launcher for CustomLauncher {
    fn plan(&self, ctx: &LaunchContext<'_>) -> LaunchPlan {
        let substitute = |s: &String| {
            s.replace("{memory_mb}", &ctx.budget.memory_mb.to_string())
                .replace("{cpus}", &ctx.budget.cpu_count.to_string())
                .replace("{port}", &ctx.host_port.to_string())
                .replace("{guest_port}", &ctx.guest_port.to_string())
                .replace("{disk}", &ctx.disk.display().to_string())
                .replace("{image_dir}", &ctx.image_dir.display().to_string())
        };
        let mut parts = self.argv.iter().map(substitute);
        // `new` guarantees at least one element.
        let program = parts.next().unwrap_or_default();

        LaunchPlan {
            prepare: Vec::new(),
            main: LaunchCommand::new(program).args(parts),
        }
    }

    fn describe(&self) -> String {
        format!("custom ({})", self.argv[0])
    }
}
