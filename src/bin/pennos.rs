//! The PennOS host binary: parses arguments, mounts the FAT image, boots
//! `init`/`idle`, and drives the scheduler until shutdown (spec §6).
//!
//! Building an interactive shell on top of [`pennos::process`] is left to an
//! external collaborator (spec.md §1 Non-goals); this binary's own "init"
//! just reaps orphaned zombies, which is enough to drive and demonstrate the
//! scheduler/kernel/filesystem stack end to end.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use pennos::config::Config;
use pennos::fs_state::FsState;
use pennos::kernel::Kernel;
use pennos::pcb::{Pid, Status};
use pennos::process::{self, ProcessHandle};
use pennos::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "pennos", about = "A teaching OS core: scheduler, process lifecycle, FAT fs")]
struct Args {
    /// Path to the backing FAT image. Created with `--mkfs` if it doesn't
    /// exist.
    image: PathBuf,

    /// Optional TOML configuration file (spec §3/§4 defaults otherwise).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Format `image` as a fresh filesystem before mounting (spec §4.5
    /// `mkfs`) instead of mounting an existing one.
    #[arg(long)]
    mkfs: bool,

    /// `mkfs`'s `blocks_in_fat` parameter, 1..=32.
    #[arg(long, default_value_t = 1)]
    mkfs_blocks_in_fat: u16,

    /// `mkfs`'s `block_size_config` parameter, 0..=4 (`256 << n` bytes).
    #[arg(long, default_value_t = 0)]
    mkfs_block_size: u8,
}

/// `init`'s body (pid 1): reaps every orphaned zombie once a quantum (spec
/// §4.2 "orphan adoption"), otherwise idles. Never exits on its own; the host
/// terminal's Ctrl-C/SIGQUIT reaches it only while it is the foreground PCB.
fn init_entry(handle: &ProcessHandle, _argv: &[String]) {
    loop {
        let _ = handle.wait(-1, true);
        if !handle.checkpoint() {
            return;
        }
    }
}

/// `idle`'s body: the schedule table always has something to dispatch when
/// every ready queue is empty (spec §4.3 "Idle"); it never reports, never
/// waits, never exits.
fn idle_entry(handle: &ProcessHandle, _argv: &[String]) {
    while handle.checkpoint() {}
}

fn boot(args: &Args) -> Result<Arc<Kernel>, String> {
    let config = match &args.config {
        Some(path) => Config::load(path).map_err(|e| format!("config error: {e}"))?,
        None => Config::default(),
    };

    if args.mkfs {
        pennos::fat::FatFs::mkfs(&args.image, args.mkfs_blocks_in_fat, args.mkfs_block_size)
            .map_err(|e| format!("mkfs failed: {e}"))?;
    }

    let mut fs = FsState::new(config.max_global_fds);
    fs.mount(&args.image).map_err(|e| format!("mount failed: {e}"))?;

    let kernel = Kernel::new(config, fs);

    let init_pid = process::spawn(
        &kernel,
        0,
        Arc::new(init_entry),
        Vec::new(),
        pennos::fd::STDIN_GLOBAL,
        pennos::fd::STDOUT_GLOBAL,
        "init",
    )
    .map_err(|e| format!("failed to spawn init: {e}"))?;
    kernel.set_foreground(init_pid);

    process::spawn(
        &kernel,
        0,
        Arc::new(idle_entry),
        Vec::new(),
        pennos::fd::STDIN_GLOBAL,
        pennos::fd::STDOUT_GLOBAL,
        "idle",
    )
    .map_err(|e| format!("failed to spawn idle: {e}"))
    .map(|idle_pid| kernel.set_idle(idle_pid))?;

    Ok(kernel)
}

fn init_is_down(kernel: &Kernel, init_pid: Pid) -> bool {
    !matches!(
        kernel.status(init_pid),
        Some(Status::Ready) | Some(Status::Running) | Some(Status::Blocked) | Some(Status::Stopped)
    )
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let kernel = match boot(&args) {
        Ok(k) => k,
        Err(msg) => {
            log::error!("boot failed: {msg}");
            return ExitCode::FAILURE;
        }
    };

    let scheduler = match Scheduler::new(kernel.clone(), &kernel.config).with_host_signals() {
        Ok(s) => s,
        Err(e) => {
            log::warn!("host-signal bridge unavailable ({e}); running without terminal forwarding");
            Scheduler::new(kernel.clone(), &kernel.config)
        }
    };

    const INIT_PID: Pid = 1;
    scheduler.run_until(|k| init_is_down(k, INIT_PID));

    ExitCode::SUCCESS
}
