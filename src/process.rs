//! The process API (spec §4.4): `spawn`, `wait`, `kill`, `exit`, `nice`,
//! `sleep`, `fg`/`bg`. This is the surface a shell (or any other caller)
//! actually drives; [`crate::kernel::Kernel`] and [`crate::scheduler`] do the
//! bookkeeping underneath.
//!
//! Every PCB's body runs on its own OS thread (SPEC_FULL §4.7); `spawn`
//! starts that thread, parks it on the child's
//! [`crate::scheduler::context::Turnstile`] until the scheduler first grants
//! it, then runs `entry` to completion and falls through to `exit`. After
//! `exit`, the thread keeps answering `checkpoint()` forever — a PCB in
//! ZOMBIE/TERMINATED state still physically exists as a parked thread until
//! [`crate::kernel::Kernel::cleanup`] shuts its turnstile down.

use std::sync::Arc;

use crate::error::{FsError, ProcError};
use crate::fd::{OpenMode, ProcessFdView, SeekWhence, STDIN_GLOBAL, STDOUT_GLOBAL};
use crate::kernel::Kernel;
use crate::pcb::{ExitKind, Pid, Signal, Status};
use crate::scheduler::context::Turnstile;

/// A process's entry point: given a handle back into the kernel and its
/// `argv`, runs to completion (or loops forever, for `init`/`idle`).
pub type EntryFn = dyn Fn(&ProcessHandle, &[String]) + Send + Sync;

/// Passed to a body thread's `entry`; the only way process code should touch
/// the kernel (spec §4.4 lists `spawn`/`wait`/`kill`/`exit`/`nice`/`sleep` as
/// the operations a process performs on *itself and its children*).
pub struct ProcessHandle {
    kernel: Arc<Kernel>,
    pid: Pid,
    turnstile: Arc<Turnstile>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Voluntary yield point (spec §9's clean replacement for `while(1);`).
    /// Returns `false` if this PCB has been reaped and the thread should
    /// stop running immediately.
    pub fn checkpoint(&self) -> bool {
        self.turnstile.checkpoint()
    }

    pub fn spawn(
        &self,
        entry: Arc<EntryFn>,
        argv: Vec<String>,
        fd_in: i32,
        fd_out: i32,
        name: &str,
    ) -> Result<Pid, ProcError> {
        spawn(&self.kernel, self.pid, entry, argv, fd_in, fd_out, name)
    }

    pub fn wait(&self, target: Pid, nohang: bool) -> Result<(Pid, ExitKind), ProcError> {
        wait(&self.kernel, self.pid, target, nohang)
    }

    pub fn kill(&self, target: Pid, signal: Signal) {
        kill(&self.kernel, target, signal)
    }

    pub fn nice(&self, target: Pid, priority: i8) -> Result<(), ProcError> {
        nice(&self.kernel, target, priority)
    }

    /// Blocks the caller for `ticks` quanta (spec §4.4 `sleep`).
    pub fn sleep(&self, ticks: i64) {
        sleep(&self.kernel, self.pid, ticks)
    }

    pub fn fg(&self, target: Pid) -> Result<(), ProcError> {
        fg(&self.kernel, target)
    }

    pub fn bg(&self, target: Pid) -> Result<(), ProcError> {
        bg(&self.kernel, target)
    }

    /// spec §4.6 `open`: returns a per-process fd.
    pub fn open(&self, name: &str, mode: OpenMode) -> Result<usize, FsError> {
        open(&self.kernel, self.pid, name, mode)
    }

    /// spec §4.6 `close`.
    pub fn close(&self, fd: usize) -> Result<(), FsError> {
        close(&self.kernel, self.pid, fd)
    }

    /// spec §4.6 `read`.
    pub fn read(&self, fd: usize, n: usize) -> Result<Vec<u8>, FsError> {
        read(&self.kernel, self.pid, fd, n)
    }

    /// spec §4.6 `write`.
    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize, FsError> {
        write(&self.kernel, self.pid, fd, buf)
    }

    /// spec §4.6 `lseek`.
    pub fn lseek(&self, fd: usize, offset: i64, whence: SeekWhence) -> Result<u64, FsError> {
        lseek(&self.kernel, self.pid, fd, offset, whence)
    }

    /// spec §4.6 `unlink`.
    pub fn unlink(&self, name: &str) -> Result<(), FsError> {
        unlink(&self.kernel, name)
    }
}

/// spec §4.4 `spawn`: creates the child PCB, installs `fd_in`/`fd_out` as its
/// descriptors 0/1 (replacing whatever it inherited at those slots from its
/// parent), and starts its body thread parked at the turnstile.
pub fn spawn(
    kernel: &Arc<Kernel>,
    parent: Pid,
    entry: Arc<EntryFn>,
    argv: Vec<String>,
    fd_in: i32,
    fd_out: i32,
    name: &str,
) -> Result<Pid, ProcError> {
    if parent != 0 && !kernel.exists(parent) {
        return Err(ProcError::NoSuchPid(parent));
    }
    let command = if argv.is_empty() {
        name.to_string()
    } else {
        format!("{name} {}", argv.join(" "))
    };
    let pid = kernel.create(parent, name, &command);

    kernel.with_pcb_and_fs(pid, |pcb, fs| {
        for (slot, new_global) in [(0usize, fd_in), (1usize, fd_out)] {
            if let Some(old) = pcb.open_fds.get(slot) {
                let _ = fs.fds.close(old);
            }
            fs.fds.bump_ref(new_global);
            pcb.open_fds.set(slot, new_global);
        }
    });

    let turnstile = kernel.turnstile(pid).expect("just created");
    let thread_turnstile = turnstile.clone();
    let kernel_for_thread = kernel.clone();
    std::thread::Builder::new()
        .name(format!("pennos-pid{pid}"))
        .spawn(move || {
            if !thread_turnstile.wait_for_grant() {
                return;
            }
            let handle = ProcessHandle {
                kernel: kernel_for_thread.clone(),
                pid,
                turnstile: thread_turnstile.clone(),
            };
            entry(&handle, &argv);
            exit(&kernel_for_thread, pid);
            while thread_turnstile.checkpoint() {}
        })
        .map_err(|e| ProcError::SpawnFailure(e.to_string()))?;

    Ok(pid)
}

/// spec §4.4 `exit`: close every fd but stdin/stdout, mark ZOMBIE, wake a
/// waiting parent. Called automatically when `entry` returns; also callable
/// mid-body via [`ProcessHandle`] for processes that want to exit early
/// (callers should simply `return` from `entry` rather than call this twice).
pub fn exit(kernel: &Arc<Kernel>, pid: Pid) {
    let fds: Vec<(usize, i32)> = kernel
        .with_pcb_mut(pid, |p| p.open_fds.iter().collect())
        .unwrap_or_default();
    kernel.with_pcb_and_fs(pid, |pcb, fs| {
        for (idx, global) in &fds {
            if *global != STDIN_GLOBAL && *global != STDOUT_GLOBAL {
                let _ = fs.fds.close(*global);
                pcb.open_fds.clear(*idx);
            }
        }
    });
    kernel.finish_as_zombie(pid);
}

/// spec §4.4 `kill`: a thin pass-through to [`Kernel::kill`]; kept here so
/// the process API is the one place callers reach for signal delivery.
pub fn kill(kernel: &Arc<Kernel>, target: Pid, signal: Signal) {
    kernel.kill(target, signal);
}

/// spec §4.4 `nice`: reassigns priority, re-queuing immediately if currently
/// runnable.
pub fn nice(kernel: &Arc<Kernel>, target: Pid, priority: i8) -> Result<(), ProcError> {
    if !(-1..=1).contains(&priority) {
        return Err(ProcError::InvalidPriority(priority));
    }
    if kernel.renice(target, priority) {
        Ok(())
    } else {
        Err(ProcError::NoSuchPid(target))
    }
}

/// spec §4.4 `sleep`: spawns a "sleep" pseudo-child already in BLOCKED with
/// its countdown set, then blocks the caller on it exactly like `wait` would
/// (spec §5: "cancellable by TERM, pausable by STOP, CONT resumes the
/// countdown"). The pseudo-child shows up in `ps` like any other PCB, so a
/// shell can target it directly with `kill -STOP`/`kill -CONT`.
///
/// A STOP delivered to the pseudo-child wakes this `wait` the same way it
/// would for a real child (`StoppedReported`, spec §4.4 `wait`'s WUNTRACED-like
/// behavior) without reaping it — that must not be mistaken for the sleep
/// having elapsed, so the wait is re-issued until the pseudo-child actually
/// terminates.
pub fn sleep(kernel: &Arc<Kernel>, caller: Pid, ticks: i64) {
    let child = kernel.create(caller, "sleep", "sleep");
    kernel.make_sleep(child, ticks.max(0));
    loop {
        match wait(kernel, caller, child, false) {
            Ok((_, ExitKind::StoppedReported)) => continue,
            _ => break,
        }
    }
}

/// spec §4.4 `fg`: continues a stopped/sleeping process and makes it the
/// foreground process (spec §5's host-signal forwarding target).
pub fn fg(kernel: &Arc<Kernel>, target: Pid) -> Result<(), ProcError> {
    if !kernel.exists(target) {
        return Err(ProcError::NoSuchPid(target));
    }
    kernel.kill(target, Signal::Cont);
    kernel.set_foreground(target);
    Ok(())
}

/// spec §4.4 `bg`: continues a stopped/sleeping process without taking the
/// foreground.
pub fn bg(kernel: &Arc<Kernel>, target: Pid) -> Result<(), ProcError> {
    if !kernel.exists(target) {
        return Err(ProcError::NoSuchPid(target));
    }
    kernel.kill(target, Signal::Cont);
    Ok(())
}

/// Scans `caller`'s children for one already satisfying `target` (a specific
/// pid, or `-1` for "any"), without blocking. Reaps terminal matches.
fn poll_once(kernel: &Arc<Kernel>, caller: Pid, target: Pid) -> Result<Option<(Pid, ExitKind)>, ProcError> {
    let view = kernel.view(caller).ok_or(ProcError::NoSuchPid(caller))?;
    if target != -1 && !view.children.contains(&target) {
        return Err(ProcError::WrongParent(target));
    }
    if target != -1 && kernel.status_of(target) == Some(Status::Terminated) {
        return Err(ProcError::AlreadyWaitedOn);
    }
    let candidates: Vec<Pid> = if target == -1 { view.children } else { vec![target] };
    for child in candidates {
        let Some(status) = kernel.status_of(child) else { continue };
        match status {
            Status::Zombie => {
                let kind = kernel.view(child).map(|v| v.exit_kind).unwrap_or(ExitKind::NotExited);
                kernel.cleanup(child);
                return Ok(Some((child, kind)));
            }
            Status::Stopped => {
                let already_reported =
                    kernel.view(child).map(|v| v.exit_kind == ExitKind::NoChange).unwrap_or(true);
                if !already_reported {
                    kernel.with_pcb_mut(child, |p| p.exit_kind = ExitKind::NoChange);
                    return Ok(Some((child, ExitKind::StoppedReported)));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

/// spec §4.4 `wait`: blocking or `nohang` reap of a specific child (or any
/// child, `target == -1`).
pub fn wait(kernel: &Arc<Kernel>, caller: Pid, target: Pid, nohang: bool) -> Result<(Pid, ExitKind), ProcError> {
    let view = kernel.view(caller).ok_or(ProcError::NoSuchPid(caller))?;
    if view.children.is_empty() {
        return Err(ProcError::NoChildren);
    }
    if let Some(found) = poll_once(kernel, caller, target)? {
        return Ok(found);
    }
    if nohang {
        return Ok((0, ExitKind::NotExited));
    }

    kernel.with_pcb_mut(caller, |p| {
        p.wait_target = target;
        p.status = Status::Blocked;
        p.wait_observed_kind = ExitKind::NotExited;
    });
    kernel.move_to_blocked(caller);
    let turnstile = kernel.turnstile(caller).ok_or(ProcError::NoSuchPid(caller))?;
    if !turnstile.checkpoint() {
        return Err(ProcError::NoSuchPid(caller));
    }

    let observed = kernel
        .with_pcb_mut(caller, |p| {
            let pid = p.wait_target;
            let kind = p.wait_observed_kind;
            p.wait_target = 0;
            (pid, kind)
        })
        .ok_or(ProcError::NoSuchPid(caller))?;

    if matches!(observed.1, ExitKind::ExitedNormal | ExitKind::ExitedSignal) {
        kernel.cleanup(observed.0);
    }
    Ok(observed)
}

/// spec §4.6 `open`: allocates (or reuses) a global fd and installs it at a
/// free slot in `caller`'s own descriptor table, returning that per-process
/// fd (not the global index — callers never see global indices directly).
pub fn open(kernel: &Arc<Kernel>, caller: Pid, name: &str, mode: OpenMode) -> Result<usize, FsError> {
    kernel
        .with_pcb_and_fs(caller, |pcb, fs| {
            let fat = fs.fat.as_mut().ok_or(FsError::NotMounted)?;
            let mut view = ProcessFdView {
                table: &mut pcb.open_fds,
                global: &mut fs.fds,
            };
            view.open(fat, name, mode)
        })
        .ok_or(FsError::InvalidFd)?
}

/// spec §4.6 `close`.
pub fn close(kernel: &Arc<Kernel>, caller: Pid, fd: usize) -> Result<(), FsError> {
    kernel
        .with_pcb_and_fs(caller, |pcb, fs| {
            let mut view = ProcessFdView {
                table: &mut pcb.open_fds,
                global: &mut fs.fds,
            };
            view.close(fd)
        })
        .ok_or(FsError::InvalidFd)?
}

/// spec §4.6 `read`.
pub fn read(kernel: &Arc<Kernel>, caller: Pid, fd: usize, n: usize) -> Result<Vec<u8>, FsError> {
    kernel
        .with_pcb_and_fs(caller, |pcb, fs| {
            let global = pcb.open_fds.get(fd).ok_or(FsError::InvalidFd)?;
            let fat = fs.fat.as_mut().ok_or(FsError::NotMounted)?;
            fs.fds.read(fat, global, n)
        })
        .ok_or(FsError::InvalidFd)?
}

/// spec §4.6 `write`.
pub fn write(kernel: &Arc<Kernel>, caller: Pid, fd: usize, buf: &[u8]) -> Result<usize, FsError> {
    kernel
        .with_pcb_and_fs(caller, |pcb, fs| {
            let global = pcb.open_fds.get(fd).ok_or(FsError::InvalidFd)?;
            let fat = fs.fat.as_mut().ok_or(FsError::NotMounted)?;
            fs.fds.write(fat, global, buf)
        })
        .ok_or(FsError::InvalidFd)?
}

/// spec §4.6 `lseek`.
pub fn lseek(kernel: &Arc<Kernel>, caller: Pid, fd: usize, offset: i64, whence: SeekWhence) -> Result<u64, FsError> {
    kernel
        .with_pcb_and_fs(caller, |pcb, fs| {
            let global = pcb.open_fds.get(fd).ok_or(FsError::InvalidFd)?;
            fs.fds.lseek(global, offset, whence)
        })
        .ok_or(FsError::InvalidFd)?
}

/// spec §4.6 `unlink`: a filesystem-wide operation, not scoped to a single
/// process's descriptor table (any process's open fd on `name` blocks it).
pub fn unlink(kernel: &Arc<Kernel>, name: &str) -> Result<(), FsError> {
    let mut fs = kernel.fs.lock().unwrap();
    fs.unlink(name)
}
