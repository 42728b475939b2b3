//! The Process Control Block: the per-process record the scheduler sees.
//!
//! Mirrors `spec.md` §3's PCB attributes. `execution_context` is not a raw
//! instruction-pointer/stack snapshot here (the original's `ucontext_t`); it
//! is a [`crate::scheduler::context::Turnstile`] handle — see SPEC_FULL.md
//! §4.7 for why that is an equivalent rewrite, not a behavior change.

use crate::scheduler::context::Turnstile;
use std::sync::Arc;

/// A process ID. Monotonically increasing; 1 is always `init`, 2 is always
/// the shell (assigned by the embedding host process, not by this crate).
pub type Pid = i32;

/// Sentinel priority classes, matching spec §3.
pub const PRIO_HIGH: i8 = -1;
pub const PRIO_ZERO: i8 = 0;
pub const PRIO_LOW: i8 = 1;

/// The number of per-process file descriptor slots (spec §3: `0..127`).
pub const MAX_PROCESS_FDS: usize = 128;

/// Sentinel value for an unused per-process fd slot.
pub const FD_FREE: i32 = -1;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Status {
    Ready,
    Blocked,
    Stopped,
    Running,
    Zombie,
    Terminated,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExitKind {
    NotExited,
    ExitedNormal,
    ExitedSignal,
    StoppedReported,
    NoChange,
}

/// A signal accepted by [`crate::kernel::kill`] / [`crate::process::kill`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Signal {
    Stop,
    Cont,
    Term,
}

/// Fixed-length mapping from per-process fd index to a global fd index, or
/// [`FD_FREE`].
#[derive(Debug, Clone)]
pub struct FdTable {
    slots: [i32; MAX_PROCESS_FDS],
}

impl Default for FdTable {
    fn default() -> Self {
        Self {
            slots: [FD_FREE; MAX_PROCESS_FDS],
        }
    }
}

impl FdTable {
    pub fn get(&self, idx: usize) -> Option<i32> {
        let v = *self.slots.get(idx)?;
        (v != FD_FREE).then_some(v)
    }

    pub fn set(&mut self, idx: usize, global: i32) {
        self.slots[idx] = global;
    }

    pub fn clear(&mut self, idx: usize) {
        self.slots[idx] = FD_FREE;
    }

    /// Returns the first unused slot, if any.
    pub fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|&v| v == FD_FREE)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, i32)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|&(_, &v)| v != FD_FREE)
            .map(|(i, &v)| (i, v))
    }
}

/// The Process Control Block.
#[derive(Debug)]
pub struct Pcb {
    pub pid: Pid,
    pub parent_pid: Pid,
    pub children: Vec<Pid>,
    pub open_fds: FdTable,
    pub priority: i8,
    pub status: Status,
    pub exit_kind: ExitKind,
    /// Short identifier used in log lines (spec §6).
    pub name: String,
    /// Full command line, used only for `ps` display (SPEC_FULL §3).
    pub command: String,
    pub wait_target: Pid,
    pub wait_observed_kind: ExitKind,
    pub sleep_ticks_remaining: i64,
    pub turnstile: Arc<Turnstile>,
}

impl Pcb {
    pub fn is_sleeping(&self) -> bool {
        self.sleep_ticks_remaining > 0
    }
}
