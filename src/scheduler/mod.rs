//! The scheduler (spec §4.3): timer-driven context switching across three
//! priority classes, plus the post-quantum housekeeping that drives sleep
//! expiry, stopped→ready promotion, and zombie waiter rescans.

pub mod context;

use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_queue::SegQueue;

use crate::config::Config;
use crate::hostsig::{self, ForwardedSignal};
use crate::kernel::Kernel;
use crate::logging::{log_transition, Event};
use crate::pcb::{Pid, Status};

/// The timer-driven context switcher. Owns the schedule-table cursor; the
/// ready/blocked/stopped/zombie queues themselves live in [`Kernel`] since
/// both the kernel surface (K) and the scheduler (S) need to walk them
/// (spec §2).
pub struct Scheduler {
    kernel: Arc<Kernel>,
    schedule_table: [i8; 19],
    slot_idx: Cell<usize>,
    quantum_duration: Duration,
    hostsig_queue: Option<Arc<SegQueue<ForwardedSignal>>>,
}

impl Scheduler {
    pub fn new(kernel: Arc<Kernel>, config: &Config) -> Self {
        Self {
            kernel,
            schedule_table: config.schedule_table,
            slot_idx: Cell::new(0),
            quantum_duration: Duration::from_millis(config.quantum_ms),
            hostsig_queue: None,
        }
    }

    /// Installs the host-signal bridge (spec §5); optional, since tests
    /// construct a `Scheduler` without a real terminal.
    pub fn with_host_signals(mut self) -> std::io::Result<Self> {
        self.hostsig_queue = Some(hostsig::install()?);
        Ok(self)
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// spec §4.3 "Selection policy": advances the 19-slot cursor until a
    /// non-empty class is found, enqueuing idle if every ready queue is
    /// empty (spec §4.3 "Idle").
    fn pick_next(&self) -> Pid {
        loop {
            let idx = self.slot_idx.get();
            self.slot_idx.set((idx + 1) % self.schedule_table.len());
            let class = self.schedule_table[idx];
            if let Some(pid) = self.kernel.pop_ready(class) {
                return pid;
            }
            if self.kernel.all_ready_empty() {
                if let Some(idle) = self.kernel.idle_pid() {
                    self.kernel.requeue_ready(idle);
                }
            }
        }
    }

    /// spec §4.3 "Running one slice".
    fn run_slice(&self, pid: Pid) {
        self.kernel.mark_running(pid);
        let quantum = self.kernel.increment_quantum();
        if let Some(view) = self.kernel.view(pid) {
            log_transition(quantum, Event::Schedule, pid, view.priority, &view.name);
        }
        let Some(turnstile) = self.kernel.turnstile(pid) else {
            self.kernel.log_scheduler_inconsistency(&format!("pid {pid} has no turnstile"));
            return;
        };
        if !turnstile.grant_and_await_return() {
            // The body thread already shut down (e.g. a concurrent TERM
            // reaped it mid-slice). Nothing further to do this slice.
            return;
        }

        match self.kernel.status_of(pid) {
            Some(Status::Running) => self.kernel.requeue_ready(pid),
            Some(Status::Zombie) | Some(Status::Stopped) => self.kernel.notify_waiters(pid),
            Some(Status::Blocked) => { /* already moved by the body via wait/sleep */ }
            Some(Status::Terminated) => self.kernel.cleanup(pid),
            Some(Status::Ready) => { /* already requeued by the body, e.g. via nice() */ }
            None => self
                .kernel
                .log_scheduler_inconsistency(&format!("pid {pid} vanished mid-slice")),
        }
    }

    /// spec §4.3 "Post-quantum housekeeping".
    fn housekeeping(&self) {
        for pid in self.kernel.tick_sleepers(self.quantum_duration.as_millis() as i64) {
            self.kernel.notify_waiters(pid);
        }
        self.kernel.promote_stopped_to_ready();
        for pid in self.kernel.zombie_pids() {
            self.kernel.notify_waiters(pid);
        }
        if let Some(queue) = &self.hostsig_queue {
            hostsig::drain_and_apply(queue, self.kernel.foreground(), &self.kernel);
        }
    }

    /// Runs quanta until `should_stop` returns `true`, checked after each
    /// quantum's housekeeping.
    pub fn run_until(&self, mut should_stop: impl FnMut(&Kernel) -> bool) {
        loop {
            std::thread::sleep(self.quantum_duration);
            let pid = self.pick_next();
            self.run_slice(pid);
            self.housekeeping();
            if should_stop(&self.kernel) {
                break;
            }
        }
    }

    /// Runs exactly one quantum; used by tests that need fine control.
    pub fn step(&self) {
        let pid = self.pick_next();
        self.run_slice(pid);
        self.housekeeping();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fs_state::FsState;
    use crate::pcb::{PRIO_HIGH, PRIO_LOW, PRIO_ZERO};

    /// spec §8 invariant 7: over 19 consecutive quanta with all three ready
    /// queues kept non-empty, the selection cursor visits high/zero/low
    /// exactly 9/6/4 times (the schedule table's own composition, since
    /// `pick_next` never skips a slot whose class is non-empty).
    #[test]
    fn schedule_ratio_over_19_quanta() {
        let config = Config::default();
        let kernel = Kernel::new(config.clone(), FsState::new(config.max_global_fds));
        let scheduler = Scheduler::new(kernel.clone(), &config);

        let high = kernel.create(0, "h", "h");
        kernel.renice(high, PRIO_HIGH);
        let zero = kernel.create(0, "z", "z");
        kernel.renice(zero, PRIO_ZERO);
        let low = kernel.create(0, "l", "l");
        kernel.renice(low, PRIO_LOW);

        let (mut n_high, mut n_zero, mut n_low) = (0, 0, 0);
        for _ in 0..19 {
            let pid = scheduler.pick_next();
            match kernel.view(pid).unwrap().priority {
                PRIO_HIGH => n_high += 1,
                PRIO_ZERO => n_zero += 1,
                PRIO_LOW => n_low += 1,
                _ => unreachable!(),
            }
            // Simulate "still runnable": put it straight back so every ready
            // class stays non-empty for the whole run, as the invariant
            // requires.
            kernel.requeue_ready(pid);
        }

        assert_eq!(n_high, 9);
        assert_eq!(n_zero, 6);
        assert_eq!(n_low, 4);
    }
}
