//! The kernel surface (spec §4.2): process creation, signal delivery,
//! zombie reaping, and the queue-walk helpers the scheduler drives.
//!
//! `Inner` is the single source of truth for every PCB and every
//! scheduler-visible queue; it is guarded by one [`Mutex`] so that "only one
//! PCB mutates shared state at a time" (spec §5) is a real invariant, not
//! just a convention. Process bodies only ever reach it through [`Kernel`]'s
//! methods — never by holding the lock across a [`crate::scheduler::context::Turnstile`]
//! yield.

use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::deque::Deque;
use crate::fs_state::FsState;
use crate::logging::{log_inconsistency, log_transition, Event};
use crate::pcb::{ExitKind, FdTable, Pcb, Pid, Signal, Status, PRIO_ZERO};
use crate::scheduler::context::Turnstile;

fn prio_idx(priority: i8) -> usize {
    (priority + 1) as usize
}

/// A read-only snapshot of a PCB, safe to hand back across the lock (spec
/// §4.2's `lookup`, and the `ps` table in SPEC_FULL §3).
#[derive(Debug, Clone)]
pub struct PcbView {
    pub pid: Pid,
    pub parent_pid: Pid,
    pub priority: i8,
    pub status: Status,
    pub exit_kind: ExitKind,
    pub name: String,
    pub command: String,
    pub children: Vec<Pid>,
}

impl From<&Pcb> for PcbView {
    fn from(p: &Pcb) -> Self {
        Self {
            pid: p.pid,
            parent_pid: p.parent_pid,
            priority: p.priority,
            status: p.status,
            exit_kind: p.exit_kind,
            name: p.name.clone(),
            command: p.command.clone(),
            children: p.children.clone(),
        }
    }
}

struct Inner {
    pcbs: Vec<Option<Pcb>>,
    next_pid: Pid,
    ready: [Deque<Pid>; 3],
    blocked: Deque<Pid>,
    stopped: Deque<Pid>,
    zombie: Deque<Pid>,
    idle_pid: Option<Pid>,
    quantum: u64,
    foreground_pid: Pid,
}

impl Inner {
    fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.pcbs.get((pid - 1) as usize)?.as_ref()
    }

    fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.pcbs.get_mut((pid - 1) as usize)?.as_mut()
    }

    fn ready_queue_mut(&mut self, priority: i8) -> &mut Deque<Pid> {
        &mut self.ready[prio_idx(priority)]
    }

    fn remove_from_all_queues(&mut self, pid: Pid) {
        for q in self.ready.iter_mut() {
            q.remove_where(|p| *p == pid);
        }
        self.blocked.remove_where(|p| *p == pid);
        self.stopped.remove_where(|p| *p == pid);
        self.zombie.remove_where(|p| *p == pid);
    }

    fn enqueue_ready(&mut self, pid: Pid, priority: i8) {
        self.ready_queue_mut(priority).push_back(pid);
    }
}

/// The kernel: process registry, scheduler-visible queues, and the global
/// file-system/fd state (spec §2's K and S share these; see kernel.rs's
/// module doc for why they live in one lock).
pub struct Kernel {
    inner: Mutex<Inner>,
    pub fs: Mutex<FsState>,
    pub config: Config,
}

impl Kernel {
    pub fn new(config: Config, fs: FsState) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                pcbs: Vec::new(),
                next_pid: 1,
                ready: [Deque::new(), Deque::new(), Deque::new()],
                blocked: Deque::new(),
                stopped: Deque::new(),
                zombie: Deque::new(),
                idle_pid: None,
                quantum: 0,
                foreground_pid: 0,
            }),
            fs: Mutex::new(fs),
            config,
        })
    }

    pub fn quantum(&self) -> u64 {
        self.inner.lock().unwrap().quantum
    }

    pub(crate) fn increment_quantum(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.quantum += 1;
        inner.quantum
    }

    pub fn foreground(&self) -> Pid {
        self.inner.lock().unwrap().foreground_pid
    }

    pub fn set_foreground(&self, pid: Pid) {
        self.inner.lock().unwrap().foreground_pid = pid;
    }

    fn bump_fd_refs(&self, fds: &FdTable) {
        let mut fs = self.fs.lock().unwrap();
        for (_, global) in fds.iter() {
            fs.fds.bump_ref(global);
        }
    }

    /// spec §4.2 `create`. `parent_pid == 0` creates `init` (pid 1) itself,
    /// which has no parent and priority 0.
    pub fn create(&self, parent_pid: Pid, name: &str, command: &str) -> Pid {
        let (pid, priority, open_fds) = {
            let mut inner = self.inner.lock().unwrap();
            let pid = inner.next_pid;
            inner.next_pid += 1;

            let (priority, open_fds) = if parent_pid == 0 {
                (PRIO_ZERO, FdTable::default())
            } else {
                let parent = inner.get(parent_pid).expect("parent PCB must exist");
                // spec §4.2/§9: children of the shell (pid 2) always get
                // priority 0, regardless of the shell's own priority.
                let priority = if parent_pid == 2 { PRIO_ZERO } else { parent.priority };
                (priority, parent.open_fds.clone())
            };

            let turnstile = Arc::new(Turnstile::new());
            let pcb = Pcb {
                pid,
                parent_pid,
                children: Vec::new(),
                open_fds,
                priority,
                status: Status::Ready,
                exit_kind: ExitKind::NotExited,
                name: name.to_string(),
                command: command.to_string(),
                wait_target: 0,
                wait_observed_kind: ExitKind::NotExited,
                sleep_ticks_remaining: -1,
                turnstile,
            };
            debug_assert_eq!(inner.pcbs.len() as Pid, pid - 1);
            inner.pcbs.push(Some(pcb));
            if parent_pid != 0 {
                inner.get_mut(parent_pid).unwrap().children.push(pid);
            }
            inner.enqueue_ready(pid, priority);
            (pid, priority, inner.get(pid).unwrap().open_fds.clone())
        };
        self.bump_fd_refs(&open_fds);
        log_transition(self.quantum(), Event::Create, pid, priority, name);
        pid
    }

    pub fn turnstile(&self, pid: Pid) -> Option<Arc<Turnstile>> {
        self.inner.lock().unwrap().get(pid).map(|p| p.turnstile.clone())
    }

    pub fn view(&self, pid: Pid) -> Option<PcbView> {
        self.inner.lock().unwrap().get(pid).map(PcbView::from)
    }

    pub fn with_pcb_mut<R>(&self, pid: Pid, f: impl FnOnce(&mut Pcb) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.get_mut(pid).map(f)
    }

    /// Locks the registry and the fs state together, always in that order,
    /// so fd operations can touch both a PCB's per-process [`FdTable`] and
    /// the global fd table/mounted [`FatFs`] atomically (spec §4.6).
    pub fn with_pcb_and_fs<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut Pcb, &mut FsState) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        let pcb = inner.get_mut(pid)?;
        let mut fs = self.fs.lock().unwrap();
        Some(f(pcb, &mut fs))
    }

    /// spec §4.2 `lookup`.
    pub fn exists(&self, pid: Pid) -> bool {
        self.inner.lock().unwrap().get(pid).is_some()
    }

    /// spec §4.2 `kill`: STOP/TERM/CONT semantics, including the sleep-state
    /// transition and waiter notification.
    pub fn kill(&self, target: Pid, signal: Signal) {
        let (name, priority, already_terminated) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(pcb) = inner.get_mut(target) else {
                return;
            };
            if pcb.status == Status::Terminated {
                return;
            }
            match signal {
                Signal::Stop => {
                    inner.remove_from_all_queues(target);
                    let pcb = inner.get_mut(target).unwrap();
                    pcb.status = Status::Stopped;
                    pcb.exit_kind = ExitKind::StoppedReported;
                    inner.stopped.push_back(target);
                }
                Signal::Term => {
                    inner.remove_from_all_queues(target);
                    let pcb = inner.get_mut(target).unwrap();
                    pcb.status = Status::Zombie;
                    pcb.exit_kind = ExitKind::ExitedSignal;
                    pcb.sleep_ticks_remaining = -1;
                    inner.zombie.push_back(target);
                }
                Signal::Cont => {
                    inner.remove_from_all_queues(target);
                    let pcb = inner.get_mut(target).unwrap();
                    if pcb.name == "sleep" && pcb.sleep_ticks_remaining > 0 {
                        // spec §5: CONT returns a sleeper to BLOCKED with its
                        // remainder counting down, not to READY — a sleeper
                        // is never itself dispatched.
                        pcb.status = Status::Blocked;
                        inner.blocked.push_back(target);
                    } else {
                        let priority = pcb.priority;
                        pcb.status = Status::Ready;
                        inner.enqueue_ready(target, priority);
                    }
                }
            }
            let pcb = inner.get(target).unwrap();
            (pcb.name.clone(), pcb.priority, false)
        };
        if already_terminated {
            return;
        }
        let quantum = self.quantum();
        let event = match signal {
            Signal::Stop => Event::Stopped,
            Signal::Term => Event::Signaled,
            Signal::Cont => Event::Continued,
        };
        log_transition(quantum, event, target, priority, &name);
        self.notify_waiters(target);
    }

    /// spec §4.3.4 `notify_waiters`.
    pub fn notify_waiters(&self, p: Pid) {
        let mut inner = self.inner.lock().unwrap();
        let Some((p_status, p_exit_kind, parent_pid)) =
            inner.get(p).map(|pcb| (pcb.status, pcb.exit_kind, pcb.parent_pid))
        else {
            return;
        };
        let Some(parent) = inner.blocked.iter().copied().find(|&pid| pid == parent_pid) else {
            return;
        };
        let parent_waits_for_this = {
            let parent_pcb = inner.get(parent).unwrap();
            parent_pcb.wait_target == -1 || parent_pcb.wait_target == p
        };
        if !parent_waits_for_this {
            return;
        }
        if inner.get(parent).unwrap().wait_target == -1 {
            inner.get_mut(parent).unwrap().wait_target = p;
        }
        match p_status {
            Status::Zombie => {
                inner.get_mut(parent).unwrap().wait_observed_kind = p_exit_kind;
            }
            Status::Stopped => {
                inner.get_mut(parent).unwrap().wait_observed_kind = ExitKind::StoppedReported;
                inner.get_mut(p).unwrap().exit_kind = ExitKind::NoChange;
            }
            Status::Ready => {
                inner.get_mut(parent).unwrap().wait_observed_kind = ExitKind::NotExited;
            }
            _ => return,
        }
        inner.remove_from_all_queues(parent);
        let parent_pcb = inner.get_mut(parent).unwrap();
        parent_pcb.status = Status::Ready;
        let priority = parent_pcb.priority;
        inner.enqueue_ready(parent, priority);
        drop(inner);
        log_transition(self.quantum(), Event::Waited, parent, priority, "wait");
    }

    /// spec §4.2 `cleanup` (reaping): must be called at most once per PCB.
    pub fn cleanup(&self, pid: Pid) {
        let (children, parent_pid, name, priority) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(pcb) = inner.get_mut(pid) else { return };
            if pcb.status == Status::Terminated {
                return;
            }
            pcb.status = Status::Terminated;
            let children = pcb.children.clone();
            let parent_pid = pcb.parent_pid;
            let name = pcb.name.clone();
            let priority = pcb.priority;
            inner.remove_from_all_queues(pid);
            // `pid` is deliberately left in its parent's `children` list: a
            // repeat `wait(pid)` needs to see it (status `TERMINATED`) to
            // report `AlreadyWaitedOn` instead of `WrongParent` (spec §8 S3).
            for &child in &children {
                if let Some(c) = inner.get_mut(child) {
                    c.parent_pid = 1;
                }
            }
            if let Some(init) = inner.get_mut(1) {
                if pid != 1 {
                    init.children.extend(children.iter().copied());
                }
            }
            (children, parent_pid, name, priority)
        };
        let _ = parent_pid;
        if let Some(turnstile) = self.turnstile(pid) {
            turnstile.shut_down();
        }
        for child in &children {
            if let Some(view) = self.view(*child) {
                log_transition(self.quantum(), Event::Orphan, *child, view.priority, &view.name);
            }
        }
        log_transition(self.quantum(), Event::Zombie, pid, priority, &name);
    }

    /// Converts a just-`create`d PCB into the "sleep" pseudo-process's
    /// blocked-with-countdown state (spec §4.4 `sleep`). Never given a body
    /// thread: it is simply never enqueued ready, so it never runs.
    pub fn make_sleep(&self, pid: Pid, ticks: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove_from_all_queues(pid);
        if let Some(pcb) = inner.get_mut(pid) {
            pcb.status = Status::Blocked;
            pcb.sleep_ticks_remaining = ticks;
        }
        inner.blocked.push_back(pid);
    }

    /// spec §4.4 `exit`: a body thread's normal return. Called off the
    /// registry lock's critical section by `process::exit`.
    pub fn finish_as_zombie(&self, pid: Pid) {
        let (name, priority) = {
            let mut inner = self.inner.lock().unwrap();
            inner.remove_from_all_queues(pid);
            let Some(pcb) = inner.get_mut(pid) else { return };
            pcb.status = Status::Zombie;
            pcb.exit_kind = ExitKind::ExitedNormal;
            inner.zombie.push_back(pid);
            (pcb.name.clone(), pcb.priority)
        };
        log_transition(self.quantum(), Event::Zombie, pid, priority, &name);
    }

    /// Reassigns priority (spec §4.4 `nice`); moves a currently-`Ready` PCB
    /// into its new priority class immediately.
    pub fn renice(&self, pid: Pid, new_priority: i8) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let was_ready = inner.get(pid).map(|p| p.status == Status::Ready).unwrap_or(false);
        let Some(pcb) = inner.get_mut(pid) else { return false };
        pcb.priority = new_priority;
        if was_ready {
            inner.remove_from_all_queues(pid);
            inner.enqueue_ready(pid, new_priority);
        }
        true
    }

    pub fn set_idle(&self, pid: Pid) {
        self.inner.lock().unwrap().idle_pid = Some(pid);
    }

    pub fn idle_pid(&self) -> Option<Pid> {
        self.inner.lock().unwrap().idle_pid
    }

    // --- Queue-walk helpers driven by the scheduler (spec §4.3) ---

    pub(crate) fn pop_ready(&self, priority: i8) -> Option<Pid> {
        self.inner.lock().unwrap().ready_queue_mut(priority).pop_front()
    }

    pub(crate) fn all_ready_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.ready.iter().all(|q| q.is_empty())
    }

    pub(crate) fn mark_running(&self, pid: Pid) {
        self.with_pcb_mut(pid, |p| p.status = Status::Running);
    }

    /// Re-enqueues a PCB that is still runnable after its slice (spec
    /// §4.3's "RUNNING → still runnable").
    pub(crate) fn requeue_ready(&self, pid: Pid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pcb) = inner.get_mut(pid) {
            pcb.status = Status::Ready;
            let priority = pcb.priority;
            inner.enqueue_ready(pid, priority);
        }
    }

    pub(crate) fn move_to_blocked(&self, pid: Pid) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove_from_all_queues(pid);
        inner.blocked.push_back(pid);
    }

    /// Post-quantum sleep ticking (spec §4.3's housekeeping step 1).
    pub(crate) fn tick_sleepers(&self, ticks: i64) -> Vec<Pid> {
        let mut inner = self.inner.lock().unwrap();
        let mut woke = Vec::new();
        for pid in inner.blocked.iter().copied().collect::<Vec<_>>() {
            if let Some(pcb) = inner.get_mut(pid) {
                if pcb.sleep_ticks_remaining > 0 {
                    pcb.sleep_ticks_remaining -= ticks;
                    if pcb.sleep_ticks_remaining <= 0 {
                        pcb.sleep_ticks_remaining = 0;
                        pcb.status = Status::Zombie;
                        pcb.exit_kind = ExitKind::ExitedNormal;
                        woke.push(pid);
                    }
                }
            }
        }
        for pid in &woke {
            inner.blocked.remove_where(|p| p == pid);
            inner.zombie.push_back(*pid);
        }
        woke
    }

    /// Post-quantum stopped→ready promotion (spec §4.3's housekeeping step
    /// 2): any PCB in `stopped` whose status was externally flipped to
    /// `Ready` (by CONT) is moved into its priority class.
    pub(crate) fn promote_stopped_to_ready(&self) -> Vec<Pid> {
        let mut inner = self.inner.lock().unwrap();
        let promoted: Vec<Pid> = inner
            .stopped
            .iter()
            .copied()
            .filter(|&pid| inner.get(pid).map(|p| p.status == Status::Ready).unwrap_or(false))
            .collect();
        for pid in &promoted {
            inner.stopped.remove_where(|p| p == pid);
            let priority = inner.get(*pid).unwrap().priority;
            inner.enqueue_ready(*pid, priority);
        }
        promoted
    }

    pub(crate) fn zombie_pids(&self) -> Vec<Pid> {
        self.inner.lock().unwrap().zombie.iter().copied().collect()
    }

    pub(crate) fn terminated_pid_pending_cleanup(&self, pid: Pid) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(pid)
            .map(|p| p.status == Status::Terminated)
            .unwrap_or(false)
    }

    pub(crate) fn status_of(&self, pid: Pid) -> Option<Status> {
        self.inner.lock().unwrap().get(pid).map(|p| p.status)
    }

    /// Public status lookup, for embedding binaries driving shutdown
    /// conditions (spec §6's "clean shutdown via logout").
    pub fn status(&self, pid: Pid) -> Option<Status> {
        self.status_of(pid)
    }

    /// spec §6 `ps`: a table of every non-`TERMINATED` PCB. `idle` is never
    /// reported (spec §4.3's "Idle").
    pub fn ps(&self) -> Vec<PcbView> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<PcbView> = inner
            .pcbs
            .iter()
            .flatten()
            .filter(|p| p.status != Status::Terminated && Some(p.pid) != inner.idle_pid)
            .map(PcbView::from)
            .collect();
        rows.sort_by_key(|r| r.pid);
        rows
    }

    pub fn log_scheduler_inconsistency(&self, context: &str) {
        log_inconsistency(self.quantum(), context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcb::PRIO_HIGH;

    fn test_kernel() -> Arc<Kernel> {
        Kernel::new(Config::default(), FsState::new(Config::default().max_global_fds))
    }

    /// spec §8 invariant 1: a PCB appears in at most one of
    /// {ready_neg, ready_zero, ready_pos, blocked, stopped, zombie}.
    #[test]
    fn queue_exclusivity() {
        let kernel = test_kernel();
        let a = kernel.create(0, "a", "a");
        let b = kernel.create(0, "b", "b");
        kernel.kill(b, Signal::Stop);

        let inner = kernel.inner.lock().unwrap();
        let membership = |pid: Pid| -> usize {
            let b = |found: bool| if found { 1 } else { 0 };
            inner.ready.iter().filter(|q| q.iter().any(|&p| p == pid)).count()
                + b(inner.blocked.iter().any(|&p| p == pid))
                + b(inner.stopped.iter().any(|&p| p == pid))
                + b(inner.zombie.iter().any(|&p| p == pid))
        };
        assert_eq!(membership(a), 1, "ready PCB must be in exactly one queue");
        assert_eq!(membership(b), 1, "stopped PCB must be in exactly one queue");
    }

    /// spec §8 invariant 2: status ⇔ queue membership.
    #[test]
    fn status_matches_queue() {
        let kernel = test_kernel();
        let a = kernel.create(0, "a", "a");
        assert_eq!(kernel.status_of(a), Some(Status::Ready));
        {
            let inner = kernel.inner.lock().unwrap();
            assert!(inner.ready.iter().any(|q| q.iter().any(|&p| p == a)));
        }

        kernel.with_pcb_mut(a, |p| p.status = Status::Blocked);
        kernel.move_to_blocked(a);
        assert_eq!(kernel.status_of(a), Some(Status::Blocked));
        {
            let inner = kernel.inner.lock().unwrap();
            assert!(inner.blocked.iter().any(|&p| p == a));
            assert!(!inner.ready.iter().any(|q| q.iter().any(|&p| p == a)));
        }

        kernel.kill(a, Signal::Stop);
        assert_eq!(kernel.status_of(a), Some(Status::Stopped));
        {
            let inner = kernel.inner.lock().unwrap();
            assert!(inner.stopped.iter().any(|&p| p == a));
            assert!(!inner.blocked.iter().any(|&p| p == a));
        }
    }

    /// spec §8 invariant 3: after `cleanup(p)`, every former child of `p` has
    /// `parent == 1`.
    #[test]
    fn parentage_closure_after_cleanup() {
        let kernel = test_kernel();
        let init = kernel.create(0, "init", "init");
        assert_eq!(init, 1);
        let parent = kernel.create(init, "parent", "parent");
        let child_a = kernel.create(parent, "a", "a");
        let child_b = kernel.create(parent, "b", "b");

        kernel.cleanup(parent);

        assert_eq!(kernel.view(child_a).unwrap().parent_pid, 1);
        assert_eq!(kernel.view(child_b).unwrap().parent_pid, 1);
        assert!(kernel.view(init).unwrap().children.contains(&child_a));
        assert!(kernel.view(init).unwrap().children.contains(&child_b));
    }

    #[test]
    fn renice_moves_ready_pcb_between_classes() {
        let kernel = test_kernel();
        let a = kernel.create(0, "a", "a");
        assert!(kernel.renice(a, PRIO_HIGH));
        assert_eq!(kernel.view(a).unwrap().priority, PRIO_HIGH);
        let inner = kernel.inner.lock().unwrap();
        assert!(inner.ready[prio_idx(PRIO_HIGH)].iter().any(|&p| p == a));
    }
}
