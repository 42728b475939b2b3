//! Structured log emission for the scheduler's state-transition stream
//! (spec §6): one line per transition, `[Q] EVENT pid prio name`.
//!
//! Built on the `log` facade so the one stream carries both the mandated
//! EVENT lines (at `Info`) and scheduler-internal diagnostics (`Warn`/
//! `Error`, spec §7 — "logged and skipped, not panicked on"). Installing a
//! sink is left to the embedding binary (`env_logger::init()` in
//! `src/bin/pennos.rs`); this module only shapes the messages.

use std::fmt;

use crate::pcb::Pid;

/// One of the transition events named in spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Create,
    Schedule,
    Exited,
    Signaled,
    Stopped,
    Continued,
    Zombie,
    Orphan,
    Waited,
    Nice,
    Blocked,
    Unblocked,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Event::Create => "CREATE",
            Event::Schedule => "SCHEDULE",
            Event::Exited => "EXITED",
            Event::Signaled => "SIGNALED",
            Event::Stopped => "STOPPED",
            Event::Continued => "CONTINUED",
            Event::Zombie => "ZOMBIE",
            Event::Orphan => "ORPHAN",
            Event::Waited => "WAITED",
            Event::Nice => "NICE",
            Event::Blocked => "BLOCKED",
            Event::Unblocked => "UNBLOCKED",
        };
        f.write_str(s)
    }
}

/// Emits one `[Q] EVENT pid prio name` line at `Level::Info`, per spec §6.
pub fn log_transition(quantum: u64, event: Event, pid: Pid, priority: i8, name: &str) {
    log::info!("[{quantum}] {event} {pid} {priority} {name}");
}

/// Emits a scheduler-internal-inconsistency diagnostic at `Level::Warn`
/// (spec §7: "logged and skipped, not panicked on").
pub fn log_inconsistency(quantum: u64, context: &str) {
    log::warn!("[{quantum}] scheduler inconsistency: {context}");
}
