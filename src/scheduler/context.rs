//! The suspendable execution snapshot for a PCB (SPEC_FULL.md §4.7).
//!
//! The original C source gives each process its own `ucontext_t` and swaps
//! stacks by hand; a process "blocks" by setting its status then spinning on
//! `while(1);` until the timer signal hands control back to the scheduler.
//! `spec.md` §9 flags that busy-loop as something a rewrite should replace
//! with a clean yield primitive. Here every PCB's body runs on its own real
//! OS thread, and a [`Turnstile`] is the handshake between that thread and
//! the scheduler thread: the scheduler blocks on `grant_and_await_return`
//! while a body thread runs, so at any instant exactly one of the two sides
//! is actually executing — which reproduces "only one PCB is RUNNING at a
//! time" through real mutual exclusion instead of a spin loop.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Nobody is scheduled; the body thread is parked.
    Closed,
    /// The scheduler has handed the CPU to the body thread.
    Open,
    /// The body thread finished its slice and handed the CPU back.
    Returned,
    /// The scheduler is tearing this PCB down; the body thread should stop
    /// waiting and let its thread terminate.
    ShutDown,
}

/// A single-process turnstile. The scheduler never grants more than one
/// turnstile at a time, which is the entire enforcement of "no parallelism"
/// in this design — this type itself is agnostic to how many turnstiles
/// exist.
#[derive(Debug)]
pub struct Turnstile {
    state: Mutex<Gate>,
    cv: Condvar,
}

impl Default for Turnstile {
    fn default() -> Self {
        Self::new()
    }
}

impl Turnstile {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Gate::Closed),
            cv: Condvar::new(),
        }
    }

    /// Scheduler side: hand the CPU to the body thread and block until it
    /// yields back (either via [`Turnstile::checkpoint`] or by finishing its
    /// entry function). Returns `false` if the turnstile was shut down
    /// instead (the body thread has exited and will never run again).
    pub fn grant_and_await_return(&self) -> bool {
        let mut g = self.state.lock().unwrap();
        if *g == Gate::ShutDown {
            return false;
        }
        *g = Gate::Open;
        self.cv.notify_all();
        loop {
            match *g {
                Gate::Returned => {
                    *g = Gate::Closed;
                    return true;
                }
                Gate::ShutDown => return false,
                _ => g = self.cv.wait(g).unwrap(),
            }
        }
    }

    /// Scheduler side: tell a parked body thread to terminate instead of
    /// ever running again (called from [`crate::kernel::Kernel::cleanup`]).
    pub fn shut_down(&self) {
        let mut g = self.state.lock().unwrap();
        *g = Gate::ShutDown;
        self.cv.notify_all();
    }

    /// Body side: block until the scheduler grants this thread the CPU, or
    /// until shut down. Returns `false` on shutdown.
    pub fn wait_for_grant(&self) -> bool {
        let mut g = self.state.lock().unwrap();
        loop {
            match *g {
                Gate::Open => return true,
                Gate::ShutDown => return false,
                _ => g = self.cv.wait(g).unwrap(),
            }
        }
    }

    /// Body side: voluntarily hand the CPU back to the scheduler, then block
    /// until granted again (or shut down). This is the "clean yield" spec §9
    /// asks for in place of `while(1);`. Returns `false` on shutdown, in
    /// which case the caller must stop running.
    pub fn checkpoint(&self) -> bool {
        {
            let mut g = self.state.lock().unwrap();
            if *g == Gate::ShutDown {
                return false;
            }
            *g = Gate::Returned;
            self.cv.notify_all();
        }
        self.wait_for_grant()
    }
}
