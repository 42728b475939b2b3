//! The host-terminal signal bridge (spec §5, §6): installs handlers for the
//! host's interrupt/quit/stop keys and forwards them as kills against the
//! current foreground PCB.
//!
//! Signal-handler context is not a safe place to touch PCBs, queues, or
//! locks (spec §5: "These handlers run in host-signal context and must only
//! enqueue the forwarded action"). `signal-hook` already keeps the handler
//! itself minimal; we additionally push onto a lock-free queue so the
//! handler never blocks, and the scheduler drains it once per quantum on its
//! own thread.

use std::sync::Arc;

use crossbeam_queue::SegQueue;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTSTP};
use signal_hook::iterator::Signals;

use crate::pcb::Signal;

/// A signal forwarded from the host terminal, queued for the scheduler to
/// apply on its next resume.
#[derive(Debug, Clone, Copy)]
pub struct ForwardedSignal(pub Signal);

/// Installs the host-signal handlers and returns the queue the scheduler
/// should drain each quantum. Spawns one background thread that blocks on
/// `signal-hook`'s iterator (the crate's documented safe pattern — it is not
/// itself a signal handler, just an ordinary thread fed by one).
pub fn install() -> std::io::Result<Arc<SegQueue<ForwardedSignal>>> {
    let queue = Arc::new(SegQueue::new());
    let mut signals = Signals::new([SIGINT, SIGTSTP, SIGQUIT])?;
    let producer = queue.clone();
    std::thread::Builder::new()
        .name("pennos-hostsig".into())
        .spawn(move || {
            for sig in signals.forever() {
                let mapped = match sig {
                    SIGINT => Signal::Term,
                    SIGQUIT => Signal::Term,
                    SIGTSTP => Signal::Stop,
                    _ => continue,
                };
                producer.push(ForwardedSignal(mapped));
            }
        })?;
    Ok(queue)
}

/// Drains every queued forwarded signal, applying each as a kill against
/// `foreground`. Called once per quantum from the scheduler thread, never
/// from signal-handler context.
pub fn drain_and_apply(
    queue: &SegQueue<ForwardedSignal>,
    foreground: crate::pcb::Pid,
    kernel: &crate::kernel::Kernel,
) {
    while let Some(ForwardedSignal(sig)) = queue.pop() {
        if foreground != 0 {
            kernel.kill(foreground, sig);
        }
    }
}
