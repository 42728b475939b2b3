//! PennOS: a cooperatively-scheduled process/filesystem core, hosted as a
//! single process on top of a real OS (spec.md §1).
//!
//! This crate owns the scheduler, the PCB registry, the FAT filesystem, and
//! the process API a shell (or any other client) drives. It does not include
//! a shell: spec.md's `bash`-alike collaborator is an external, out-of-scope
//! client of [`process`]/[`fd`] (spec §1 Non-goals).

pub mod config;
pub mod deque;
pub mod error;
pub mod fat;
pub mod fd;
pub mod fs_state;
pub mod hostsig;
pub mod kernel;
pub mod logging;
pub mod pcb;
pub mod process;
pub mod scheduler;

pub use error::{ProcError, ShellFacingError, SysResult};
pub use kernel::Kernel;
pub use pcb::{ExitKind, Pid, Signal, Status};
pub use scheduler::Scheduler;
