//! Error taxonomy for the kernel, scheduler, process API, and FAT layer.
//!
//! Internal code propagates these with `?`; the public process/FD surface
//! (§6/§7 of the design) collapses them to the negative-sentinel convention
//! the shell collaborator expects.

use thiserror::Error;

/// Errors raised by process-lifecycle operations (spawn/wait/kill/nice/...).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcError {
    #[error("no such process: {0}")]
    NoSuchPid(crate::pcb::Pid),
    #[error("pid {0} is not a child of the caller")]
    WrongParent(crate::pcb::Pid),
    #[error("child has already been waited on")]
    AlreadyWaitedOn,
    #[error("caller has no children")]
    NoChildren,
    #[error("invalid signal")]
    InvalidSignal,
    #[error("invalid priority: {0}")]
    InvalidPriority(i8),
    #[error("spawn failed: {0}")]
    SpawnFailure(String),
    #[error("process status {0:?} is not valid here")]
    StatusUnrecognized(crate::pcb::Status),
}

/// Errors raised by the FAT layer and the file-descriptor layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("file not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("no space left on device")]
    NoSpace,
    #[error("invalid file descriptor")]
    InvalidFd,
    #[error("file is already open for write")]
    OpenForWriteConflict,
    #[error("file is open elsewhere")]
    FileIsOpen,
    #[error("read error")]
    ReadError,
    #[error("write error")]
    WriteError,
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("no file system is mounted")]
    NotMounted,
    #[error("a file system is already mounted")]
    AlreadyMounted,
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Io(e.to_string())
    }
}

/// Errors the external shell collaborator is expected to match on.
///
/// This flattens [`ProcError`] and [`FsError`] into the shell-facing taxonomy
/// named in the design (unknown-command / bad-argument / prompt-I/O live
/// entirely in the shell and are not represented here).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShellFacingError {
    #[error(transparent)]
    Process(#[from] ProcError),
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// The negative-sentinel return convention described in spec §6/§7: success
/// is `Ok(value)`, failure is `Err(code)` where `code` is a small negative
/// integer a C-style caller could check with `< 0`, alongside the typed
/// error for anyone who wants it.
pub type SysResult<T> = Result<T, ShellFacingError>;

impl ShellFacingError {
    /// A small negative errno-like code, stable for a given error variant.
    pub fn code(&self) -> i32 {
        match self {
            ShellFacingError::Process(e) => match e {
                ProcError::NoSuchPid(_) => -1,
                ProcError::WrongParent(_) => -2,
                ProcError::AlreadyWaitedOn => -3,
                ProcError::NoChildren => -4,
                ProcError::InvalidSignal => -5,
                ProcError::SpawnFailure(_) => -6,
                ProcError::StatusUnrecognized(_) => -7,
                ProcError::InvalidPriority(_) => -8,
            },
            ShellFacingError::Fs(e) => match e {
                FsError::NotFound => -10,
                FsError::PermissionDenied => -11,
                FsError::NoSpace => -12,
                FsError::InvalidFd => -13,
                FsError::OpenForWriteConflict => -14,
                FsError::FileIsOpen => -15,
                FsError::ReadError => -16,
                FsError::WriteError => -17,
                FsError::InvalidParameter(_) => -18,
                FsError::NotMounted => -19,
                FsError::AlreadyMounted => -20,
                FsError::Io(_) => -21,
            },
        }
    }
}
