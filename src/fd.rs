//! The file-descriptor layer (spec §4.6): the process-local and global
//! open-file tables layered over [`crate::fat::FatFs`].

use std::io::Read;

use crate::error::FsError;
use crate::fat::format::{DirEntry, PERM_READ, PERM_WRITE};
use crate::fat::FatFs;
use crate::pcb::{FdTable, MAX_PROCESS_FDS};

/// Pinned global slots (spec §3).
pub const STDIN_GLOBAL: i32 = 0;
pub const STDOUT_GLOBAL: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FdKind {
    Free,
    Stdin,
    Stdout,
    File { name: String },
}

#[derive(Debug, Clone)]
struct GlobalFdEntry {
    kind: FdKind,
    dir_entry: Option<DirEntry>,
    offset: u64,
    mode: Option<OpenMode>,
    ref_count: u32,
}

impl GlobalFdEntry {
    fn free() -> Self {
        Self {
            kind: FdKind::Free,
            dir_entry: None,
            offset: 0,
            mode: None,
            ref_count: 0,
        }
    }
}

/// The global, per-filesystem open-file table (spec §3: "Global file
/// descriptor table"). Slot 0 is pinned STDIN, slot 1 is pinned STDOUT.
pub struct GlobalFdTable {
    slots: Vec<GlobalFdEntry>,
}

impl GlobalFdTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = vec![GlobalFdEntry::free(); capacity.max(2)];
        slots[STDIN_GLOBAL as usize].kind = FdKind::Stdin;
        slots[STDIN_GLOBAL as usize].ref_count = 1;
        slots[STDOUT_GLOBAL as usize].kind = FdKind::Stdout;
        slots[STDOUT_GLOBAL as usize].ref_count = 1;
        Self { slots }
    }

    fn find_open_file(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| matches!(&s.kind, FdKind::File { name: n } if n == name))
    }

    /// Returns `true` if `name` is referenced by any open global fd — used
    /// by `rm`/`unlink` (spec §4.5/§4.6).
    pub fn is_open(&self, name: &str) -> bool {
        self.find_open_file(name).is_some()
    }

    fn is_open_for_write(&self, name: &str) -> bool {
        self.slots.iter().any(|s| {
            matches!(&s.kind, FdKind::File { name: n } if n == name)
                && matches!(s.mode, Some(OpenMode::Write))
        })
    }

    fn alloc_slot(&mut self) -> Result<usize, FsError> {
        self.slots
            .iter()
            .position(|s| matches!(s.kind, FdKind::Free))
            .ok_or(FsError::NoSpace)
    }

    /// spec §4.6 `open`: returns the *global* index; callers (the process
    /// API) install it into a per-process [`FdTable`] slot.
    pub fn open(&mut self, fat: &mut FatFs, name: &str, mode: OpenMode) -> Result<i32, FsError> {
        if let Some(existing) = self.find_open_file(name) {
            if mode == OpenMode::Write {
                return Err(FsError::OpenForWriteConflict);
            }
            self.slots[existing].ref_count += 1;
            return Ok(existing as i32);
        }
        if self.is_open_for_write(name) {
            return Err(FsError::OpenForWriteConflict);
        }

        let entry = match (fat.find_file(name)?, mode) {
            (Some((_, e)), OpenMode::Read) => {
                if !e.has_perm(PERM_READ) {
                    return Err(FsError::PermissionDenied);
                }
                e
            }
            (Some((_, e)), OpenMode::Write) => {
                if !e.has_perm(PERM_WRITE) {
                    return Err(FsError::PermissionDenied);
                }
                fat.rm(name)?;
                fat.touch_single(name)?;
                fat.find_file(name)?.unwrap().1
            }
            (Some((_, e)), OpenMode::Append) => {
                if !e.has_perm(PERM_WRITE) {
                    return Err(FsError::PermissionDenied);
                }
                e
            }
            (None, OpenMode::Read) => return Err(FsError::NotFound),
            (None, _) => {
                fat.touch_single(name)?;
                fat.find_file(name)?.unwrap().1
            }
        };

        let offset = if mode == OpenMode::Append { entry.size as u64 } else { 0 };
        let slot = self.alloc_slot()?;
        self.slots[slot] = GlobalFdEntry {
            kind: FdKind::File { name: name.to_string() },
            dir_entry: Some(entry),
            offset,
            mode: Some(mode),
            ref_count: 1,
        };
        Ok(slot as i32)
    }

    /// spec §4.6 `close`: decrements `ref_count`, freeing the slot at zero.
    pub fn close(&mut self, global: i32) -> Result<(), FsError> {
        let slot = self.slots.get_mut(global as usize).ok_or(FsError::InvalidFd)?;
        if matches!(slot.kind, FdKind::Free) {
            return Err(FsError::InvalidFd);
        }
        slot.ref_count = slot.ref_count.saturating_sub(1);
        if slot.ref_count == 0 && !matches!(slot.kind, FdKind::Stdin | FdKind::Stdout) {
            *slot = GlobalFdEntry::free();
        }
        Ok(())
    }

    pub fn bump_ref(&mut self, global: i32) {
        if let Some(slot) = self.slots.get_mut(global as usize) {
            slot.ref_count += 1;
        }
    }

    /// spec §4.6 `read`.
    pub fn read(&mut self, fat: &mut FatFs, global: i32, n: usize) -> Result<Vec<u8>, FsError> {
        let slot = self.slots.get_mut(global as usize).ok_or(FsError::InvalidFd)?;
        match &slot.kind {
            FdKind::Free => Err(FsError::InvalidFd),
            FdKind::Stdin => {
                let mut buf = vec![0u8; n];
                let read = std::io::stdin().lock().read(&mut buf).map_err(FsError::from)?;
                buf.truncate(read);
                Ok(buf)
            }
            FdKind::Stdout => Err(FsError::PermissionDenied),
            FdKind::File { .. } => {
                let entry = slot.dir_entry.clone().ok_or(FsError::InvalidFd)?;
                let data = fat.read_file(&entry, slot.offset, n)?;
                slot.offset += data.len() as u64;
                Ok(data)
            }
        }
    }

    /// spec §4.6 `write`.
    pub fn write(&mut self, fat: &mut FatFs, global: i32, buf: &[u8]) -> Result<usize, FsError> {
        let slot = self.slots.get_mut(global as usize).ok_or(FsError::InvalidFd)?;
        match &slot.kind {
            FdKind::Free => Err(FsError::InvalidFd),
            FdKind::Stdin => Err(FsError::PermissionDenied),
            FdKind::Stdout => {
                use std::io::Write as _;
                std::io::stdout().lock().write_all(buf).map_err(FsError::from)?;
                Ok(buf.len())
            }
            FdKind::File { name } => {
                if !matches!(slot.mode, Some(OpenMode::Write) | Some(OpenMode::Append)) {
                    return Err(FsError::PermissionDenied);
                }
                let name = name.clone();
                let offset = slot.offset;
                let updated = fat.write_at(&name, offset, buf)?;
                let slot = self.slots.get_mut(global as usize).unwrap();
                slot.offset += buf.len() as u64;
                slot.dir_entry = Some(updated);
                Ok(buf.len())
            }
        }
    }

    /// spec §4.6 `lseek`: does not validate against file size.
    pub fn lseek(&mut self, global: i32, offset: i64, whence: SeekWhence) -> Result<u64, FsError> {
        let slot = self.slots.get_mut(global as usize).ok_or(FsError::InvalidFd)?;
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => slot.offset as i64,
            SeekWhence::End => slot.dir_entry.as_ref().map(|e| e.size as i64).unwrap_or(0),
        };
        let new_offset = base + offset;
        if new_offset < 0 {
            return Err(FsError::InvalidParameter("negative seek offset".into()));
        }
        slot.offset = new_offset as u64;
        Ok(slot.offset)
    }
}

/// Per-process view over the global table: installs/removes entries from a
/// [`FdTable`] and keeps global `ref_count`s in sync.
pub struct ProcessFdView<'a> {
    pub table: &'a mut FdTable,
    pub global: &'a mut GlobalFdTable,
}

impl<'a> ProcessFdView<'a> {
    /// spec §4.6 `open`: allocates (or reuses) a global slot, then assigns a
    /// free per-process slot pointing at it.
    pub fn open(&mut self, fat: &mut FatFs, name: &str, mode: OpenMode) -> Result<usize, FsError> {
        let global_idx = self.global.open(fat, name, mode)?;
        let proc_slot = self.table.first_free().ok_or(FsError::InvalidFd)?;
        self.table.set(proc_slot, global_idx);
        Ok(proc_slot)
    }

    /// spec §4.6 `close`.
    pub fn close(&mut self, proc_fd: usize) -> Result<(), FsError> {
        let global_idx = self.table.get(proc_fd).ok_or(FsError::InvalidFd)?;
        self.global.close(global_idx)?;
        self.table.clear(proc_fd);
        Ok(())
    }

    pub fn resolve(&self, proc_fd: usize) -> Result<i32, FsError> {
        self.table.get(proc_fd).ok_or(FsError::InvalidFd)
    }

    /// Installs `global` directly into `proc_fd`, bumping its ref count —
    /// used by `spawn` to install the parent's stdin/stdout into the child
    /// (spec §4.4).
    pub fn install(&mut self, proc_fd: usize, global: i32) {
        self.global.bump_ref(global);
        self.table.set(proc_fd, global);
    }

    pub const MAX_SLOTS: usize = MAX_PROCESS_FDS;
}
