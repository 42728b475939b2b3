//! Ties the mounted [`FatFs`] together with the [`GlobalFdTable`] that sits
//! on top of it (spec §3: both are system-wide singletons, not per-process).

use std::path::Path;

use crate::error::FsError;
use crate::fat::FatFs;
use crate::fd::GlobalFdTable;

pub struct FsState {
    pub fat: Option<FatFs>,
    pub fds: GlobalFdTable,
}

impl FsState {
    pub fn new(max_global_fds: usize) -> Self {
        Self {
            fat: None,
            fds: GlobalFdTable::new(max_global_fds),
        }
    }

    /// spec §4.5 `mount`: rejects if a filesystem is already mounted.
    pub fn mount(&mut self, path: &Path) -> Result<(), FsError> {
        if self.fat.is_some() {
            return Err(FsError::AlreadyMounted);
        }
        self.fat = Some(FatFs::mount(path)?);
        Ok(())
    }

    /// spec §4.5 `umount`.
    pub fn umount(&mut self) -> Result<(), FsError> {
        if self.fat.take().is_none() {
            return Err(FsError::NotMounted);
        }
        Ok(())
    }

    pub fn fat_mut(&mut self) -> Result<&mut FatFs, FsError> {
        self.fat.as_mut().ok_or(FsError::NotMounted)
    }

    /// spec §8 S6 / §4.6 `unlink`: refuses to remove a file any fd still
    /// references, regardless of which process opened it.
    pub fn unlink(&mut self, name: &str) -> Result<(), FsError> {
        if self.fds.is_open(name) {
            return Err(FsError::FileIsOpen);
        }
        self.fat_mut()?.rm(name)
    }
}
