//! The FAT layer (spec §4.5): on-disk format, directory lookup, block
//! allocation, chain traversal, and the filesystem-maintenance operations
//! (`mkfs`, `mount`, `umount`, `touch`, `rm`, `mv`, `cp`, `ls`, `chmod`).
//!
//! The source memory-maps the FAT region and mutates it in place; per §9's
//! redesign note we instead keep the FAT mirrored in memory and write
//! individual entries back to the backing file explicitly, which gives the
//! same durability without `unsafe` shared mappings.

pub mod format;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::FsError;
use format::{
    block_size_for, decode_meta, encode_meta, DirEntry, DIR_ENTRY_SIZE, FAT_EOC, FAT_FREE,
    PERM_EXEC, PERM_READ, PERM_WRITE, TYPE_REGULAR,
};

/// Block number of the root directory's first block (fixed, spec §3).
const ROOT_FIRST_BLOCK: u16 = 1;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// A mounted FAT filesystem image.
pub struct FatFs {
    file: File,
    image_path: PathBuf,
    block_size: usize,
    blocks_in_fat: u16,
    /// Number of FAT entries, including entry 0 (metadata).
    num_entries: usize,
    /// In-memory mirror of the FAT region.
    fat: Vec<u16>,
}

impl FatFs {
    /// spec §4.5 `mkfs`: validates ranges, computes layout, writes the
    /// initial FAT[0]/FAT[1], and creates the backing host file.
    pub fn mkfs(path: &Path, blocks_in_fat: u16, block_size_config: u8) -> Result<(), FsError> {
        if !(1..=32).contains(&blocks_in_fat) {
            return Err(FsError::InvalidParameter("blocks_in_fat out of range [1,32]".into()));
        }
        if block_size_config > 4 {
            return Err(FsError::InvalidParameter("block_size_config out of range [0,4]".into()));
        }
        let block_size = block_size_for(block_size_config);
        let fat_region_bytes = blocks_in_fat as usize * block_size;
        let num_entries = std::cmp::min(0xFFFF, (block_size * blocks_in_fat as usize) / 2);
        let data_blocks = num_entries - 1;
        let total_size = fat_region_bytes + block_size * data_blocks;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size as u64)?;

        let mut fat = vec![FAT_FREE; num_entries];
        fat[0] = encode_meta(blocks_in_fat, block_size_config);
        fat[1] = FAT_EOC;

        for (i, entry) in fat.iter().enumerate() {
            file.seek(SeekFrom::Start((i * 2) as u64))?;
            file.write_all(&entry.to_le_bytes())?;
        }
        // Zero the root directory's first block so all its slots read as free.
        let root_off = fat_region_bytes; // block 1 is the first data block
        file.seek(SeekFrom::Start(root_off as u64))?;
        file.write_all(&vec![0u8; block_size])?;
        file.flush()?;
        Ok(())
    }

    /// spec §4.5 `mount`: opens the image, reads FAT[0], derives
    /// `block_size`/`fat_size`, and reads the FAT region into memory.
    pub fn mount(path: &Path) -> Result<Self, FsError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut meta_bytes = [0u8; 2];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut meta_bytes)?;
        let (blocks_in_fat, block_size_config) = decode_meta(u16::from_le_bytes(meta_bytes));
        let block_size = block_size_for(block_size_config);
        let num_entries = std::cmp::min(0xFFFF, (block_size * blocks_in_fat as usize) / 2);

        let mut fat = vec![FAT_FREE; num_entries];
        file.seek(SeekFrom::Start(0))?;
        let mut raw = vec![0u8; num_entries * 2];
        file.read_exact(&mut raw)?;
        for (i, slot) in fat.iter_mut().enumerate() {
            *slot = u16::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);
        }

        Ok(Self {
            file,
            image_path: path.to_path_buf(),
            block_size,
            blocks_in_fat,
            num_entries,
            fat,
        })
    }

    pub fn image_path(&self) -> &Path {
        &self.image_path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn entries_per_block(&self) -> usize {
        self.block_size / DIR_ENTRY_SIZE
    }

    fn fat_region_bytes(&self) -> usize {
        self.blocks_in_fat as usize * self.block_size
    }

    fn block_offset(&self, block: u16) -> u64 {
        (self.fat_region_bytes() + (block as usize - 1) * self.block_size) as u64
    }

    fn set_fat_entry(&mut self, idx: u16, value: u16) -> Result<(), FsError> {
        self.fat[idx as usize] = value;
        self.file.seek(SeekFrom::Start(idx as u64 * 2))?;
        self.file.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn fat_entry(&self, idx: u16) -> u16 {
        self.fat[idx as usize]
    }

    /// spec §4.5 `allocate_block`: linear scan of FAT[1..num_entries].
    pub fn allocate_block(&mut self) -> Result<u16, FsError> {
        for i in 1..self.num_entries {
            if self.fat[i] == FAT_FREE {
                self.set_fat_entry(i as u16, FAT_EOC)?;
                return Ok(i as u16);
            }
        }
        Err(FsError::NoSpace)
    }

    fn free_block(&mut self, block: u16) -> Result<(), FsError> {
        let zeros = vec![0u8; self.block_size];
        let off = self.block_offset(block);
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_all(&zeros)?;
        self.set_fat_entry(block, FAT_FREE)
    }

    fn read_block(&mut self, block: u16) -> Result<Vec<u8>, FsError> {
        let off = self.block_offset(block);
        let mut buf = vec![0u8; self.block_size];
        self.file.seek(SeekFrom::Start(off))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_block(&mut self, block: u16, data: &[u8]) -> Result<(), FsError> {
        debug_assert_eq!(data.len(), self.block_size);
        let off = self.block_offset(block);
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Returns the full list of blocks in the chain starting at `first`,
    /// empty if `first == FAT_EOC` (an empty file).
    fn chain_blocks(&self, first: u16) -> Vec<u16> {
        if first == FAT_EOC {
            return Vec::new();
        }
        let mut blocks = Vec::new();
        let mut cur = first;
        loop {
            blocks.push(cur);
            let next = self.fat_entry(cur);
            if next == FAT_EOC {
                break;
            }
            cur = next;
        }
        blocks
    }

    fn root_chain(&self) -> Vec<u16> {
        self.chain_blocks(ROOT_FIRST_BLOCK)
    }

    /// spec §4.5 `find_file`: walks the root directory chain and returns the
    /// entry's byte offset in the image plus a copy of the entry.
    pub fn find_file(&mut self, name: &str) -> Result<Option<(u64, DirEntry)>, FsError> {
        for block in self.root_chain() {
            let data = self.read_block(block)?;
            for slot in 0..self.entries_per_block() {
                let bytes: [u8; DIR_ENTRY_SIZE] =
                    data[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]
                        .try_into()
                        .unwrap();
                let entry = DirEntry::from_bytes(&bytes);
                if !entry.is_free() && entry.name == name {
                    let off = self.block_offset(block) + (slot * DIR_ENTRY_SIZE) as u64;
                    return Ok(Some((off, entry)));
                }
            }
        }
        Ok(None)
    }

    fn write_entry_at(&mut self, offset: u64, entry: &DirEntry) -> Result<(), FsError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&entry.to_bytes())?;
        Ok(())
    }

    /// Finds a free directory slot in the root chain, extending the chain
    /// with a freshly zeroed block if every existing slot is occupied.
    fn find_or_extend_free_slot(&mut self) -> Result<u64, FsError> {
        for block in self.root_chain() {
            let data = self.read_block(block)?;
            for slot in 0..self.entries_per_block() {
                let bytes: [u8; DIR_ENTRY_SIZE] =
                    data[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]
                        .try_into()
                        .unwrap();
                if DirEntry::from_bytes(&bytes).is_free() {
                    return Ok(self.block_offset(block) + (slot * DIR_ENTRY_SIZE) as u64);
                }
            }
        }
        // No free slot: extend the chain.
        let last = *self.root_chain().last().unwrap();
        let new_block = self.allocate_block()?;
        self.set_fat_entry(last, new_block)?;
        self.write_block(new_block, &vec![0u8; self.block_size])?;
        Ok(self.block_offset(new_block))
    }

    /// spec §4.5 `touch_single`.
    pub fn touch_single(&mut self, name: &str) -> Result<(), FsError> {
        if let Some((offset, mut entry)) = self.find_file(name)? {
            entry.mtime = now_secs();
            self.write_entry_at(offset, &entry)?;
            return Ok(());
        }
        let offset = self.find_or_extend_free_slot()?;
        let entry = DirEntry {
            name: name.to_string(),
            size: 0,
            first_block: FAT_EOC,
            file_type: TYPE_REGULAR,
            perm: PERM_READ | PERM_WRITE,
            mtime: now_secs(),
        };
        self.write_entry_at(offset, &entry)
    }

    /// spec §4.5 `rm`. The open-file check (spec: "Fails if the file is
    /// referenced by any open global FD") is the caller's responsibility —
    /// it requires the global FD table, which lives alongside but outside
    /// this type (see [`crate::fd::GlobalFdTable`]).
    pub fn rm(&mut self, name: &str) -> Result<(), FsError> {
        let (offset, entry) = self.find_file(name)?.ok_or(FsError::NotFound)?;
        for block in self.chain_blocks(entry.first_block) {
            self.free_block(block)?;
        }
        self.write_entry_at(offset, &DirEntry::free())
    }

    /// spec §4.5 `mv`.
    pub fn mv(&mut self, src: &str, dst: &str) -> Result<(), FsError> {
        let (src_offset, mut src_entry) = self.find_file(src)?.ok_or(FsError::NotFound)?;
        if self.find_file(dst)?.is_some() {
            self.rm(dst)?;
        }
        src_entry.name = dst.to_string();
        src_entry.mtime = now_secs();
        self.write_entry_at(src_offset, &src_entry)
    }

    /// spec §4.5 `cp`, fs→fs variant: streams `src`'s blocks into freshly
    /// allocated `dst` blocks, chained through FAT.
    pub fn cp_fs_to_fs(&mut self, src: &str, dst: &str) -> Result<(), FsError> {
        let (_, src_entry) = self.find_file(src)?.ok_or(FsError::NotFound)?;
        let src_blocks = self.chain_blocks(src_entry.first_block);
        let src_data: Vec<Vec<u8>> = src_blocks
            .iter()
            .map(|&b| self.read_block(b))
            .collect::<Result<_, _>>()?;

        if self.find_file(dst)?.is_some() {
            self.rm(dst)?;
        }
        self.touch_single(dst)?;
        let (dst_offset, mut dst_entry) = self.find_file(dst)?.ok_or(FsError::NotFound)?;

        let mut prev: Option<u16> = None;
        let mut first_block = FAT_EOC;
        for block_data in &src_data {
            let new_block = self.allocate_block()?;
            self.write_block(new_block, block_data)?;
            if let Some(p) = prev {
                self.set_fat_entry(p, new_block)?;
            } else {
                first_block = new_block;
            }
            prev = Some(new_block);
        }
        dst_entry.first_block = first_block;
        dst_entry.size = src_entry.size;
        dst_entry.mtime = now_secs();
        self.write_entry_at(dst_offset, &dst_entry)
    }

    /// spec §4.5 `cp`, host→fs variant.
    pub fn cp_host_to_fs(&mut self, host_src: &Path, dst: &str) -> Result<(), FsError> {
        let data = std::fs::read(host_src)?;
        if self.find_file(dst)?.is_some() {
            self.rm(dst)?;
        }
        self.touch_single(dst)?;
        self.write_fresh(dst, &data)
    }

    /// spec §4.5 `cp`, fs→host variant.
    pub fn cp_fs_to_host(&mut self, src: &str, host_dst: &Path) -> Result<(), FsError> {
        let (_, entry) = self.find_file(src)?.ok_or(FsError::NotFound)?;
        let mut out = Vec::with_capacity(entry.size as usize);
        for block in self.chain_blocks(entry.first_block) {
            out.extend_from_slice(&self.read_block(block)?);
        }
        out.truncate(entry.size as usize);
        std::fs::write(host_dst, out)?;
        Ok(())
    }

    /// Writes `data` into `name`'s chain from scratch, allocating a fresh
    /// chain of blocks (used by `cp_host_to_fs` and by the FD layer's
    /// WRITE-mode truncation).
    fn write_fresh(&mut self, name: &str, data: &[u8]) -> Result<(), FsError> {
        let (offset, mut entry) = self.find_file(name)?.ok_or(FsError::NotFound)?;
        let mut prev: Option<u16> = None;
        let mut first_block = FAT_EOC;
        for chunk in data.chunks(self.block_size) {
            let new_block = self.allocate_block()?;
            let mut padded = vec![0u8; self.block_size];
            padded[..chunk.len()].copy_from_slice(chunk);
            self.write_block(new_block, &padded)?;
            if let Some(p) = prev {
                self.set_fat_entry(p, new_block)?;
            } else {
                first_block = new_block;
            }
            prev = Some(new_block);
        }
        entry.first_block = first_block;
        entry.size = data.len() as u32;
        entry.mtime = now_secs();
        self.write_entry_at(offset, &entry)
    }

    /// spec §4.5 `chmod`: mode string `(+|-|=)[rwx]+`.
    pub fn chmod(&mut self, mode: &str, name: &str) -> Result<(), FsError> {
        let (offset, mut entry) = self.find_file(name)?.ok_or(FsError::NotFound)?;
        let mut chars = mode.chars();
        let op = chars
            .next()
            .ok_or_else(|| FsError::InvalidParameter("empty chmod mode".into()))?;
        let mut mask = 0u8;
        for c in chars {
            mask |= match c {
                'r' => PERM_READ,
                'w' => PERM_WRITE,
                'x' => PERM_EXEC,
                other => {
                    return Err(FsError::InvalidParameter(format!("bad chmod letter '{other}'")))
                }
            };
        }
        let new_perm = match op {
            '+' => entry.perm | mask,
            '-' => entry.perm & !mask,
            '=' => mask,
            other => return Err(FsError::InvalidParameter(format!("bad chmod op '{other}'"))),
        };
        if new_perm == 1 || new_perm == 3 {
            return Err(FsError::InvalidParameter(
                "execute-only and write+execute permissions are not allowed".into(),
            ));
        }
        entry.perm = new_perm;
        self.write_entry_at(offset, &entry)
    }

    /// spec §4.5 `ls`: every non-empty entry in the root directory.
    pub fn ls(&mut self) -> Result<Vec<DirEntry>, FsError> {
        let mut out = Vec::new();
        for block in self.root_chain() {
            let data = self.read_block(block)?;
            for slot in 0..self.entries_per_block() {
                let bytes: [u8; DIR_ENTRY_SIZE] =
                    data[slot * DIR_ENTRY_SIZE..(slot + 1) * DIR_ENTRY_SIZE]
                        .try_into()
                        .unwrap();
                let entry = DirEntry::from_bytes(&bytes);
                if !entry.is_free() {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    // --- Helpers used by the file-descriptor layer (crate::fd) ---

    pub(crate) fn read_file(
        &mut self,
        entry: &DirEntry,
        offset: u64,
        n: usize,
    ) -> Result<Vec<u8>, FsError> {
        let size = entry.size as u64;
        if offset >= size {
            return Ok(Vec::new());
        }
        let to_read = std::cmp::min(n as u64, size - offset) as usize;
        let mut out = Vec::with_capacity(to_read);
        let blocks = self.chain_blocks(entry.first_block);
        let mut remaining = to_read;
        let mut pos = offset;
        while remaining > 0 {
            let block_idx = (pos / self.block_size as u64) as usize;
            let within = (pos % self.block_size as u64) as usize;
            let block = *blocks.get(block_idx).ok_or(FsError::ReadError)?;
            let data = self.read_block(block)?;
            let take = std::cmp::min(remaining, self.block_size - within);
            out.extend_from_slice(&data[within..within + take]);
            remaining -= take;
            pos += take as u64;
        }
        Ok(out)
    }

    /// Writes `buf` to `name` at `offset`, allocating/linking new blocks as
    /// needed, and returns the updated directory entry. Used by
    /// [`crate::fd::GlobalFdTable::write`].
    pub(crate) fn write_at(
        &mut self,
        name: &str,
        offset: u64,
        buf: &[u8],
    ) -> Result<DirEntry, FsError> {
        let (dir_offset, mut entry) = self.find_file(name)?.ok_or(FsError::NotFound)?;
        let mut blocks = self.chain_blocks(entry.first_block);

        let end = offset + buf.len() as u64;
        let blocks_needed = if end == 0 {
            0
        } else {
            ((end + self.block_size as u64 - 1) / self.block_size as u64) as usize
        };
        while blocks.len() < blocks_needed {
            let new_block = self.allocate_block()?;
            if let Some(&last) = blocks.last() {
                self.set_fat_entry(last, new_block)?;
            } else {
                entry.first_block = new_block;
            }
            blocks.push(new_block);
        }

        let mut written = 0usize;
        let mut pos = offset;
        while written < buf.len() {
            let block_idx = (pos / self.block_size as u64) as usize;
            let within = (pos % self.block_size as u64) as usize;
            let block = blocks[block_idx];
            let mut data = self.read_block(block)?;
            let take = std::cmp::min(buf.len() - written, self.block_size - within);
            data[within..within + take].copy_from_slice(&buf[written..written + take]);
            self.write_block(block, &data)?;
            written += take;
            pos += take as u64;
        }

        entry.size = std::cmp::max(entry.size, end as u32);
        entry.mtime = now_secs();
        self.write_entry_at(dir_offset, &entry)?;
        Ok(entry)
    }
}

/// Formats one `ls` line per spec §4.5: `first_block perm-string size
/// mtime-formatted name`.
pub fn format_ls_line(entry: &DirEntry) -> String {
    format!(
        "{:>5} {} {:>8} {} {}",
        entry.first_block,
        format::perm_string(entry.perm),
        entry.size,
        entry.mtime,
        entry.name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("img");
        (dir, path)
    }

    #[test]
    fn s1_mkfs_layout() {
        let (_d, path) = fresh();
        FatFs::mkfs(&path, 1, 0).unwrap();
        let fs = FatFs::mount(&path).unwrap();
        assert_eq!(fs.block_size, 256);
        assert_eq!(fs.num_entries, 128);
        assert_eq!(fs.fat[0], 0x0100);
        assert_eq!(fs.fat[1], FAT_EOC);
    }

    #[test]
    fn s2_touch_write_read() {
        let (_d, path) = fresh();
        FatFs::mkfs(&path, 1, 0).unwrap();
        let mut fs = FatFs::mount(&path).unwrap();
        fs.touch_single("a").unwrap();
        fs.write_at("a", 0, b"hello").unwrap();
        let (_, entry) = fs.find_file("a").unwrap().unwrap();
        assert_eq!(entry.size, 5);
        let data = fs.read_file(&entry, 0, 5).unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn rm_reclaims_blocks() {
        let (_d, path) = fresh();
        FatFs::mkfs(&path, 1, 0).unwrap();
        let mut fs = FatFs::mount(&path).unwrap();
        fs.touch_single("a").unwrap();
        fs.write_at("a", 0, &vec![7u8; 1000]).unwrap();
        let (_, entry) = fs.find_file("a").unwrap().unwrap();
        let blocks = fs.chain_blocks(entry.first_block);
        assert!(!blocks.is_empty());
        fs.rm("a").unwrap();
        for b in blocks {
            assert_eq!(fs.fat_entry(b), FAT_FREE);
        }
        assert!(fs.find_file("a").unwrap().is_none());
    }

    #[test]
    fn block_conservation_across_files() {
        let (_d, path) = fresh();
        FatFs::mkfs(&path, 1, 0).unwrap();
        let mut fs = FatFs::mount(&path).unwrap();
        fs.touch_single("a").unwrap();
        fs.touch_single("b").unwrap();
        fs.write_at("a", 0, &vec![1u8; 600]).unwrap();
        fs.write_at("b", 0, &vec![2u8; 600]).unwrap();
        let (_, ea) = fs.find_file("a").unwrap().unwrap();
        let (_, eb) = fs.find_file("b").unwrap().unwrap();
        let ba = fs.chain_blocks(ea.first_block);
        let bb = fs.chain_blocks(eb.first_block);
        let expected_len = (600 + fs.block_size - 1) / fs.block_size;
        assert_eq!(ba.len(), expected_len);
        assert_eq!(bb.len(), expected_len);
        for block in &ba {
            assert!(!bb.contains(block));
        }
    }

    #[test]
    fn chmod_rejects_exec_only_and_write_exec() {
        let (_d, path) = fresh();
        FatFs::mkfs(&path, 1, 0).unwrap();
        let mut fs = FatFs::mount(&path).unwrap();
        fs.touch_single("a").unwrap();
        assert!(fs.chmod("=x", "a").is_err());
        assert!(fs.chmod("=wx", "a").is_err());
        assert!(fs.chmod("=rw", "a").is_ok());
    }

    #[test]
    fn mv_keeps_chain_intact() {
        let (_d, path) = fresh();
        FatFs::mkfs(&path, 1, 0).unwrap();
        let mut fs = FatFs::mount(&path).unwrap();
        fs.touch_single("a").unwrap();
        fs.write_at("a", 0, b"payload").unwrap();
        fs.mv("a", "b").unwrap();
        assert!(fs.find_file("a").unwrap().is_none());
        let (_, entry) = fs.find_file("b").unwrap().unwrap();
        let data = fs.read_file(&entry, 0, 7).unwrap();
        assert_eq!(data, b"payload");
    }

    proptest::proptest! {
        /// spec §6: chmod's resulting permission is only ever one of
        /// {0, 2, 4, 5, 6, 7} — 1 (execute-only) and 3 (write+execute) are
        /// rejected for every reachable `=[rwx]*` mode string, not just the
        /// two hand-picked cases above.
        #[test]
        fn chmod_assign_never_yields_forbidden_perm(
            r in proptest::bool::ANY,
            w in proptest::bool::ANY,
            x in proptest::bool::ANY,
        ) {
            let (_d, path) = fresh();
            FatFs::mkfs(&path, 1, 0).unwrap();
            let mut fs = FatFs::mount(&path).unwrap();
            fs.touch_single("a").unwrap();

            let mut mode = String::from("=");
            if r { mode.push('r'); }
            if w { mode.push('w'); }
            if x { mode.push('x'); }

            let result = fs.chmod(&mode, "a");
            let requested = (r as u8 * PERM_READ) | (w as u8 * PERM_WRITE) | (x as u8 * PERM_EXEC);
            if requested == 1 || requested == 3 {
                proptest::prop_assert!(result.is_err());
            } else {
                proptest::prop_assert!(result.is_ok());
                let (_, entry) = fs.find_file("a").unwrap().unwrap();
                proptest::prop_assert_eq!(entry.perm, requested);
            }
        }
    }
}
