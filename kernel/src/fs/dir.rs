//! Directories: the packed 58-byte entry record and the entry-array
//! operations over a directory inode's data blocks.
//!
//! A directory's data blocks form a dense array of entries; a slot with
//! `inode_no == 0` is a hole left by deletion (the root inode is 0 but the
//! root never appears as an entry of any directory). `inode.size` counts
//! live entries only.

use core::mem::size_of;

use super::superblock::BLOCK_SIZE;

pub const FILENAME_LEN: usize = 50;

/// Directory entries per 512-byte block.
pub const ENTRIES_PER_BLOCK: u32 = (BLOCK_SIZE / size_of::<DirEntry>()) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    Dir = 0,
    Normal = 1,
}

impl FileType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(FileType::Dir),
            1 => Some(FileType::Normal),
            _ => None,
        }
    }
}

/// On-disk directory entry.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct DirEntry {
    pub filename: [u8; FILENAME_LEN],
    pub f_type: u32,
    pub inode_no: u32,
}

impl DirEntry {
    pub fn new(name: &str, f_type: FileType, inode_no: u32) -> Self {
        let mut filename = [0u8; FILENAME_LEN];
        let bytes = name.as_bytes();
        let len = bytes.len().min(FILENAME_LEN - 1);
        filename[..len].copy_from_slice(&bytes[..len]);
        Self {
            filename,
            f_type: f_type as u32,
            inode_no,
        }
    }

    pub const fn hole() -> Self {
        Self {
            filename: [0; FILENAME_LEN],
            f_type: 0,
            inode_no: 0,
        }
    }

    pub fn name(&self) -> &str {
        let len = self
            .filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_LEN);
        core::str::from_utf8(&self.filename[..len]).unwrap_or("")
    }

    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_u32(self.f_type)
    }

    pub fn is_dir(&self) -> bool {
        self.f_type == FileType::Dir as u32
    }

    /// A live entry names an inode; inode 0 (the root) never appears as
    /// an entry, so 0 marks a hole.
    pub fn is_live(&self) -> bool {
        let no = self.inode_no;
        no != 0
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<DirEntry>() {
            return None;
        }
        // SAFETY: length checked; packed POD.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const DirEntry) })
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= size_of::<DirEntry>());
        unsafe {
            core::ptr::write_unaligned(bytes.as_mut_ptr() as *mut DirEntry, *self);
        }
    }

    /// Byte offset of entry `slot` inside its block.
    pub fn slot_offset(slot: u32) -> usize {
        slot as usize * size_of::<DirEntry>()
    }
}

#[cfg(target_arch = "x86")]
mod ops {
    use super::super::inode::{self, InodeHandle};
    use super::super::manager::PartitionManager;
    use super::super::path;
    use super::super::superblock::BLOCK_SIZE;
    use super::super::FsError;
    use super::*;

    use alloc::vec;

    /// An open directory: its inode plus a cursor for `readdir`.
    pub struct Dir {
        pub inode: InodeHandle,
        /// Absolute entry index of the next `readdir` step.
        pub pos: u32,
        /// Scratch entry returned to `readdir` callers by pointer.
        pub ent: DirEntry,
    }

    impl Dir {
        pub fn new(inode: InodeHandle) -> Self {
            Self {
                inode,
                pos: 0,
                ent: DirEntry::hole(),
            }
        }
    }

    /// Find `name` among the entries of `dir` (single component, no
    /// slashes).
    pub fn search(pmgr: &PartitionManager, dir: &Dir, name: &str) -> Option<DirEntry> {
        if name.is_empty() {
            return None;
        }
        let live_total = dir.inode.size();
        let mut live_seen = 0;
        let mut block = vec![0u8; BLOCK_SIZE];

        for sec_idx in 0..inode::MAX_FILE_BLOCKS {
            if live_seen >= live_total {
                return None;
            }
            if inode::read_sec(pmgr, &dir.inode, sec_idx, &mut block).is_err() {
                return None;
            }
            for slot in 0..ENTRIES_PER_BLOCK {
                let entry = DirEntry::from_bytes(&block[DirEntry::slot_offset(slot)..])
                    .expect("entry straddles block");
                if !entry.is_live() {
                    continue;
                }
                if entry.name() == name {
                    return Some(entry);
                }
                live_seen += 1;
            }
        }
        None
    }

    /// Recursive path resolution: split at the first `/`, the left
    /// component must be an existing directory, recurse on the rest.
    pub fn search_path(pmgr: &PartitionManager, dir: &Dir, rel_path: &str) -> Option<DirEntry> {
        let (component, rest) = path::split_first(rel_path);
        if component.is_empty() {
            return None;
        }

        let entry = search(pmgr, dir, component)?;
        if rest.is_empty() {
            return Some(entry);
        }
        if !entry.is_dir() {
            return None;
        }

        let child_inode = super::super::open_inode(pmgr, entry.inode_no)?;
        let child = Dir::new(child_inode);
        let found = search_path(pmgr, &child, rest);
        super::super::close_inode(&child.inode);
        found
    }

    /// Insert `entry` into `dir`: reuse the first hole in the existing
    /// blocks, or grow the directory by one block and use its first slot.
    pub fn create_entry(
        pmgr: &PartitionManager,
        dir: &Dir,
        entry: &DirEntry,
    ) -> Result<(), FsError> {
        let used_blocks = inode::block_used(pmgr, &dir.inode);
        let mut block = vec![0u8; BLOCK_SIZE];

        for sec_idx in 0..used_blocks {
            inode::read_sec(pmgr, &dir.inode, sec_idx, &mut block)?;
            for slot in 0..ENTRIES_PER_BLOCK {
                let offset = DirEntry::slot_offset(slot);
                let existing =
                    DirEntry::from_bytes(&block[offset..]).expect("entry straddles block");
                if !existing.is_live() {
                    entry.write_to(&mut block[offset..]);
                    {
                        let mut inode = dir.inode.inode.lock();
                        inode.size += 1;
                    }
                    inode::inode_sync(pmgr, &dir.inode);
                    inode::write_sec(pmgr, &dir.inode, sec_idx, &block)?;
                    return Ok(());
                }
            }
        }

        // No hole anywhere: grow by one block and write at offset 0.
        inode::get_blocks(pmgr, &dir.inode, 1)?;
        block.fill(0);
        entry.write_to(&mut block[..]);
        {
            let mut inode = dir.inode.inode.lock();
            inode.size += 1;
        }
        inode::inode_sync(pmgr, &dir.inode);
        inode::write_sec(pmgr, &dir.inode, used_blocks, &block)?;
        Ok(())
    }

    /// Remove the entry naming `inode_no`: overwrite its `inode_no` with
    /// 0 and drop the live count.
    pub fn delete_entry(
        pmgr: &PartitionManager,
        dir: &Dir,
        inode_no: u32,
    ) -> Result<(), FsError> {
        let used_blocks = inode::block_used(pmgr, &dir.inode);
        let mut block = vec![0u8; BLOCK_SIZE];

        for sec_idx in 0..used_blocks {
            inode::read_sec(pmgr, &dir.inode, sec_idx, &mut block)?;
            for slot in 0..ENTRIES_PER_BLOCK {
                let offset = DirEntry::slot_offset(slot);
                let mut entry =
                    DirEntry::from_bytes(&block[offset..]).expect("entry straddles block");
                if entry.is_live() && entry.inode_no == inode_no {
                    entry.inode_no = 0;
                    entry.write_to(&mut block[offset..]);
                    inode::write_sec(pmgr, &dir.inode, sec_idx, &block)?;
                    {
                        let mut inode = dir.inode.inode.lock();
                        inode.size -= 1;
                    }
                    inode::inode_sync(pmgr, &dir.inode);
                    return Ok(());
                }
            }
        }
        Err(FsError::NotFound)
    }

    /// Yield the next live entry at or after the cursor, advancing it.
    pub fn read_entry(pmgr: &PartitionManager, dir: &mut Dir) -> Option<DirEntry> {
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut cached_sec = u32::MAX;

        while dir.pos < inode::MAX_FILE_BLOCKS * ENTRIES_PER_BLOCK {
            let sec_idx = dir.pos / ENTRIES_PER_BLOCK;
            let slot = dir.pos % ENTRIES_PER_BLOCK;

            if sec_idx != cached_sec {
                if inode::read_sec(pmgr, &dir.inode, sec_idx, &mut block).is_err() {
                    return None;
                }
                cached_sec = sec_idx;
            }

            dir.pos += 1;
            let entry = DirEntry::from_bytes(&block[DirEntry::slot_offset(slot)..])
                .expect("entry straddles block");
            if entry.is_live() {
                return Some(entry);
            }
        }
        None
    }
}

#[cfg(target_arch = "x86")]
pub use ops::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_58_bytes() {
        assert_eq!(size_of::<DirEntry>(), 58);
        assert_eq!(ENTRIES_PER_BLOCK, 8);
    }

    #[test]
    fn test_roundtrip_and_name() {
        let entry = DirEntry::new("chloe", FileType::Normal, 9);
        let mut bytes = [0u8; 58];
        entry.write_to(&mut bytes);

        let parsed = DirEntry::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.name(), "chloe");
        assert_eq!(parsed.file_type(), Some(FileType::Normal));
        assert_eq!({ parsed.inode_no }, 9);
        assert!(parsed.is_live());
    }

    #[test]
    fn test_field_offsets() {
        let entry = DirEntry::new("d", FileType::Dir, 0x0304_0506);
        let mut bytes = [0u8; 58];
        entry.write_to(&mut bytes);
        assert_eq!(bytes[0], b'd');
        // f_type at 50..54, inode_no at 54..58, little-endian.
        assert_eq!(&bytes[50..54], &[0, 0, 0, 0]);
        assert_eq!(&bytes[54..58], &[0x06, 0x05, 0x04, 0x03]);
    }

    #[test]
    fn test_hole_is_not_live() {
        assert!(!DirEntry::hole().is_live());
    }

    #[test]
    fn test_name_truncated_to_capacity() {
        let long = "x".repeat(80);
        let entry = DirEntry::new(&long, FileType::Normal, 1);
        assert_eq!(entry.name().len(), FILENAME_LEN - 1);
    }

    #[test]
    fn test_slot_offsets() {
        assert_eq!(DirEntry::slot_offset(0), 0);
        assert_eq!(DirEntry::slot_offset(1), 58);
        assert_eq!(DirEntry::slot_offset(7), 406);
    }
}
