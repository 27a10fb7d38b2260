//! Inodes: the 60-byte on-disk record, the open-inode cache, and block
//! growth with rollback.
//!
//! `blocks[0..12]` are direct data-block LBAs (partition-relative, 0 means
//! absent); `blocks[12]` points at a lazily allocated indirect block of up
//! to 128 further LBAs, for 140 blocks / 70 KiB per file.

use core::mem::size_of;

use super::superblock::{BLOCK_SIZE, INODES_PER_BLOCK};

/// Direct slots per inode.
pub const DIRECT_BLOCKS: u32 = 12;
/// Index of the indirect-block pointer.
pub const INDIRECT_INDEX: usize = 12;
/// LBAs held by the indirect block.
pub const LBAS_PER_INDIRECT: u32 = (BLOCK_SIZE / size_of::<u32>()) as u32;
/// Maximum data blocks an inode can address.
pub const MAX_FILE_BLOCKS: u32 = DIRECT_BLOCKS + LBAS_PER_INDIRECT;

/// On-disk inode record. Also the in-memory representation, guarded by the
/// cache entry's mutex. All fields are `u32`, so `repr(C)` is already the
/// exact 60-byte disk layout.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiskInode {
    pub no: u32,
    /// Byte size for regular files; live-entry count for directories.
    pub size: u32,
    pub blocks: [u32; 13],
}

impl DiskInode {
    pub fn empty(no: u32) -> Self {
        Self {
            no,
            size: 0,
            blocks: [0; 13],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<DiskInode>() {
            return None;
        }
        // SAFETY: length checked; packed POD.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const DiskInode) })
    }

    pub fn write_to(&self, bytes: &mut [u8]) {
        assert!(bytes.len() >= size_of::<DiskInode>());
        unsafe {
            core::ptr::write_unaligned(bytes.as_mut_ptr() as *mut DiskInode, *self);
        }
    }

    /// Byte offset of inode `no` within its inode-table block.
    pub fn table_offset(no: u32) -> usize {
        (no % INODES_PER_BLOCK) as usize * size_of::<DiskInode>()
    }

    /// Which inode-table block (relative to the table start) holds `no`.
    pub fn table_block(no: u32) -> u32 {
        no / INODES_PER_BLOCK
    }
}

#[cfg(target_arch = "x86")]
mod ops {
    use alloc::sync::Arc;
    use alloc::vec;

    use crate::sync::Mutex;

    use super::super::manager::PartitionManager;
    use super::super::superblock::BLOCK_SIZE;
    use super::super::FsError;
    use super::*;

    /// A cached open inode; shared by every open file that references it.
    pub struct InodeCacheEntry {
        pub inode: Mutex<DiskInode>,
    }

    pub type InodeHandle = Arc<InodeCacheEntry>;

    impl InodeCacheEntry {
        pub fn new(inode: DiskInode) -> InodeHandle {
            Arc::new(Self {
                inode: Mutex::new(inode),
            })
        }

        pub fn no(&self) -> u32 {
            let inode = self.inode.lock();
            inode.no
        }

        pub fn size(&self) -> u32 {
            let inode = self.inode.lock();
            inode.size
        }
    }

    /// Absolute LBA of the inode-table block holding `no`.
    fn table_lba(pmgr: &PartitionManager, no: u32) -> u32 {
        let lba = pmgr.sblock.inode_table_lba + DiskInode::table_block(no);
        debug_assert!(lba < pmgr.sblock.inode_table_lba + pmgr.sblock.inode_table_secs);
        lba
    }

    /// Flush `handle`'s record into its inode-table block.
    pub fn inode_sync(pmgr: &PartitionManager, handle: &InodeHandle) {
        let snapshot = *handle.inode.lock();
        let lba = table_lba(pmgr, snapshot.no);

        let mut block = vec![0u8; BLOCK_SIZE];
        pmgr.read_abs(lba, 1, &mut block);
        let offset = DiskInode::table_offset(snapshot.no);
        snapshot.write_to(&mut block[offset..]);
        pmgr.write_abs(lba, 1, &block);
    }

    /// Read inode `no` from the table.
    pub fn inode_load(pmgr: &PartitionManager, no: u32) -> DiskInode {
        let lba = table_lba(pmgr, no);
        let mut block = vec![0u8; BLOCK_SIZE];
        pmgr.read_abs(lba, 1, &mut block);
        let offset = DiskInode::table_offset(no);
        DiskInode::from_bytes(&block[offset..]).expect("inode record straddles block")
    }

    /// Blocks currently allocated to the inode: direct slots first, then
    /// the indirect block's entries if it exists.
    pub fn block_used(pmgr: &PartitionManager, handle: &InodeHandle) -> u32 {
        let snapshot = *handle.inode.lock();

        let mut count = 0;
        for i in 0..DIRECT_BLOCKS as usize {
            if snapshot.blocks[i] != 0 {
                count += 1;
            } else {
                return count;
            }
        }

        if snapshot.blocks[INDIRECT_INDEX] == 0 {
            return count;
        }

        let ext = read_indirect(pmgr, &snapshot).expect("indirect block vanished");
        for lba in ext {
            if lba == 0 {
                break;
            }
            count += 1;
        }
        count
    }

    /// Grow the inode by `cnt` data blocks, allocating every LBA up front
    /// and rolling all of them back on any failure.
    pub fn get_blocks(
        pmgr: &PartitionManager,
        handle: &InodeHandle,
        cnt: u32,
    ) -> Result<(), FsError> {
        let used = block_used(pmgr, handle);
        if used + cnt > MAX_FILE_BLOCKS {
            return Err(FsError::TooLarge);
        }

        // Claim every new LBA before touching the inode.
        let mut new_blocks = vec![0u32; cnt as usize];
        for i in 0..cnt as usize {
            match pmgr.alloc_block_no() {
                Some(no) => new_blocks[i] = no,
                None => {
                    for &no in &new_blocks[..i] {
                        pmgr.release_block_no(no);
                    }
                    return Err(FsError::NoFreeBlocks);
                }
            }
        }

        let rollback = |pmgr: &PartitionManager| {
            for &no in new_blocks.iter() {
                pmgr.release_block_no(no);
            }
        };

        // Case 1: everything fits in the direct slots.
        if used + cnt <= DIRECT_BLOCKS {
            {
                let mut inode = handle.inode.lock();
                for (i, &no) in new_blocks.iter().enumerate() {
                    inode.blocks[used as usize + i] = no;
                }
            }
            inode_sync(pmgr, handle);
            flush_block_bits(pmgr, &new_blocks);
            return Ok(());
        }

        // Case 2: the indirect block already exists; append there.
        if used > DIRECT_BLOCKS {
            let snapshot = *handle.inode.lock();
            let mut ext = match read_indirect(pmgr, &snapshot) {
                Some(ext) => ext,
                None => {
                    rollback(pmgr);
                    return Err(FsError::NoData);
                }
            };
            let ext_used = (used - DIRECT_BLOCKS) as usize;
            for (i, &no) in new_blocks.iter().enumerate() {
                ext[ext_used + i] = no;
            }
            write_indirect(pmgr, &snapshot, &ext);
            flush_block_bits(pmgr, &new_blocks);
            return Ok(());
        }

        // Case 3: straddle — fill the direct tail, then start the
        // indirect block (which itself needs an allocation).
        let ext_block_no = match pmgr.alloc_block_no() {
            Some(no) => no,
            None => {
                rollback(pmgr);
                return Err(FsError::NoFreeBlocks);
            }
        };

        let mut ext = [0u32; LBAS_PER_INDIRECT as usize];
        let direct_fill = (DIRECT_BLOCKS - used) as usize;
        {
            let mut inode = handle.inode.lock();
            inode.blocks[INDIRECT_INDEX] = ext_block_no;
            for i in 0..direct_fill {
                inode.blocks[used as usize + i] = new_blocks[i];
            }
        }
        for i in direct_fill..cnt as usize {
            ext[i - direct_fill] = new_blocks[i];
        }

        let snapshot = *handle.inode.lock();
        inode_sync(pmgr, handle);
        write_indirect(pmgr, &snapshot, &ext);
        flush_block_bits(pmgr, &new_blocks);
        pmgr.sync_block_btmp(ext_block_no);
        Ok(())
    }

    fn flush_block_bits(pmgr: &PartitionManager, blocks: &[u32]) {
        for &no in blocks {
            pmgr.sync_block_btmp(no);
        }
    }

    /// Data-block LBA for `sec_idx`, or `None` if not yet allocated.
    pub fn idx_to_lba(pmgr: &PartitionManager, handle: &InodeHandle, sec_idx: u32) -> Option<u32> {
        if (sec_idx as usize) < INDIRECT_INDEX {
            let inode = handle.inode.lock();
            let lba = inode.blocks[sec_idx as usize];
            return if lba == 0 { None } else { Some(lba) };
        }

        let snapshot = *handle.inode.lock();
        if snapshot.blocks[INDIRECT_INDEX] == 0 {
            return None;
        }
        let ext = read_indirect(pmgr, &snapshot)?;
        let lba = ext[(sec_idx - DIRECT_BLOCKS) as usize];
        if lba == 0 {
            None
        } else {
            Some(lba)
        }
    }

    /// Read one 512-byte data block by sector index. `NoData` doubles as
    /// the EOF signal for never-written blocks.
    pub fn read_sec(
        pmgr: &PartitionManager,
        handle: &InodeHandle,
        sec_idx: u32,
        buf: &mut [u8],
    ) -> Result<(), FsError> {
        let lba = idx_to_lba(pmgr, handle, sec_idx).ok_or(FsError::NoData)?;
        pmgr.read_rel(lba, 1, buf);
        Ok(())
    }

    /// Write one 512-byte data block by sector index.
    pub fn write_sec(
        pmgr: &PartitionManager,
        handle: &InodeHandle,
        sec_idx: u32,
        buf: &[u8],
    ) -> Result<(), FsError> {
        let lba = idx_to_lba(pmgr, handle, sec_idx).ok_or(FsError::NoData)?;
        pmgr.write_rel(lba, 1, buf);
        Ok(())
    }

    fn read_indirect(
        pmgr: &PartitionManager,
        inode: &DiskInode,
    ) -> Option<[u32; LBAS_PER_INDIRECT as usize]> {
        let ext_lba = inode.blocks[INDIRECT_INDEX];
        if ext_lba == 0 {
            return None;
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        pmgr.read_rel(ext_lba, 1, &mut block);

        let mut ext = [0u32; LBAS_PER_INDIRECT as usize];
        for (i, chunk) in block.chunks_exact(4).enumerate() {
            ext[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(ext)
    }

    fn write_indirect(
        pmgr: &PartitionManager,
        inode: &DiskInode,
        ext: &[u32; LBAS_PER_INDIRECT as usize],
    ) {
        let ext_lba = inode.blocks[INDIRECT_INDEX];
        assert!(ext_lba != 0, "writing indirect entries with no indirect block");
        pmgr.write_rel(ext_lba, 1, bytemuck_bytes(ext));
    }

    /// View a little-endian u32 array as bytes (x86 is little-endian).
    fn bytemuck_bytes(words: &[u32; LBAS_PER_INDIRECT as usize]) -> &[u8] {
        unsafe { core::slice::from_raw_parts(words.as_ptr() as *const u8, BLOCK_SIZE) }
    }
}

#[cfg(target_arch = "x86")]
pub use ops::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_is_60_bytes() {
        assert_eq!(size_of::<DiskInode>(), 60);
    }

    #[test]
    fn test_roundtrip() {
        let mut inode = DiskInode::empty(7);
        inode.size = 6976;
        inode.blocks[0] = 100;
        inode.blocks[11] = 123;
        inode.blocks[12] = 200;

        let mut bytes = [0u8; 60];
        inode.write_to(&mut bytes);
        let parsed = DiskInode::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.no, 7);
        assert_eq!(parsed.size, 6976);
        assert_eq!(parsed.blocks, inode.blocks);
    }

    #[test]
    fn test_little_endian_field_layout() {
        let mut inode = DiskInode::empty(1);
        inode.size = 0x0403_0201;
        let mut bytes = [0u8; 60];
        inode.write_to(&mut bytes);
        // no at 0..4, size at 4..8.
        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_table_position() {
        // 8 records per 512-byte block.
        assert_eq!(DiskInode::table_block(0), 0);
        assert_eq!(DiskInode::table_block(7), 0);
        assert_eq!(DiskInode::table_block(8), 1);
        assert_eq!(DiskInode::table_offset(0), 0);
        assert_eq!(DiskInode::table_offset(7), 420);
        assert_eq!(DiskInode::table_offset(9), 60);
    }

    #[test]
    fn test_capacity_constants() {
        assert_eq!(LBAS_PER_INDIRECT, 128);
        assert_eq!(MAX_FILE_BLOCKS, 140);
    }
}
