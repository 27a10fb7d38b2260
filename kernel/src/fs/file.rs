//! The global open-file table and byte-granular file I/O.
//!
//! Open files live in a single kernel-wide table; a task's private fd
//! table (in its PCB) maps small local fds onto indices here. Slots 0-2
//! are never handed out — they shadow stdin/stdout/stderr.

use super::superblock::BLOCK_SIZE;

/// Open-file flag: create the file if missing.
pub const O_CREATE: u32 = 1;

pub const SEEK_SET: u32 = 1;
pub const SEEK_CUR: u32 = 2;
pub const SEEK_END: u32 = 3;

/// First block index and in-block offset of a byte position.
pub fn block_of_pos(pos: u32) -> (u32, usize) {
    (pos / BLOCK_SIZE as u32, (pos % BLOCK_SIZE as u32) as usize)
}

/// Data blocks needed to hold `len` bytes.
pub fn blocks_for_len(len: u32) -> u32 {
    (len + BLOCK_SIZE as u32 - 1) / BLOCK_SIZE as u32
}

#[cfg(target_arch = "x86")]
mod table {
    use alloc::vec;
    use alloc::vec::Vec;

    use conquer_once::spin::OnceCell;

    use crate::sync::Mutex;

    use super::super::dir::{self, Dir, DirEntry, FileType};
    use super::super::inode::{self, InodeHandle};
    use super::super::manager::PartitionManager;
    use super::super::superblock::BLOCK_SIZE;
    use super::super::FsError;
    use super::*;

    /// Capacity of the global open-file table.
    pub const MAX_FILES: usize = 1024;

    /// Local fds 0/1/2 are reserved; the matching global slots stay unused
    /// so a local fd value can never alias them by accident.
    const RESERVED_SLOTS: usize = 3;

    /// One open file: flags, cursor, and the shared inode.
    pub struct File {
        pub flags: u32,
        pub pos: u32,
        pub inode: Option<InodeHandle>,
    }

    static FILE_TABLE: OnceCell<Mutex<Vec<File>>> = OnceCell::uninit();

    pub fn file_table_init() {
        FILE_TABLE
            .try_init_once(|| {
                let mut table = Vec::with_capacity(MAX_FILES);
                for _ in 0..MAX_FILES {
                    table.push(File {
                        flags: 0,
                        pos: 0,
                        inode: None,
                    });
                }
                Mutex::new(table)
            })
            .expect("file table already initialized");
    }

    fn with_table<F, R>(f: F) -> R
    where
        F: FnOnce(&mut Vec<File>) -> R,
    {
        let mut table = FILE_TABLE
            .try_get()
            .expect("file table not initialized")
            .lock();
        f(&mut table)
    }

    fn alloc_global_fd(table: &Vec<File>) -> Option<usize> {
        (RESERVED_SLOTS..MAX_FILES).find(|&i| table[i].inode.is_none())
    }

    /// Whether any open file references inode `inode_no`.
    pub fn inode_is_open(inode_no: u32) -> bool {
        with_table(|table| {
            table.iter().any(|file| {
                file.inode
                    .as_ref()
                    .map_or(false, |handle| handle.no() == inode_no)
            })
        })
    }

    /// Create `name` in `parent` as a regular file and open it.
    /// Returns the global fd.
    pub fn file_create(
        pmgr: &PartitionManager,
        parent: &Dir,
        name: &str,
    ) -> Result<usize, FsError> {
        let inode_no = pmgr.alloc_inode_no().ok_or(FsError::NoFreeInodes)?;

        let handle = super::super::create_inode(pmgr, inode_no);
        let entry = DirEntry::new(name, FileType::Normal, inode_no);
        if let Err(err) = dir::create_entry(pmgr, parent, &entry) {
            super::super::close_inode(&handle);
            pmgr.release_inode_no(inode_no);
            return Err(err);
        }

        let gfd = with_table(|table| {
            let gfd = alloc_global_fd(table)?;
            table[gfd] = File {
                flags: 0,
                pos: 0,
                inode: Some(handle.clone()),
            };
            Some(gfd)
        });
        let gfd = match gfd {
            Some(gfd) => gfd,
            None => {
                // Undo the namespace change as well; nothing may point at
                // a released inode number.
                let _ = dir::delete_entry(pmgr, parent, inode_no);
                super::super::close_inode(&handle);
                pmgr.release_inode_no(inode_no);
                return Err(FsError::NoFreeSlots);
            }
        };

        pmgr.sync_inode_btmp(inode_no);
        inode::inode_sync(pmgr, &handle);
        Ok(gfd)
    }

    /// Open an existing inode. Returns the global fd.
    pub fn file_open(
        pmgr: &PartitionManager,
        inode_no: u32,
        flags: u32,
    ) -> Result<usize, FsError> {
        let handle = super::super::open_inode(pmgr, inode_no).ok_or(FsError::NotFound)?;
        with_table(|table| {
            let gfd = match alloc_global_fd(table) {
                Some(gfd) => gfd,
                None => {
                    super::super::close_inode(&handle);
                    return Err(FsError::NoFreeSlots);
                }
            };
            table[gfd] = File {
                flags,
                pos: 0,
                inode: Some(handle),
            };
            Ok(gfd)
        })
    }

    /// Drop an open file, releasing the inode reference.
    pub fn file_close(gfd: usize) -> Result<(), FsError> {
        let handle = with_table(|table| {
            if gfd >= MAX_FILES {
                return Err(FsError::BadFd);
            }
            table[gfd].inode.take().ok_or(FsError::BadFd)
        })?;
        super::super::close_inode(&handle);
        Ok(())
    }

    fn file_inode(gfd: usize) -> Result<InodeHandle, FsError> {
        with_table(|table| {
            if gfd >= MAX_FILES {
                return Err(FsError::BadFd);
            }
            table[gfd].inode.clone().ok_or(FsError::BadFd)
        })
    }

    /// Write `buf` at the file's cursor. Grows the inode as needed; the
    /// gap between an old size and a cursor moved past it is *not*
    /// zeroed. Returns bytes written.
    pub fn file_write(
        pmgr: &PartitionManager,
        gfd: usize,
        buf: &[u8],
    ) -> Result<usize, FsError> {
        let handle = file_inode(gfd)?;
        let pos = with_table(|table| table[gfd].pos);

        let end = pos + buf.len() as u32;
        if blocks_for_len(end) > inode::MAX_FILE_BLOCKS {
            return Err(FsError::TooLarge);
        }

        // Grow first so a failed allocation leaves the file untouched.
        let used = inode::block_used(pmgr, &handle);
        let required = blocks_for_len(end);
        if required > used {
            inode::get_blocks(pmgr, &handle, required - used)?;
        }

        let mut block = vec![0u8; BLOCK_SIZE];
        let mut cursor = pos;
        let mut written = 0usize;

        while written < buf.len() {
            let (sec_idx, offset) = block_of_pos(cursor);
            let chunk = (BLOCK_SIZE - offset).min(buf.len() - written);

            if chunk == BLOCK_SIZE {
                // Whole-block overwrite skips the read.
                block.copy_from_slice(&buf[written..written + BLOCK_SIZE]);
            } else {
                inode::read_sec(pmgr, &handle, sec_idx, &mut block)?;
                block[offset..offset + chunk].copy_from_slice(&buf[written..written + chunk]);
            }
            inode::write_sec(pmgr, &handle, sec_idx, &block)?;

            cursor += chunk as u32;
            written += chunk;
        }

        {
            let mut inode = handle.inode.lock();
            if end > inode.size {
                inode.size = end;
            }
        }
        inode::inode_sync(pmgr, &handle);
        with_table(|table| table[gfd].pos = cursor);
        Ok(written)
    }

    /// Read up to `buf.len()` bytes at the cursor. Returns `Ok(None)` at
    /// end of file.
    pub fn file_read(
        pmgr: &PartitionManager,
        gfd: usize,
        buf: &mut [u8],
    ) -> Result<Option<usize>, FsError> {
        let handle = file_inode(gfd)?;
        let pos = with_table(|table| table[gfd].pos);
        let size = handle.size();

        if pos >= size {
            return Ok(None);
        }
        let want = (buf.len() as u32).min(size - pos) as usize;

        let mut block = vec![0u8; BLOCK_SIZE];
        let mut cursor = pos;
        let mut read = 0usize;

        while read < want {
            let (sec_idx, offset) = block_of_pos(cursor);
            let chunk = (BLOCK_SIZE - offset).min(want - read);

            if inode::read_sec(pmgr, &handle, sec_idx, &mut block).is_err() {
                // Never-written block inside the nominal size: treat as EOF.
                break;
            }
            buf[read..read + chunk].copy_from_slice(&block[offset..offset + chunk]);

            cursor += chunk as u32;
            read += chunk;
        }

        with_table(|table| table[gfd].pos = cursor);
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some(read))
        }
    }

    /// Reposition the cursor. Returns the new position.
    pub fn file_lseek(gfd: usize, offset: i32, whence: u32) -> Result<u32, FsError> {
        let handle = file_inode(gfd)?;
        let size = handle.size() as i64;

        with_table(|table| {
            let pos = table[gfd].pos as i64;
            let new_pos = match whence {
                SEEK_SET => offset as i64,
                SEEK_CUR => pos + offset as i64,
                SEEK_END => size + offset as i64,
                _ => return Err(FsError::InvalidArg),
            };
            if new_pos < 0 || new_pos > size {
                return Err(FsError::InvalidArg);
            }
            table[gfd].pos = new_pos as u32;
            Ok(new_pos as u32)
        })
    }
}

#[cfg(target_arch = "x86")]
pub use table::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_of_pos() {
        assert_eq!(block_of_pos(0), (0, 0));
        assert_eq!(block_of_pos(511), (0, 511));
        assert_eq!(block_of_pos(512), (1, 0));
        assert_eq!(block_of_pos(6976), (13, 320));
    }

    #[test]
    fn test_blocks_for_len() {
        assert_eq!(blocks_for_len(0), 0);
        assert_eq!(blocks_for_len(1), 1);
        assert_eq!(blocks_for_len(512), 1);
        assert_eq!(blocks_for_len(513), 2);
        // 12 full blocks plus one byte forces the 13th block.
        assert_eq!(blocks_for_len(6144), 12);
        assert_eq!(blocks_for_len(6145), 13);
    }
}
