//! On-disk filesystem: super block, bitmaps, inodes, directories, and the
//! path-level operations behind the file syscalls.

pub mod dir;
pub mod file;
pub mod inode;
pub mod path;
pub mod superblock;

#[cfg(target_arch = "x86")]
pub mod manager;

/// Filesystem-internal error kinds; the syscall boundary flattens these
/// to -1 after logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    BadMagic,
    NoFreeBlocks,
    NoFreeInodes,
    NoFreeSlots,
    NotFound,
    AlreadyExists,
    NotAFile,
    NotADirectory,
    /// Block not yet allocated; doubles as the EOF signal.
    NoData,
    TooLarge,
    BadFd,
    InvalidArg,
    /// Target inode is still open somewhere.
    InUse,
}

#[cfg(target_arch = "x86")]
mod fsys {
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec;
    use alloc::vec::Vec;

    use conquer_once::spin::OnceCell;

    use crate::block::partition::{self, Partition};
    use crate::console;
    use crate::keyboard::KEYBOARD_QUEUE;
    use crate::sync::Mutex;
    use crate::task;

    use super::dir::{self, Dir, DirEntry, FileType};
    use super::file::{self, O_CREATE};
    use super::inode::{self, DiskInode, InodeCacheEntry, InodeHandle};
    use super::manager::{self, PartitionManager};
    use super::path;
    use super::superblock::{SuperBlock, BLOCK_SIZE};
    use super::FsError;

    /// The mounted filesystem.
    pub struct FsManager {
        pub pmgr: PartitionManager,
        root: InodeHandle,
    }

    static FS: OnceCell<FsManager> = OnceCell::uninit();

    /// Open-inode cache: at most one entry per inode number of the
    /// mounted partition.
    static OPEN_INODES: OnceCell<Mutex<Vec<InodeHandle>>> = OnceCell::uninit();

    pub fn fs() -> &'static FsManager {
        FS.try_get().expect("filesystem not mounted")
    }

    fn open_inodes() -> &'static Mutex<Vec<InodeHandle>> {
        OPEN_INODES.get_or_init(|| Mutex::new(Vec::new()))
    }

    // -- inode cache --------------------------------------------------------

    /// Open inode `no`, via the cache when it is already open.
    pub fn open_inode(pmgr: &PartitionManager, no: u32) -> Option<InodeHandle> {
        if !pmgr.validate_inode_no(no) {
            return None;
        }

        let mut cache = open_inodes().lock();
        if let Some(handle) = cache.iter().find(|h| h.no() == no) {
            return Some(handle.clone());
        }

        let handle = InodeCacheEntry::new(inode::inode_load(pmgr, no));
        cache.push(handle.clone());
        Some(handle)
    }

    /// Register a brand-new in-memory inode in the cache.
    pub fn create_inode(_pmgr: &PartitionManager, no: u32) -> InodeHandle {
        let handle = InodeCacheEntry::new(DiskInode::empty(no));
        open_inodes().lock().push(handle.clone());
        handle
    }

    /// Drop one reference; the cache entry disappears when the caller's
    /// reference was the last one outside the cache.
    pub fn close_inode(handle: &InodeHandle) {
        let mut cache = open_inodes().lock();
        if let Some(idx) = cache.iter().position(|h| Arc::ptr_eq(h, handle)) {
            // Cache + this caller: nobody else holds it.
            if Arc::strong_count(handle) == 2 {
                cache.swap_remove(idx);
            }
        }
    }

    // -- mount / format -----------------------------------------------------

    /// Mount the first scanned partition, formatting it first if its super
    /// block is missing.
    pub fn init() {
        let part = partition::with_partitions(|parts| parts.first().cloned())
            .expect("no partitions found");

        let pmgr = match manager::load(part.disk, part.lba_start, part.sec_cnt) {
            Ok(pmgr) => pmgr,
            Err(FsError::BadMagic) => {
                log::info!("no filesystem on {}; formatting", part.name);
                format(&part);
                manager::load(part.disk, part.lba_start, part.sec_cnt)
                    .expect("freshly formatted partition fails to load")
            }
            Err(err) => panic!("cannot mount {}: {:?}", part.name, err),
        };

        file::file_table_init();
        let root = open_inode(&pmgr, pmgr.sblock.root_inode_no)
            .expect("root inode missing from bitmap");

        FS.try_init_once(|| FsManager { pmgr, root })
            .expect("filesystem already mounted");
        log::info!("mounted {} as default file system", part.name);
    }

    /// Write a fresh filesystem onto `part`: super block, both bitmaps
    /// (metadata region and out-of-range tail pre-marked used), and a
    /// zeroed root inode.
    fn format(part: &Partition) {
        let sb = SuperBlock::compute(part.lba_start, part.sec_cnt);

        let mut sector = vec![0u8; BLOCK_SIZE];
        sb.write_to(&mut sector);
        crate::block::disk_write(part.disk, part.lba_start + 1, 1, &sector);

        // Block bitmap: everything below the data region is metadata, and
        // every bit past the partition end must never be handed out.
        let block_btmp_bytes = sb.block_btmp_secs as usize * BLOCK_SIZE;
        let mut block_bits = vec![0u8; block_btmp_bytes];
        let data_start = sb.data_start_rel() as usize;
        for bit in 0..data_start {
            block_bits[bit / 8] |= 1 << (bit % 8);
        }
        for bit in part.sec_cnt as usize..block_btmp_bytes * 8 {
            block_bits[bit / 8] |= 1 << (bit % 8);
        }
        crate::block::disk_write(
            part.disk,
            sb.block_btmp_lba,
            sb.block_btmp_secs,
            &block_bits,
        );

        // Inode bitmap: only the root inode exists.
        let mut inode_bits = vec![0u8; sb.inode_btmp_secs as usize * BLOCK_SIZE];
        inode_bits[0] = 0x01;
        crate::block::disk_write(
            part.disk,
            sb.inode_btmp_lba,
            sb.inode_btmp_secs,
            &inode_bits,
        );

        // Zero the table sector holding the root inode: size 0, no blocks.
        let zeroed = vec![0u8; BLOCK_SIZE];
        crate::block::disk_write(part.disk, sb.inode_table_lba, 1, &zeroed);

        log::info!(
            "formatted {}: {} sectors, data at LBA {}",
            part.name,
            part.sec_cnt,
            sb.data_lba
        );
    }

    /// A fresh handle on the root directory.
    pub fn root_dir() -> Dir {
        Dir::new(fs().root.clone())
    }

    // -- path plumbing ------------------------------------------------------

    /// Resolve an absolute path to its directory entry.
    fn resolve(pathname: &str) -> Option<DirEntry> {
        if !pathname.starts_with('/') || path::is_root(pathname) {
            return None;
        }
        let fsm = fs();
        let root = root_dir();
        let found = dir::search_path(&fsm.pmgr, &root, pathname);
        close_dir(root);
        found
    }

    /// Open the directory at `pathname` ("/" included).
    fn open_dir_path(pathname: &str) -> Option<Dir> {
        if path::is_root(pathname) {
            return Some(root_dir());
        }
        let entry = resolve(pathname)?;
        if !entry.is_dir() {
            return None;
        }
        let handle = open_inode(&fs().pmgr, { entry.inode_no })?;
        Some(Dir::new(handle))
    }

    /// Release a directory handle.
    fn close_dir(dir: Dir) {
        close_inode(&dir.inode);
    }

    /// Install a global fd into the current task's table.
    fn install_local_fd(gfd: usize) -> Option<i32> {
        task::with_fd_table(|table| {
            for (fd, slot) in table.iter_mut().enumerate().skip(3) {
                if *slot == -1 {
                    *slot = gfd as i32;
                    return Some(fd as i32);
                }
            }
            None
        })
    }

    /// Translate a task-local fd (>= 3) to its global table index.
    fn local_to_global(fd: usize) -> Option<usize> {
        if fd < 3 || fd >= 32 {
            return None;
        }
        task::with_fd_table(|table| {
            let gfd = table[fd];
            if gfd < 0 {
                None
            } else {
                Some(gfd as usize)
            }
        })
    }

    // -- syscall backends ---------------------------------------------------

    /// Open (optionally creating) the file at `pathname`.
    pub fn sys_open(pathname: &str, flags: u32) -> i32 {
        if path::is_root(pathname) || !pathname.starts_with('/') {
            log::warn!("open: bad path '{}'", pathname);
            return -1;
        }
        let fsm = fs();

        let gfd = match resolve(pathname) {
            Some(entry) => {
                if entry.is_dir() {
                    log::warn!("open: '{}' is a directory", pathname);
                    return -1;
                }
                file::file_open(&fsm.pmgr, { entry.inode_no }, flags)
            }
            None if flags & O_CREATE != 0 => {
                let (parent_path, base) = match path::parent_and_base(pathname) {
                    Some(split) => split,
                    None => return -1,
                };
                let parent = match open_dir_path(parent_path) {
                    Some(parent) => parent,
                    None => {
                        log::warn!("open: parent '{}' missing", parent_path);
                        return -1;
                    }
                };
                let created = file::file_create(&fsm.pmgr, &parent, base);
                close_dir(parent);
                created
            }
            None => {
                log::warn!("open: '{}' not found", pathname);
                return -1;
            }
        };

        let gfd = match gfd {
            Ok(gfd) => gfd,
            Err(err) => {
                log::warn!("open '{}' failed: {:?}", pathname, err);
                return -1;
            }
        };

        match install_local_fd(gfd) {
            Some(fd) => fd,
            None => {
                let _ = file::file_close(gfd);
                log::warn!("open: task fd table full");
                -1
            }
        }
    }

    pub fn sys_close(fd: usize) -> i32 {
        let gfd = match local_to_global(fd) {
            Some(gfd) => gfd,
            None => return -1,
        };
        task::with_fd_table(|table| table[fd] = -1);
        match file::file_close(gfd) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }

    /// Write to fd: 1/2 go to the console sink, >= 3 to the file layer.
    pub fn sys_write(fd: usize, buf: &[u8]) -> i32 {
        match fd {
            1 | 2 => {
                console::console_write_bytes(buf);
                buf.len() as i32
            }
            0 => -1,
            _ => {
                let gfd = match local_to_global(fd) {
                    Some(gfd) => gfd,
                    None => return -1,
                };
                match file::file_write(&fs().pmgr, gfd, buf) {
                    Ok(written) => written as i32,
                    Err(err) => {
                        log::warn!("write failed: {:?}", err);
                        -1
                    }
                }
            }
        }
    }

    /// Read from fd: 0 blocks on the keyboard ring, >= 3 reads the file;
    /// -1 at end of file.
    pub fn sys_read(fd: usize, buf: &mut [u8]) -> i32 {
        match fd {
            0 => {
                for slot in buf.iter_mut() {
                    *slot = KEYBOARD_QUEUE.getchar();
                }
                buf.len() as i32
            }
            1 | 2 => -1,
            _ => {
                let gfd = match local_to_global(fd) {
                    Some(gfd) => gfd,
                    None => return -1,
                };
                match file::file_read(&fs().pmgr, gfd, buf) {
                    Ok(Some(read)) => read as i32,
                    Ok(None) => -1,
                    Err(err) => {
                        log::warn!("read failed: {:?}", err);
                        -1
                    }
                }
            }
        }
    }

    pub fn sys_lseek(fd: usize, offset: i32, whence: u32) -> i32 {
        let gfd = match local_to_global(fd) {
            Some(gfd) => gfd,
            None => return -1,
        };
        match file::file_lseek(gfd, offset, whence) {
            Ok(pos) => pos as i32,
            Err(err) => {
                log::warn!("lseek failed: {:?}", err);
                -1
            }
        }
    }

    /// Delete a regular file: namespace first, then the inode bit and its
    /// blocks, so a crash can leak blocks but never corrupt the tree.
    pub fn sys_unlink(pathname: &str) -> i32 {
        let fsm = fs();
        let entry = match resolve(pathname) {
            Some(entry) => entry,
            None => {
                log::warn!("unlink: '{}' not found", pathname);
                return -1;
            }
        };
        if entry.is_dir() {
            log::warn!("unlink: '{}' is a directory", pathname);
            return -1;
        }
        let inode_no = { entry.inode_no };
        if file::inode_is_open(inode_no) {
            log::warn!("unlink: '{}' is in use", pathname);
            return -1;
        }

        let (parent_path, _) = match path::parent_and_base(pathname) {
            Some(split) => split,
            None => return -1,
        };
        let parent = match open_dir_path(parent_path) {
            Some(parent) => parent,
            None => return -1,
        };
        let deleted = dir::delete_entry(&fsm.pmgr, &parent, inode_no);
        close_dir(parent);
        if deleted.is_err() {
            return -1;
        }

        release_inode_blocks(&fsm.pmgr, inode_no);
        fsm.pmgr.release_inode_no(inode_no);
        fsm.pmgr.sync_inode_btmp(inode_no);
        0
    }

    /// Free every data block of a (closed) inode, the indirect block
    /// included.
    fn release_inode_blocks(pmgr: &PartitionManager, inode_no: u32) {
        let record = inode::inode_load(pmgr, inode_no);

        for &lba in record.blocks[..inode::INDIRECT_INDEX].iter() {
            if lba != 0 {
                pmgr.release_block_no(lba);
                pmgr.sync_block_btmp(lba);
            }
        }

        let ext_lba = record.blocks[inode::INDIRECT_INDEX];
        if ext_lba != 0 {
            let mut block = vec![0u8; BLOCK_SIZE];
            pmgr.read_rel(ext_lba, 1, &mut block);
            for chunk in block.chunks_exact(4) {
                let lba = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if lba != 0 {
                    pmgr.release_block_no(lba);
                    pmgr.sync_block_btmp(lba);
                }
            }
            pmgr.release_block_no(ext_lba);
            pmgr.sync_block_btmp(ext_lba);
        }
    }

    /// Create an empty directory at `pathname`.
    pub fn sys_mkdir(pathname: &str) -> i32 {
        if resolve(pathname).is_some() {
            log::warn!("mkdir: '{}' exists", pathname);
            return -1;
        }
        let (parent_path, base) = match path::parent_and_base(pathname) {
            Some(split) => split,
            None => return -1,
        };
        let fsm = fs();
        let parent = match open_dir_path(parent_path) {
            Some(parent) => parent,
            None => {
                log::warn!("mkdir: parent '{}' missing", parent_path);
                return -1;
            }
        };

        let inode_no = match fsm.pmgr.alloc_inode_no() {
            Some(no) => no,
            None => {
                close_dir(parent);
                return -1;
            }
        };
        let handle = create_inode(&fsm.pmgr, inode_no);
        let entry = DirEntry::new(base, FileType::Dir, inode_no);

        let created = dir::create_entry(&fsm.pmgr, &parent, &entry);
        close_dir(parent);
        if created.is_err() {
            close_inode(&handle);
            fsm.pmgr.release_inode_no(inode_no);
            return -1;
        }

        fsm.pmgr.sync_inode_btmp(inode_no);
        inode::inode_sync(&fsm.pmgr, &handle);
        close_inode(&handle);
        0
    }

    /// Open a directory stream; the handle is heap-allocated and owned by
    /// the caller until `sys_closedir`.
    pub fn sys_opendir(pathname: &str) -> Option<*mut Dir> {
        let dir = open_dir_path(pathname)?;
        Some(Box::into_raw(Box::new(dir)))
    }

    /// Next live entry of the stream, or null at the end. The returned
    /// pointer aliases scratch space inside the `Dir` handle.
    pub fn sys_readdir(dir: *mut Dir) -> *mut DirEntry {
        if dir.is_null() {
            return core::ptr::null_mut();
        }
        let fsm = fs();
        unsafe {
            match dir::read_entry(&fsm.pmgr, &mut *dir) {
                Some(entry) => {
                    (*dir).ent = entry;
                    core::ptr::addr_of_mut!((*dir).ent)
                }
                None => core::ptr::null_mut(),
            }
        }
    }

    pub fn sys_closedir(dir: *mut Dir) -> i32 {
        if dir.is_null() {
            return -1;
        }
        // SAFETY: handed out by sys_opendir, ownership returns here.
        let dir = unsafe { Box::from_raw(dir) };
        close_dir(*dir);
        0
    }
}

#[cfg(target_arch = "x86")]
pub use fsys::*;
