//! End-to-end filesystem scenarios against the freshly mounted partition.

use alloc::vec;
use alloc::vec::Vec;

use crate::fs::file::{O_CREATE, SEEK_END, SEEK_SET};
use crate::fs::inode::INDIRECT_INDEX;
use crate::fs::{self, dir::FileType};

use super::report;

const HELLO: &[u8] = b"hello world\n";
const DUCK: &[u8] = b"duckduck";
const DUCK_REPEATS: usize = 869;
const CHLOE_LEN: usize = 12 + DUCK_REPEATS * 8 + 12; // 6976

/// Inode number of a root-level name, through the public readdir path.
fn root_inode_no(name: &str) -> Option<u32> {
    let dir = fs::sys_opendir("/")?;
    let mut found = None;
    loop {
        let entry = fs::sys_readdir(dir);
        if entry.is_null() {
            break;
        }
        let entry = unsafe { &*entry };
        if entry.name() == name {
            found = Some({ entry.inode_no });
            break;
        }
    }
    fs::sys_closedir(dir);
    found
}

/// Write a known pattern, close, reopen, and read it back in 5-byte
/// chunks until EOF.
fn test_write_read_roundtrip() {
    let fd = fs::sys_open("/chloe", O_CREATE);
    assert!(fd >= 3, "create /chloe failed");
    let fd = fd as usize;

    let mut expected = Vec::with_capacity(CHLOE_LEN);
    expected.extend_from_slice(HELLO);
    assert_eq!(fs::sys_write(fd, HELLO), HELLO.len() as i32);
    for _ in 0..DUCK_REPEATS {
        assert_eq!(fs::sys_write(fd, DUCK), DUCK.len() as i32);
        expected.extend_from_slice(DUCK);
    }
    assert_eq!(fs::sys_write(fd, HELLO), HELLO.len() as i32);
    expected.extend_from_slice(HELLO);
    assert_eq!(expected.len(), CHLOE_LEN);
    assert_eq!(fs::sys_close(fd), 0);

    let fd = fs::sys_open("/chloe", 0);
    assert!(fd >= 3, "reopen /chloe failed");
    let fd = fd as usize;

    let mut actual = Vec::with_capacity(CHLOE_LEN);
    let mut chunk = [0u8; 5];
    loop {
        let n = fs::sys_read(fd, &mut chunk);
        if n < 0 {
            break;
        }
        actual.extend_from_slice(&chunk[..n as usize]);
    }
    assert_eq!(fs::sys_close(fd), 0);

    assert_eq!(actual.len(), CHLOE_LEN);
    assert_eq!(actual, expected, "read-back differs from written pattern");
    assert_eq!(&actual[CHLOE_LEN - 12..], HELLO, "trailing line mangled");
    report("fs_write_read_roundtrip");
}

/// SEEK_END lands on the size; negative offsets step back from it.
fn test_lseek() {
    let fd = fs::sys_open("/chloe", 0);
    assert!(fd >= 3);
    let fd = fd as usize;

    assert_eq!(fs::sys_lseek(fd, 0, SEEK_END), CHLOE_LEN as i32);
    assert_eq!(fs::sys_lseek(fd, -12, SEEK_END), (CHLOE_LEN - 12) as i32);

    let mut tail = [0u8; 12];
    assert_eq!(fs::sys_read(fd, &mut tail), 12);
    assert_eq!(&tail, HELLO);

    assert_eq!(fs::sys_lseek(fd, 0, SEEK_SET), 0);
    assert_eq!(fs::sys_close(fd), 0);
    report("fs_lseek");
}

/// Fresh directories iterate in creation order with correct types.
fn test_directory_iteration() {
    assert_eq!(fs::sys_mkdir("/root"), 0);
    assert_eq!(fs::sys_mkdir("/root/a"), 0);
    assert_eq!(fs::sys_mkdir("/root/b"), 0);
    let fd = fs::sys_open("/root/c", O_CREATE);
    assert!(fd >= 3);
    assert_eq!(fs::sys_close(fd as usize), 0);

    let dir = fs::sys_opendir("/root").expect("opendir /root failed");
    let expected = [("a", FileType::Dir), ("b", FileType::Dir), ("c", FileType::Normal)];
    for (name, f_type) in expected {
        let entry = fs::sys_readdir(dir);
        assert!(!entry.is_null(), "readdir ended early before '{}'", name);
        let entry = unsafe { &*entry };
        assert_eq!(entry.name(), name);
        assert_eq!(entry.file_type(), Some(f_type));
    }
    assert!(fs::sys_readdir(dir).is_null(), "unexpected extra entry");
    assert_eq!(fs::sys_closedir(dir), 0);
    report("fs_directory_iteration");
}

/// Exactly 12 direct blocks hold 6144 bytes; one more byte forces the
/// indirect block into existence.
fn test_indirect_growth() {
    let fd = fs::sys_open("/bigfile", O_CREATE);
    assert!(fd >= 3);
    let fd = fd as usize;

    let pattern: Vec<u8> = (0..6144u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(fs::sys_write(fd, &pattern), 6144);

    let inode_no = root_inode_no("bigfile").expect("bigfile not in root");
    let pmgr = &fs::fs().pmgr;

    let handle = fs::open_inode(pmgr, inode_no).expect("cannot open bigfile inode");
    {
        let inode = handle.inode.lock();
        assert_eq!(inode.size, 6144);
        assert_eq!(
            inode.blocks[INDIRECT_INDEX], 0,
            "indirect block allocated too early"
        );
    }

    assert_eq!(fs::sys_write(fd, b"!"), 1);
    {
        let inode = handle.inode.lock();
        assert_eq!(inode.size, 6145);
        assert_ne!(inode.blocks[INDIRECT_INDEX], 0, "indirect block missing");
    }
    fs::close_inode(&handle);

    assert_eq!(fs::sys_lseek(fd, 0, SEEK_SET), 0);
    let mut actual = vec![0u8; 6145];
    let mut read_total = 0usize;
    while read_total < actual.len() {
        let n = fs::sys_read(fd, &mut actual[read_total..]);
        if n < 0 {
            break;
        }
        read_total += n as usize;
    }
    assert_eq!(read_total, 6145);
    assert_eq!(&actual[..6144], &pattern[..]);
    assert_eq!(actual[6144], b'!');

    assert_eq!(fs::sys_close(fd), 0);
    report("fs_indirect_growth");
}

/// After unlink, the name is gone and every bitmap bit the file held is
/// clear again.
fn test_unlink() {
    let fd = fs::sys_open("/scratch", O_CREATE);
    assert!(fd >= 3);
    let fd = fd as usize;
    let junk = vec![0xA5u8; 2000];
    assert_eq!(fs::sys_write(fd, &junk), 2000);
    assert_eq!(fs::sys_close(fd), 0);

    let inode_no = root_inode_no("scratch").expect("scratch not in root");
    let pmgr = &fs::fs().pmgr;

    // Snapshot the allocated blocks, then drop our handle so the file is
    // closed when unlink checks.
    let handle = fs::open_inode(pmgr, inode_no).expect("cannot open scratch inode");
    let snapshot = *handle.inode.lock();
    fs::close_inode(&handle);

    assert_eq!(fs::sys_unlink("/scratch"), 0);
    assert_eq!(fs::sys_open("/scratch", 0), -1, "unlinked file still opens");

    assert!(!pmgr.inode_bit(inode_no), "inode bit still set");
    for &lba in snapshot.blocks.iter() {
        if lba != 0 {
            assert!(!pmgr.block_bit(lba), "block {} still marked used", lba);
        }
    }
    report("fs_unlink");
}

pub fn run() {
    test_write_read_roundtrip();
    test_lseek();
    test_directory_iteration();
    test_indirect_growth();
    test_unlink();
}
