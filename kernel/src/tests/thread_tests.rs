//! Scheduler and allocator scenarios.

use alloc::vec::Vec;

use crate::arch::VirtAddr;
use crate::memory;
use crate::sync::{Mutex, Semaphore};
use crate::task;

use super::report;

/// Shared log the fairness workers append their IDs to.
static FAIRNESS_LOG: Mutex<Vec<u8>> = Mutex::new(Vec::new());
static FAIRNESS_DONE: Semaphore = Semaphore::new(0);

const WORKERS: usize = 3;
const APPENDS: usize = 100;

fn fairness_worker(id: usize) {
    for _ in 0..APPENDS {
        FAIRNESS_LOG.lock().push(b'A' + id as u8);
        // Force plenty of interleaving.
        task::thread_yield();
    }
    FAIRNESS_DONE.post();
}

/// Three equal-priority threads each append their ID 100 times under a
/// mutex; afterwards the log holds exactly 100 of each.
fn test_thread_fairness() {
    for id in 0..WORKERS {
        task::thread_start("fairness", 8, fairness_worker, id).expect("cannot start worker");
    }
    for _ in 0..WORKERS {
        FAIRNESS_DONE.wait();
    }

    let log = FAIRNESS_LOG.lock();
    assert_eq!(log.len(), WORKERS * APPENDS, "lost or duplicated appends");
    for id in 0..WORKERS {
        let count = log.iter().filter(|&&b| b == b'A' + id as u8).count();
        assert_eq!(count, APPENDS, "worker {} appended {} times", id, count);
    }
    report("thread_fairness");
}

/// Page allocation is fully reversible: freeing returns both the VA-pool
/// bits and the frames, so an identical request lands on the same pages.
fn test_page_alloc_roundtrip() {
    let first = memory::alloc_kernel_pages(3).expect("out of kernel pages");
    memory::free_pages(first, 3);
    let second = memory::alloc_kernel_pages(3).expect("out of kernel pages");
    assert_eq!(first, second, "free_pages did not restore the bitmaps");
    memory::free_pages(second, 3);
    report("page_alloc_roundtrip");
}

/// Small blocks go back to their arena and get reused; the arena header
/// sits at the block's page base.
fn test_malloc_free_roundtrip() {
    let sizes = [1usize, 16, 17, 100, 512, 1024, 2000, 5000];
    for &size in &sizes {
        let first = memory::sys_malloc(size).expect("sys_malloc failed");
        memory::sys_free(first);
        let second = memory::sys_malloc(size).expect("sys_malloc failed");
        assert_eq!(first, second, "freed {}-byte block not reused", size);
        memory::sys_free(second);
    }

    // A small block's arena is its page base.
    let block = memory::sys_malloc(64).expect("sys_malloc failed");
    let arena = crate::memory::heap::arena_of(block.as_u32() as usize);
    assert_eq!(
        arena as u32,
        VirtAddr::new(block.as_u32()).align_down(4096).as_u32()
    );
    memory::sys_free(block);
    report("malloc_free_roundtrip");
}

/// A recursive acquire needs as many matching releases; the holder stays
/// the same throughout.
fn test_mutex_recursion() {
    use crate::sync::Lock;
    static LOCK: Lock = Lock::new();

    LOCK.acquire();
    LOCK.acquire();
    LOCK.acquire();
    assert!(LOCK.held_by_current());
    LOCK.release();
    LOCK.release();
    assert!(LOCK.held_by_current(), "released too early");
    LOCK.release();
    assert!(!LOCK.held_by_current());
    report("mutex_recursion");
}

pub fn run() {
    test_page_alloc_roundtrip();
    test_malloc_free_roundtrip();
    test_mutex_recursion();
    test_thread_fairness();
}
