//! Memory-manager front end: pool construction, page-granular allocation,
//! and the small-block `sys_malloc`/`sys_free` pair.
//!
//! The loader leaves the total RAM size as a little-endian `u32` at
//! physical `0xA00`. Everything above the loader's footprint (the low MiB
//! plus the 256 kernel page-table frames) is split evenly into the kernel
//! and user frame pools.

use core::alloc::{GlobalAlloc, Layout};

use conquer_once::spin::OnceCell;

use crate::arch::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::list::List;
use crate::sync::Mutex;
use crate::task;

use super::heap::{self, Arena, MemBlockDesc, ARENA_HDR_SIZE, DESC_CNT, MAX_BLOCK_SIZE};
use super::paging::{self, PageFlags};
use super::pool::{FramePool, VirtPool};

/// Where the loader stored the BIOS-probed RAM size, through the kernel's
/// low identity window.
const TOTAL_MEM_BYTES_ADDR: VirtAddr = VirtAddr::new(0xC000_0A00);

/// Low physical memory owned by the loader: the first MiB plus the kernel
/// page directory and its 255 pre-built page tables.
const LOADER_FOOTPRINT: u32 = 0x0010_0000 + 256 * PAGE_SIZE;

/// Bottom of the kernel heap window.
pub const KERNEL_HEAP_START: VirtAddr = VirtAddr::new(0xC010_0000);
/// Start of kernel space; everything below is per-process.
pub const KERNEL_SPACE_BASE: u32 = 0xC000_0000;
/// Where user images are linked.
pub const USER_VADDR_START: VirtAddr = VirtAddr::new(0x0804_8000);
/// Top of the user stack (exclusive).
pub const USER_STACK_TOP: VirtAddr = VirtAddr::new(0xC000_0000);

/// Each pool bitmap can track up to 64 Ki frames (256 MiB per pool).
const POOL_BITMAP_BYTES: usize = 8192;

static mut KERNEL_FRAME_BITS: [u8; POOL_BITMAP_BYTES] = [0; POOL_BITMAP_BYTES];
static mut USER_FRAME_BITS: [u8; POOL_BITMAP_BYTES] = [0; POOL_BITMAP_BYTES];
static mut KERNEL_VADDR_BITS: [u8; POOL_BITMAP_BYTES] = [0; POOL_BITMAP_BYTES];

/// Which pool a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Kernel,
    User,
}

/// Kernel frame pool and kernel VA pool share one mutex: a page-granular
/// kernel allocation touches both.
struct KernelPools {
    frames: FramePool,
    vaddr: VirtPool,
}

static KERNEL_POOLS: OnceCell<Mutex<KernelPools>> = OnceCell::uninit();
static USER_FRAMES: OnceCell<Mutex<FramePool>> = OnceCell::uninit();

/// Kernel size-class descriptors, touched only under [`KERNEL_HEAP_LOCK`].
static mut KERNEL_DESCS: [MemBlockDesc; DESC_CNT] = [
    MemBlockDesc::new(),
    MemBlockDesc::new(),
    MemBlockDesc::new(),
    MemBlockDesc::new(),
    MemBlockDesc::new(),
    MemBlockDesc::new(),
    MemBlockDesc::new(),
];

static KERNEL_HEAP_LOCK: Mutex<()> = Mutex::new(());
static USER_HEAP_LOCK: Mutex<()> = Mutex::new(());

fn kernel_pools() -> &'static Mutex<KernelPools> {
    KERNEL_POOLS.try_get().expect("memory not initialized")
}

fn user_frames() -> &'static Mutex<FramePool> {
    USER_FRAMES.try_get().expect("memory not initialized")
}

/// Carve `bytes` out of a static bitmap buffer.
///
/// # Safety
/// Each buffer is handed out exactly once, during `init`.
unsafe fn carve(buffer: *mut [u8; POOL_BITMAP_BYTES]) -> &'static mut [u8] {
    core::slice::from_raw_parts_mut(buffer as *mut u8, POOL_BITMAP_BYTES)
}

/// Build both frame pools and the kernel VA pool from the BIOS-reported
/// RAM size and set up the kernel heap descriptors.
pub fn init() {
    let total_bytes = unsafe { *TOTAL_MEM_BYTES_ADDR.as_ptr::<u32>() };
    let free_bytes = total_bytes - LOADER_FOOTPRINT;
    let mut free_pages = (free_bytes / PAGE_SIZE) as usize;

    let capacity = POOL_BITMAP_BYTES * 8 * 2;
    if free_pages > capacity {
        log::warn!(
            "clamping usable memory to {} MiB (pool bitmap capacity)",
            capacity * PAGE_SIZE as usize / (1024 * 1024)
        );
        free_pages = capacity;
    }

    let kernel_pages = free_pages / 2;
    let user_pages = free_pages - kernel_pages;

    let kernel_phys_start = PhysAddr::new(LOADER_FOOTPRINT);
    let user_phys_start = kernel_phys_start + (kernel_pages as u32) * PAGE_SIZE;

    KERNEL_POOLS
        .try_init_once(|| {
            let frames = FramePool::new(
                unsafe { carve(core::ptr::addr_of_mut!(KERNEL_FRAME_BITS)) },
                kernel_phys_start,
                kernel_pages,
            );
            let vaddr = VirtPool::new(
                unsafe { carve(core::ptr::addr_of_mut!(KERNEL_VADDR_BITS)) },
                KERNEL_HEAP_START,
                kernel_pages,
            );
            Mutex::new(KernelPools { frames, vaddr })
        })
        .expect("memory already initialized");

    USER_FRAMES
        .try_init_once(|| {
            Mutex::new(FramePool::new(
                unsafe { carve(core::ptr::addr_of_mut!(USER_FRAME_BITS)) },
                user_phys_start,
                user_pages,
            ))
        })
        .expect("memory already initialized");

    unsafe {
        heap::init_descs(&mut *core::ptr::addr_of_mut!(KERNEL_DESCS));
    }

    log::info!(
        "memory: {} MiB total, kernel pool {} pages @ {:?}, user pool {} pages @ {:?}",
        total_bytes / (1024 * 1024),
        kernel_pages,
        kernel_phys_start,
        user_pages,
        user_phys_start
    );
}

// ---------------------------------------------------------------------------
// Page-granular allocation
// ---------------------------------------------------------------------------

const MAP_FLAGS: PageFlags = PageFlags::PRESENT
    .union(PageFlags::WRITABLE)
    .union(PageFlags::USER);

/// Allocate `count` consecutive virtual pages in the kernel window, backed
/// by kernel-pool frames, zeroed.
pub fn alloc_kernel_pages(count: usize) -> Option<VirtAddr> {
    let mut pools = kernel_pools().lock();
    let va = pools.vaddr.alloc(count)?;

    for i in 0..count {
        let page = va + (i as u32) * PAGE_SIZE;
        let frame = match pools.frames.alloc_frame() {
            Some(frame) => frame,
            None => {
                // Roll back everything mapped so far.
                for j in 0..i {
                    let mapped = va + (j as u32) * PAGE_SIZE;
                    let pa = paging::virt_to_phys(mapped).expect("rollback of unmapped page");
                    paging::unmap_page(mapped);
                    pools.frames.free_frame(pa);
                }
                pools.vaddr.free(va, count);
                return None;
            }
        };
        paging::map_page(page, frame, MAP_FLAGS, || pools.frames.alloc_frame());
    }
    drop(pools);

    unsafe {
        core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, count * PAGE_SIZE as usize);
    }
    Some(va)
}

/// Allocate `count` consecutive virtual pages in the current task's user
/// window, backed by user-pool frames, zeroed.
pub fn alloc_user_pages(count: usize) -> Option<VirtAddr> {
    let va = task::with_user_vaddr_pool(|pool| pool.alloc(count))??;

    let mut frames = user_frames().lock();
    for i in 0..count {
        let page = va + (i as u32) * PAGE_SIZE;
        let frame = match frames.alloc_frame() {
            Some(frame) => frame,
            None => {
                for j in 0..i {
                    let mapped = va + (j as u32) * PAGE_SIZE;
                    let pa = paging::virt_to_phys(mapped).expect("rollback of unmapped page");
                    paging::unmap_page(mapped);
                    frames.free_frame(pa);
                }
                drop(frames);
                task::with_user_vaddr_pool(|pool| pool.free(va, count));
                return None;
            }
        };
        paging::map_page(page, frame, MAP_FLAGS, || {
            kernel_pools().lock().frames.alloc_frame()
        });
    }
    drop(frames);

    unsafe {
        core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, count * PAGE_SIZE as usize);
    }
    Some(va)
}

/// Reserve the specific page containing `va` (on-demand stack growth).
pub fn alloc_page_at(kind: PoolKind, va: VirtAddr) -> Option<VirtAddr> {
    let page = va.align_down(PAGE_SIZE);
    match kind {
        PoolKind::Kernel => {
            let mut pools = kernel_pools().lock();
            pools.vaddr.alloc_at(page)?;
            let frame = match pools.frames.alloc_frame() {
                Some(frame) => frame,
                None => {
                    pools.vaddr.free(page, 1);
                    return None;
                }
            };
            paging::map_page(page, frame, MAP_FLAGS, || pools.frames.alloc_frame());
        }
        PoolKind::User => {
            task::with_user_vaddr_pool(|pool| pool.alloc_at(page))??;
            let mut frames = user_frames().lock();
            let frame = match frames.alloc_frame() {
                Some(frame) => frame,
                None => {
                    drop(frames);
                    task::with_user_vaddr_pool(|pool| pool.free(page, 1));
                    return None;
                }
            };
            paging::map_page(page, frame, MAP_FLAGS, || {
                kernel_pools().lock().frames.alloc_frame()
            });
        }
    }
    Some(page)
}

/// Release `count` pages starting at `va`: frames back to their pool, VA
/// bits back to theirs, PTEs cleared.
pub fn free_pages(va: VirtAddr, count: usize) {
    debug_assert!(va.is_aligned(PAGE_SIZE));
    let kind = pool_kind_of(va);

    for i in 0..count {
        let page = va + (i as u32) * PAGE_SIZE;
        let pa = paging::virt_to_phys(page).expect("freeing an unmapped page");
        paging::unmap_page(page);
        match kind {
            PoolKind::Kernel => kernel_pools().lock().frames.free_frame(pa),
            PoolKind::User => user_frames().lock().free_frame(pa),
        }
    }

    match kind {
        PoolKind::Kernel => kernel_pools().lock().vaddr.free(va, count),
        PoolKind::User => {
            task::with_user_vaddr_pool(|pool| pool.free(va, count));
        }
    }
}

/// Which pool a virtual address belongs to.
fn pool_kind_of(va: VirtAddr) -> PoolKind {
    if va.as_u32() >= KERNEL_SPACE_BASE {
        PoolKind::Kernel
    } else {
        PoolKind::User
    }
}

/// Walk the active page tables.
pub fn virt_to_phys(va: VirtAddr) -> Option<PhysAddr> {
    paging::virt_to_phys(va)
}

/// Allocate one kernel-pool frame without reserving virtual space (page
/// directories for new processes grab their frame this way).
pub fn alloc_kernel_frame() -> Option<PhysAddr> {
    kernel_pools().lock().frames.alloc_frame()
}

// ---------------------------------------------------------------------------
// Small-block allocator
// ---------------------------------------------------------------------------

/// Allocate `size` bytes from the current task's arena heap: the user pool
/// for a task with its own page directory, the kernel pool otherwise.
pub fn sys_malloc(size: usize) -> Option<VirtAddr> {
    let kind = if task::current_has_page_dir() {
        PoolKind::User
    } else {
        PoolKind::Kernel
    };
    malloc_pool(kind, size)
}

/// Allocate from a specific pool's heap.
pub fn malloc_pool(kind: PoolKind, size: usize) -> Option<VirtAddr> {
    if size == 0 {
        return None;
    }

    // Large request: whole pages with a large-arena header in front.
    if size > MAX_BLOCK_SIZE {
        let pages = heap::large_page_count(size);
        let va = match kind {
            PoolKind::Kernel => alloc_kernel_pages(pages)?,
            PoolKind::User => alloc_user_pages(pages)?,
        };
        let arena = va.as_mut_ptr::<Arena>();
        unsafe {
            (*arena).desc = core::ptr::null_mut();
            (*arena).cnt = pages as u32;
            (*arena).large = true;
        }
        return Some(va + ARENA_HDR_SIZE as u32);
    }

    let heap_lock = heap_lock(kind);
    let _guard = heap_lock.lock();

    let idx = heap::desc_index(size)?;
    let desc = descs_for(kind)?;
    let desc = unsafe { &mut (*desc)[idx] };

    if desc.free_list.is_empty() {
        // Grow: one fresh arena page, all blocks onto the free list.
        let arena_va = match kind {
            PoolKind::Kernel => alloc_kernel_pages(1)?,
            PoolKind::User => alloc_user_pages(1)?,
        };
        let arena = arena_va.as_mut_ptr::<Arena>();
        unsafe {
            (*arena).desc = desc as *mut MemBlockDesc;
            (*arena).cnt = desc.blocks_per_arena as u32;
            (*arena).large = false;
            for i in 0..desc.blocks_per_arena {
                let block = heap::arena_block(arena, desc.block_size, i);
                desc.free_list.push_back(block);
            }
        }
    }

    let block = desc.free_list.pop_front().expect("arena refill left list empty");
    unsafe {
        let arena = heap::arena_of(block as usize);
        (*arena).cnt -= 1;
    }
    Some(VirtAddr::new(block as u32))
}

/// Return a block or large allocation to its arena.
pub fn sys_free(ptr: VirtAddr) {
    let arena = heap::arena_of(ptr.as_u32() as usize);
    let large = unsafe { (*arena).large };

    if large {
        let pages = unsafe { (*arena).cnt } as usize;
        free_pages(VirtAddr::new(arena as u32), pages);
        return;
    }

    let kind = pool_kind_of(ptr);
    let heap_lock = heap_lock(kind);
    let _guard = heap_lock.lock();

    unsafe {
        let desc = (*arena).desc;
        let block = ptr.as_u32() as usize as *mut crate::list::ListNode;
        (*desc).free_list.push_back(block);
        (*arena).cnt += 1;

        // A fully free arena gives its page back to the pool.
        if (*arena).cnt as usize == (*desc).blocks_per_arena {
            for i in 0..(*desc).blocks_per_arena {
                let b = heap::arena_block(arena, (*desc).block_size, i);
                List::remove(b);
            }
            drop(_guard);
            free_pages(VirtAddr::new(arena as u32), 1);
        }
    }
}

fn heap_lock(kind: PoolKind) -> &'static Mutex<()> {
    match kind {
        PoolKind::Kernel => &KERNEL_HEAP_LOCK,
        PoolKind::User => &USER_HEAP_LOCK,
    }
}

/// The descriptor table for `kind`: the kernel's static table, or the
/// current process's private one.
fn descs_for(kind: PoolKind) -> Option<*mut [MemBlockDesc; DESC_CNT]> {
    match kind {
        PoolKind::Kernel => Some(core::ptr::addr_of_mut!(KERNEL_DESCS)),
        PoolKind::User => task::current_user_descs(),
    }
}

// ---------------------------------------------------------------------------
// Global allocator
// ---------------------------------------------------------------------------

/// `alloc::` containers draw from the kernel arenas regardless of which
/// task is running: a `Vec` built inside a syscall is kernel state.
struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Blocks are 16-byte aligned (arena header size); larger alignment
        // is not needed by anything in this kernel.
        if layout.align() > ARENA_HDR_SIZE {
            return core::ptr::null_mut();
        }
        malloc_pool(PoolKind::Kernel, layout.size())
            .map(|va| va.as_mut_ptr::<u8>())
            .unwrap_or(core::ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        sys_free(VirtAddr::new(ptr as u32));
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            core::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("kernel heap exhausted allocating {:?}", layout);
}
