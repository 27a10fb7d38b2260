//! Physical frame pools and virtual-address pools.
//!
//! RAM above the loader's footprint is split into two disjoint frame pools,
//! one for the kernel and one for user space; each pool tracks ownership
//! with a bitmap where `bit set == frame owned by a live mapping`. Virtual
//! pools do the same over page numbers of an address window: the shared
//! kernel window starting at `0xC0100000`, and one private user window per
//! process (`0x08048000..0xC0000000`).

use crate::arch::addr::{PhysAddr, VirtAddr, PAGE_SIZE};

use super::bitmap::Bitmap;

/// A pool of physical 4 KiB frames.
pub struct FramePool {
    bitmap: Bitmap<&'static mut [u8]>,
    phys_start: PhysAddr,
    frame_count: usize,
}

impl FramePool {
    pub fn new(storage: &'static mut [u8], phys_start: PhysAddr, frame_count: usize) -> Self {
        let mut bitmap = Bitmap::new(storage, frame_count);
        bitmap.reset();
        Self {
            bitmap,
            phys_start,
            frame_count,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn size_bytes(&self) -> usize {
        self.frame_count * PAGE_SIZE as usize
    }

    /// Claim one free frame.
    pub fn alloc_frame(&mut self) -> Option<PhysAddr> {
        let idx = self.bitmap.alloc(1)?;
        Some(self.phys_start + (idx as u32) * PAGE_SIZE)
    }

    /// Release a frame. Panics if the frame is not owned by this pool or
    /// was already free.
    pub fn free_frame(&mut self, frame: PhysAddr) {
        debug_assert!(frame.is_aligned(PAGE_SIZE));
        let idx = (frame.as_u32() - self.phys_start.as_u32()) / PAGE_SIZE;
        assert!(
            (idx as usize) < self.frame_count,
            "frame {:?} outside pool",
            frame
        );
        self.bitmap.free(idx as usize, 1);
    }

    /// Whether `frame` falls inside this pool's physical range.
    pub fn contains(&self, frame: PhysAddr) -> bool {
        frame >= self.phys_start
            && frame.as_u32() < self.phys_start.as_u32() + (self.frame_count as u32) * PAGE_SIZE
    }

    pub fn bitmap_snapshot(&self) -> &[u8] {
        self.bitmap.as_bytes()
    }
}

/// A pool of virtual pages over a contiguous window.
pub struct VirtPool {
    bitmap: Bitmap<&'static mut [u8]>,
    start: VirtAddr,
    page_count: usize,
}

impl VirtPool {
    pub fn new(storage: &'static mut [u8], start: VirtAddr, page_count: usize) -> Self {
        let mut bitmap = Bitmap::new(storage, page_count);
        bitmap.reset();
        Self {
            bitmap,
            start,
            page_count,
        }
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Reserve `count` consecutive pages, returning the first page's
    /// address.
    pub fn alloc(&mut self, count: usize) -> Option<VirtAddr> {
        let idx = self.bitmap.alloc(count)?;
        Some(self.start + (idx as u32) * PAGE_SIZE)
    }

    /// Reserve the specific page containing `va` (on-demand stack growth,
    /// fixed user mappings). Returns `None` if it is already reserved.
    pub fn alloc_at(&mut self, va: VirtAddr) -> Option<VirtAddr> {
        let va = va.align_down(PAGE_SIZE);
        let idx = ((va - self.start) / PAGE_SIZE) as usize;
        if idx >= self.page_count || self.bitmap.test(idx) {
            return None;
        }
        self.bitmap.set(idx);
        Some(va)
    }

    /// Release `count` pages starting at `va`.
    pub fn free(&mut self, va: VirtAddr, count: usize) {
        debug_assert!(va.is_aligned(PAGE_SIZE));
        let idx = ((va - self.start) / PAGE_SIZE) as usize;
        assert!(idx + count <= self.page_count, "{:?} outside pool", va);
        self.bitmap.free(idx, count);
    }

    pub fn bitmap_snapshot(&self) -> &[u8] {
        self.bitmap.as_bytes()
    }
}
