//! Two-level page-table management through the recursive self-map.
//!
//! The last slot of every page directory points back at the directory
//! itself, so for the *active* address space the directory is always
//! visible at `0xFFFFF000` and any page table at `0xFFC00000 + (pde << 12)`.
//! All PTE edits go through that fixed window, which makes them independent
//! of where the page tables physically live.

use bitflags::bitflags;

use crate::arch::addr::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::arch::instructions::{cr3, flush_tlb_page};

/// Virtual address of the master kernel page directory.
pub const KERNEL_PAGE_DIR: VirtAddr = VirtAddr::new(0xC010_0000);
/// Physical address of the master kernel page directory (set up by the
/// loader at the 1 MiB mark).
pub const KERNEL_PAGE_DIR_PHYS: PhysAddr = PhysAddr::new(0x0010_0000);

/// Window exposing the active page directory through its self-map entry.
const PD_WINDOW: u32 = 0xFFFF_F000;
/// Window exposing every page table of the active address space.
const PT_WINDOW: u32 = 0xFFC0_0000;

/// Index of the self-map slot (the last PDE).
pub const SELF_MAP_INDEX: usize = 1023;
/// First PDE of the kernel half (`0xC0000000` and up).
pub const KERNEL_PDE_START: usize = 768;

bitflags! {
    /// PDE/PTE flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

const ENTRY_ADDR_MASK: u32 = !0xFFF;

/// Pointer to the PDE covering `va`, through the self-map.
fn pde_ptr(va: VirtAddr) -> *mut u32 {
    (PD_WINDOW + (va.pde_index() as u32) * 4) as *mut u32
}

/// Pointer to the PTE covering `va`, through the self-map.
fn pte_ptr(va: VirtAddr) -> *mut u32 {
    (PT_WINDOW + ((va.pde_index() as u32) << 12) + (va.pte_index() as u32) * 4) as *mut u32
}

/// Map `va -> pa` in the active address space.
///
/// If the covering page table is absent, a frame for it is taken from the
/// kernel pool via `alloc_pt_frame`. A present PTE is an invariant
/// violation and panics: nothing in this kernel ever remaps a live page.
pub fn map_page<F>(va: VirtAddr, pa: PhysAddr, flags: PageFlags, mut alloc_pt_frame: F)
where
    F: FnMut() -> Option<PhysAddr>,
{
    debug_assert!(va.is_aligned(PAGE_SIZE) && pa.is_aligned(PAGE_SIZE));

    let pde = pde_ptr(va);
    unsafe {
        if *pde & PageFlags::PRESENT.bits() == 0 {
            let pt_frame = alloc_pt_frame().expect("out of kernel frames for page table");
            *pde = pt_frame.as_u32()
                | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits();
            // The brand-new table is now visible through the PT window;
            // clear it before any PTE in it is trusted.
            let pt_base = (pte_ptr(va) as u32 & !0xFFF) as *mut u8;
            core::ptr::write_bytes(pt_base, 0, PAGE_SIZE as usize);
        }

        let pte = pte_ptr(va);
        assert!(
            *pte & PageFlags::PRESENT.bits() == 0,
            "PTE for {:?} already present ({:#x})",
            va,
            *pte
        );
        *pte = pa.as_u32() | flags.bits();
    }
}

/// Remove the mapping for `va` (clears the present bit, leaves the page
/// table in place) and flush its TLB entry.
pub fn unmap_page(va: VirtAddr) {
    unsafe {
        let pte = pte_ptr(va);
        debug_assert!(*pte & PageFlags::PRESENT.bits() != 0);
        *pte &= !PageFlags::PRESENT.bits();
    }
    flush_tlb_page(va);
}

/// Walk the self-mapped tables: virtual to physical, or `None` if either
/// level is absent.
pub fn virt_to_phys(va: VirtAddr) -> Option<PhysAddr> {
    unsafe {
        let pde = *pde_ptr(va);
        if pde & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        let pte = *pte_ptr(va);
        if pte & PageFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(PhysAddr::new((pte & ENTRY_ADDR_MASK) + va.page_offset()))
    }
}

/// Copy the kernel half of the active page directory into a freshly
/// allocated directory page and point its self-map slot at itself.
///
/// Every address space shares the same kernel-half PDEs, so copying from
/// the active directory is equivalent to copying from the master.
///
/// `pd_va` is where the new directory page is mapped in kernel space and
/// `pd_pa` is its frame.
pub fn init_user_page_dir(pd_va: VirtAddr, pd_pa: PhysAddr) {
    let dst = pd_va.as_mut_ptr::<u32>();
    unsafe {
        // User half starts empty.
        core::ptr::write_bytes(dst, 0, KERNEL_PDE_START);
        // Kernel half is shared: PDEs 768..1023 point at the same page
        // tables in every address space.
        let src = (PD_WINDOW as *const u32).add(KERNEL_PDE_START);
        core::ptr::copy_nonoverlapping(src, dst.add(KERNEL_PDE_START), 1024 - KERNEL_PDE_START);
        // Self-map: the last slot points at this directory.
        *dst.add(SELF_MAP_INDEX) =
            pd_pa.as_u32() | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();
    }
}

/// Switch the active address space.
///
/// # Safety
/// `pd` must be a valid page directory with the shared kernel half intact.
pub unsafe fn activate(pd: PhysAddr) {
    if cr3::read() != pd {
        cr3::write(pd);
    }
}
