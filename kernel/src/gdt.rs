//! GDT and TSS setup.
//!
//! Flat 4 GiB segments for ring 0 and ring 3 plus a single TSS. The TSS is
//! only used for its `ss0:esp0` pair: when a ring-3 task traps, the CPU
//! switches to the kernel stack recorded there, so the scheduler must point
//! `esp0` at the top of the incoming task's PCB page before every switch
//! into a user task.

use core::arch::asm;
use core::mem::size_of;

use crate::arch::VirtAddr;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

/// 32-bit task-state segment. Only `ss0`/`esp0` are ever read by hardware
/// in this kernel; everything else stays zero.
#[repr(C, packed)]
struct TaskStateSegment {
    prev_task_link: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt_selector: u32,
    trap: u16,
    iomap_base: u16,
}

static mut TSS: TaskStateSegment = TaskStateSegment {
    prev_task_link: 0,
    esp0: 0,
    ss0: KERNEL_DATA_SELECTOR as u32,
    esp1: 0,
    ss1: 0,
    esp2: 0,
    ss2: 0,
    cr3: 0,
    eip: 0,
    eflags: 0,
    eax: 0,
    ecx: 0,
    edx: 0,
    ebx: 0,
    esp: 0,
    ebp: 0,
    esi: 0,
    edi: 0,
    es: 0,
    cs: 0,
    ss: 0,
    ds: 0,
    fs: 0,
    gs: 0,
    ldt_selector: 0,
    trap: 0,
    iomap_base: size_of::<TaskStateSegment>() as u16,
};

const GDT_ENTRIES: usize = 6;

static mut GDT: [u64; GDT_ENTRIES] = [0; GDT_ENTRIES];

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

/// Build a flat segment descriptor: 4 GiB limit, page granularity.
///
/// `access` carries the P/DPL/S/type bits (e.g. 0x9A = present ring-0 code).
const fn flat_descriptor(access: u8) -> u64 {
    let limit_low = 0xFFFFu64;
    let limit_high = 0xFu64;
    let flags = 0xCu64; // G=1 (4 KiB granularity), D=1 (32-bit)
    limit_low | (limit_high << 48) | ((access as u64) << 40) | (flags << 52)
}

/// Build the TSS descriptor (system segment, byte granularity).
fn tss_descriptor(base: u32, limit: u32) -> u64 {
    let base = base as u64;
    let limit = limit as u64;
    (limit & 0xFFFF)
        | ((base & 0xFFFFFF) << 16)
        | (0x89u64 << 40) // present, 32-bit available TSS
        | (((limit >> 16) & 0xF) << 48)
        | (((base >> 24) & 0xFF) << 56)
}

/// Install the kernel GDT, reload segment registers, and load the TSS.
pub fn init() {
    unsafe {
        let tss_base = core::ptr::addr_of!(TSS) as u32;
        let tss_limit = size_of::<TaskStateSegment>() as u32 - 1;

        GDT[0] = 0;
        GDT[1] = flat_descriptor(0x9A); // ring-0 code
        GDT[2] = flat_descriptor(0x92); // ring-0 data
        GDT[3] = flat_descriptor(0xFA); // ring-3 code
        GDT[4] = flat_descriptor(0xF2); // ring-3 data
        GDT[5] = tss_descriptor(tss_base, tss_limit);

        let pointer = DescriptorTablePointer {
            limit: (GDT_ENTRIES * size_of::<u64>() - 1) as u16,
            base: core::ptr::addr_of!(GDT) as u32,
        };

        asm!(
            "lgdt [{ptr}]",
            // Reload CS with a far jump through the new descriptor.
            "push {kcode}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "mov ds, {kdata:x}",
            "mov es, {kdata:x}",
            "mov fs, {kdata:x}",
            "mov gs, {kdata:x}",
            "mov ss, {kdata:x}",
            "ltr {tss:x}",
            ptr = in(reg) &pointer,
            kcode = const KERNEL_CODE_SELECTOR as u32,
            kdata = in(reg) KERNEL_DATA_SELECTOR as u32,
            tss = in(reg) TSS_SELECTOR as u32,
            tmp = out(reg) _,
        );
    }
    log::info!("GDT and TSS loaded");
}

/// Record the ring-0 stack used on traps out of ring 3.
pub fn set_kernel_stack(esp0: VirtAddr) {
    unsafe {
        let tss = core::ptr::addr_of_mut!(TSS);
        (*tss).esp0 = esp0.as_u32();
    }
}
