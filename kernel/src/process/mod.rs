//! User processes: per-process address space and the ring-0 to ring-3
//! bootstrap.
//!
//! There is no `exec`: a "user program" is a kernel function that gets its
//! own page directory, VA pool, and heap descriptors, and is entered
//! through a hand-built interrupt frame so the `iretd` in `intr_exit`
//! drops it into ring 3 on its own user stack.

use core::arch::asm;
use core::mem::size_of;

use crate::arch::addr::{VirtAddr, PAGE_SIZE};
use crate::gdt;
use crate::interrupts::{intr_exit_addr, InterruptFrame};
use crate::memory::{self, paging, PoolKind};
use crate::task::{self, thread, Pcb};

/// Default scheduling priority for new processes.
pub const DEFAULT_PRIORITY: u8 = 31;

const USER_VADDR_START: VirtAddr = memory::USER_VADDR_START;
const USER_STACK_TOP: VirtAddr = memory::USER_STACK_TOP;

/// EFLAGS image for ring 3: IF plus the always-set bit 1; IOPL 0.
const USER_EFLAGS: u32 = 0x202;

/// How far below the stack top on-demand growth is honored.
const USER_STACK_LIMIT_PAGES: u32 = 32;

/// Hook the page-fault vector: a fault within the user stack window grows
/// the stack by the touched page; anything else is fatal.
pub fn init() {
    crate::interrupts::register_handler(0x0E, page_fault_handler);
}

fn page_fault_handler(frame: &mut crate::interrupts::InterruptFrame) {
    let fault = crate::arch::instructions::read_cr2();
    let stack_floor = USER_STACK_TOP.as_u32() - USER_STACK_LIMIT_PAGES * PAGE_SIZE;

    if task::current_has_page_dir()
        && fault.as_u32() >= stack_floor
        && fault.as_u32() < USER_STACK_TOP.as_u32()
    {
        if memory::alloc_page_at(PoolKind::User, fault).is_some() {
            return;
        }
    }

    panic!(
        "page fault at {:?} (err={:#x}, eip={:#x}, task '{}')",
        fault,
        frame.err_code,
        frame.eip,
        unsafe { (*task::current()).name() }
    );
}

/// Make `pcb`'s address space current and, for user tasks, point the TSS
/// at its kernel stack. Called from `schedule()` with interrupts off.
pub fn activate(pcb: *mut Pcb) {
    unsafe {
        let pd = match (*pcb).page_dir {
            Some(pd_va) => memory::virt_to_phys(pd_va).expect("page directory unmapped"),
            None => paging::KERNEL_PAGE_DIR_PHYS,
        };
        paging::activate(pd);

        if (*pcb).page_dir.is_some() {
            gdt::set_kernel_stack((*pcb).kernel_stack_top());
        }
    }
}

/// Create a process that will run `entry` in ring 3.
pub fn process_execute(entry: fn(), name: &str) -> Option<*mut Pcb> {
    let page = memory::alloc_kernel_pages(1)?;
    let pcb = unsafe { thread::init_pcb(page, name, DEFAULT_PRIORITY) };

    unsafe {
        (*pcb).page_dir = Some(create_page_dir()?);
        (*pcb).user_vaddr = Some(create_user_vaddr_pool()?);
        crate::memory::heap::init_descs(&mut (*pcb).user_descs);
        thread::prepare_thread_stack(pcb, start_process, entry as usize);
    }

    task::enqueue_new_task(pcb);
    log::info!("process '{}' created (pid {})", name, unsafe { (*pcb).pid });
    Some(pcb)
}

/// Fresh page directory: empty user half, shared kernel half, self-map.
fn create_page_dir() -> Option<VirtAddr> {
    let pd_va = memory::alloc_kernel_pages(1)?;
    let pd_pa = memory::virt_to_phys(pd_va).expect("fresh page unmapped");
    paging::init_user_page_dir(pd_va, pd_pa);
    Some(pd_va)
}

/// Per-process user VA pool; its bitmap lives on kernel pages so the
/// kernel can consult it from any address space.
fn create_user_vaddr_pool() -> Option<crate::memory::pool::VirtPool> {
    let page_count = ((USER_STACK_TOP - USER_VADDR_START) / PAGE_SIZE) as usize;
    let bitmap_bytes = (page_count + 7) / 8;
    let bitmap_pages = (bitmap_bytes + PAGE_SIZE as usize - 1) / PAGE_SIZE as usize;

    let storage_va = memory::alloc_kernel_pages(bitmap_pages)?;
    let storage =
        unsafe { core::slice::from_raw_parts_mut(storage_va.as_mut_ptr::<u8>(), bitmap_bytes) };
    Some(crate::memory::pool::VirtPool::new(
        storage,
        USER_VADDR_START,
        page_count,
    ))
}

/// First code of every process, still in ring 0 on the process's own
/// kernel stack and address space. Builds the fake interrupt frame at the
/// top of the PCB page and falls through `intr_exit` into ring 3.
fn start_process(entry_raw: usize) {
    let pcb = task::current();
    let frame = unsafe {
        let top = (*pcb).kernel_stack_top();
        let frame = (top.as_u32() - size_of::<InterruptFrame>() as u32) as *mut InterruptFrame;
        (*pcb).self_kstack = frame as u32;
        frame
    };

    // One page of user stack, mapped just under the stack top; further
    // growth is the page-fault handler's on-demand `alloc_page_at`.
    let stack_page = VirtAddr::new(USER_STACK_TOP.as_u32() - PAGE_SIZE);
    memory::alloc_page_at(PoolKind::User, stack_page).expect("cannot map initial user stack");

    unsafe {
        (*frame).edi = 0;
        (*frame).esi = 0;
        (*frame).ebp = 0;
        (*frame).esp_dummy = 0;
        (*frame).ebx = 0;
        (*frame).edx = 0;
        (*frame).ecx = 0;
        (*frame).eax = 0;
        (*frame).gs = 0;
        (*frame).fs = gdt::USER_DATA_SELECTOR as u32;
        (*frame).es = gdt::USER_DATA_SELECTOR as u32;
        (*frame).ds = gdt::USER_DATA_SELECTOR as u32;
        (*frame).vec_no = 0;
        (*frame).err_code = 0;
        (*frame).eip = entry_raw as u32;
        (*frame).cs = gdt::USER_CODE_SELECTOR as u32;
        (*frame).eflags = USER_EFLAGS;
        (*frame).user_esp = USER_STACK_TOP.as_u32();
        (*frame).user_ss = gdt::USER_DATA_SELECTOR as u32;

        asm!(
            "mov esp, {frame}",
            "jmp {exit}",
            frame = in(reg) frame,
            exit = in(reg) intr_exit_addr().as_u32(),
            options(noreturn)
        );
    }
}
