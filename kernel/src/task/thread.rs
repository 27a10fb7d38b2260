//! Task control blocks.
//!
//! Every task owns exactly one 4 KiB kernel page: the [`Pcb`] sits at the
//! page base and the task's kernel stack grows down from the page top
//! toward it. The `stack_magic` sentinel is the last PCB field, directly
//! under the deepest the stack may legally reach; the timer handler checks
//! it on every tick.

use core::mem::size_of;

use crate::arch::addr::{VirtAddr, PAGE_SIZE};
use crate::arch::instructions::read_esp;
use crate::interrupts::InterruptFrame;
use crate::list::ListNode;
use crate::memory::heap::{MemBlockDesc, DESC_CNT};
use crate::memory::pool::VirtPool;
use crate::sync::Mutex;

use super::context::{kernel_thread_entry, ThreadStack};

pub const STACK_MAGIC: u32 = 0x19870916;

pub const TASK_NAME_LEN: usize = 16;

pub type Pid = u32;

static NEXT_PID: Mutex<Pid> = Mutex::new(1);

/// PIDs are monotonic and never reused.
pub fn alloc_pid() -> Pid {
    let mut next = NEXT_PID.lock();
    let pid = *next;
    *next += 1;
    pid
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Ready,
    Blocked,
    Waiting,
    Hanging,
    Died,
}

/// Process/thread control block. `self_kstack` must stay the first field:
/// the context-switch assembly stores the stack pointer through the PCB
/// pointer directly.
#[repr(C)]
pub struct Pcb {
    pub self_kstack: u32,
    pub status: TaskStatus,
    pub priority: u8,
    /// Remaining tick budget in this round.
    pub ticks: u8,
    pub elapsed_ticks: u32,
    pub pid: Pid,
    pub name: [u8; TASK_NAME_LEN],
    /// Ready-queue / waiter-list linkage.
    pub general_tag: ListNode,
    /// All-tasks list linkage.
    pub all_tag: ListNode,
    /// Kernel virtual address of this task's page directory; `None` means
    /// a kernel thread sharing the master directory.
    pub page_dir: Option<VirtAddr>,
    /// Per-process user VA pool (processes only).
    pub user_vaddr: Option<VirtPool>,
    /// Per-process small-block descriptors (processes only).
    pub user_descs: [MemBlockDesc; DESC_CNT],
    /// Task-local fd table: values index the global file table, -1 = free.
    pub fd_table: [i32; 32],
    /// Overflow sentinel; sits at the highest PCB offset, right below the
    /// lowest legal stack address.
    pub stack_magic: u32,
}

impl Pcb {
    /// The PCB owning the page `esp` lives on.
    #[inline]
    pub fn from_stack(esp: VirtAddr) -> *mut Pcb {
        esp.align_down(PAGE_SIZE).as_mut_ptr::<Pcb>()
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }

    /// Top of this task's kernel stack (page end).
    pub fn kernel_stack_top(&self) -> VirtAddr {
        VirtAddr::new(self as *const Pcb as u32 + PAGE_SIZE)
    }

    pub fn check_stack_sentinel(&self) {
        assert_eq!(
            self.stack_magic,
            STACK_MAGIC,
            "kernel stack overflow in task '{}' (pid {})",
            self.name(),
            self.pid
        );
    }
}

/// The currently running task, recovered from the stack pointer: the
/// kernel stack always lives in the PCB page.
#[inline]
pub fn current() -> *mut Pcb {
    Pcb::from_stack(read_esp())
}

/// Initialize the PCB fields at the base of `page`.
///
/// # Safety
/// `page` must be a page-aligned kernel page owned by the caller; the
/// struct region is wiped first (the boot path hands in the live boot
/// stack's page, which is full of stale data).
pub unsafe fn init_pcb(page: VirtAddr, name: &str, priority: u8) -> *mut Pcb {
    debug_assert!(page.is_aligned(PAGE_SIZE));
    let pcb = page.as_mut_ptr::<Pcb>();
    core::ptr::write_bytes(pcb as *mut u8, 0, size_of::<Pcb>());

    (*pcb).self_kstack = (page + PAGE_SIZE).as_u32();
    (*pcb).status = TaskStatus::Ready;
    (*pcb).priority = priority;
    (*pcb).ticks = priority;
    (*pcb).pid = alloc_pid();

    let bytes = name.as_bytes();
    let len = bytes.len().min(TASK_NAME_LEN - 1);
    (*pcb).name[..len].copy_from_slice(&bytes[..len]);

    (*pcb).general_tag = ListNode::new();
    (*pcb).all_tag = ListNode::new();
    (*pcb).page_dir = None;
    (*pcb).user_vaddr = None;
    // user_descs stay zeroed; process creation re-initializes them.

    (*pcb).fd_table = [-1; 32];
    (*pcb).fd_table[0] = 0;
    (*pcb).fd_table[1] = 1;
    (*pcb).fd_table[2] = 2;

    (*pcb).stack_magic = STACK_MAGIC;
    pcb
}

/// Carve the first-run frames out of a fresh task's kernel stack: room for
/// an interrupt frame (used if the task later enters ring 3), then the
/// switch frame that makes `switch_to` "return" into the bootstrap entry.
///
/// # Safety
/// `pcb` must be freshly initialized and not yet runnable.
pub unsafe fn prepare_thread_stack(pcb: *mut Pcb, function: fn(usize), arg: usize) {
    (*pcb).self_kstack -= size_of::<InterruptFrame>() as u32;
    (*pcb).self_kstack -= size_of::<ThreadStack>() as u32;

    let frame = (*pcb).self_kstack as *mut ThreadStack;
    (*frame).ebp = 0;
    (*frame).ebx = 0;
    (*frame).edi = 0;
    (*frame).esi = 0;
    (*frame).eip = kernel_thread_entry as usize as u32;
    (*frame).ret_addr = 0;
    (*frame).function = function as usize as u32;
    (*frame).arg = arg as u32;
}
