//! Context switch and the first-run stack frames.
//!
//! `switch_to` saves the callee-saved registers on the outgoing task's
//! kernel stack, parks the resulting stack pointer in its PCB (whose first
//! field is `self_kstack` — the asm below depends on that), then unwinds
//! the incoming task's stack the same way. A brand-new task's stack is
//! pre-seeded with a [`ThreadStack`] whose saved `eip` points at
//! [`kernel_thread_entry`], so the first "return" lands there.

use core::arch::global_asm;

use crate::arch::instructions::interrupts;

use super::thread::Pcb;

/// Frame consumed by `switch_to` when a task runs for the first time.
///
/// Layout matches the pop order of the switch epilogue: `ebp`, `ebx`,
/// `edi`, `esi`, then `ret` into `eip`. For the bootstrap entry the two
/// slots after `eip` are read as cdecl arguments (`ret_addr` is the fake
/// return address the entry function never uses).
#[repr(C)]
pub struct ThreadStack {
    pub ebp: u32,
    pub ebx: u32,
    pub edi: u32,
    pub esi: u32,
    pub eip: u32,
    pub ret_addr: u32,
    pub function: u32,
    pub arg: u32,
}

global_asm!(
    ".global switch_to",
    "switch_to:",
    "push esi",
    "push edi",
    "push ebx",
    "push ebp",
    // [esp+20] = outgoing PCB; its first field is self_kstack.
    "mov eax, [esp + 20]",
    "mov [eax], esp",
    // [esp+24] = incoming PCB.
    "mov eax, [esp + 24]",
    "mov esp, [eax]",
    "pop ebp",
    "pop ebx",
    "pop edi",
    "pop esi",
    "ret",
);

extern "C" {
    /// Switch kernel stacks from `cur` to `next`.
    pub fn switch_to(cur: *mut Pcb, next: *mut Pcb);
}

/// First instruction every kernel thread executes.
///
/// `schedule()` runs with interrupts disabled, so a task entered through
/// the switch path (rather than `intr_exit`) must re-enable them itself
/// before running the thread body.
pub extern "C" fn kernel_thread_entry(function: fn(usize), arg: usize) -> ! {
    interrupts::enable();
    function(arg);
    super::thread_exit();
}
