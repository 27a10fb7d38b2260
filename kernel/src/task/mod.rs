//! Thread and process model: PCBs, the context switch, and the round-robin
//! scheduler.

mod context;
mod scheduler;
pub mod thread;

pub use scheduler::{
    enqueue_new_task, init, schedule, thread_block, thread_exit, thread_start, thread_unblock,
    thread_yield,
};
pub use thread::{current, Pcb, Pid, TaskStatus};

use crate::memory::heap::{MemBlockDesc, DESC_CNT};
use crate::memory::pool::VirtPool;

/// Whether the running task owns a private page directory (user process).
pub fn current_has_page_dir() -> bool {
    unsafe { (*current()).page_dir.is_some() }
}

pub fn current_pid() -> Pid {
    unsafe { (*current()).pid }
}

/// Run `f` against the current task's user VA pool, if it has one.
pub fn with_user_vaddr_pool<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut VirtPool) -> R,
{
    unsafe { (*current()).user_vaddr.as_mut().map(f) }
}

/// The current process's private size-class descriptors, if it is a user
/// process.
pub fn current_user_descs() -> Option<*mut [MemBlockDesc; DESC_CNT]> {
    unsafe {
        let pcb = current();
        if (*pcb).page_dir.is_some() {
            Some(core::ptr::addr_of_mut!((*pcb).user_descs))
        } else {
            None
        }
    }
}

/// Run `f` against the current task's local fd table.
pub fn with_fd_table<F, R>(f: F) -> R
where
    F: FnOnce(&mut [i32; 32]) -> R,
{
    unsafe { f(&mut (*current()).fd_table) }
}
