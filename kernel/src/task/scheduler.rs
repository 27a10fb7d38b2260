//! Round-robin scheduler.
//!
//! One ready queue and one all-tasks list, both intrusive through the PCB
//! linkage cells. Every function that touches them runs with interrupts
//! disabled — on this single-CPU kernel that *is* the lock — so the state
//! lives in a plain static reached through raw pointers.

use core::mem::offset_of;
use core::ptr;

use crate::arch::instructions::{enable_and_hlt, interrupts};
use crate::list::{container_of, List};
use crate::memory;
use crate::process;

use super::context::switch_to;
use super::thread::{current, init_pcb, prepare_thread_stack, Pcb, TaskStatus};

const IDLE_PRIORITY: u8 = 10;
const MAIN_PRIORITY: u8 = 31;

struct Scheduler {
    ready: List,
    all: List,
    idle: *mut Pcb,
}

static mut SCHED: Scheduler = Scheduler {
    ready: List::new(),
    all: List::new(),
    idle: ptr::null_mut(),
};

#[inline]
fn sched() -> *mut Scheduler {
    core::ptr::addr_of_mut!(SCHED)
}

/// Turn the boot stack's page into the `main` task and spawn the idle
/// task. Must run before interrupts are first enabled.
pub fn init() {
    unsafe {
        let s = sched();
        (*s).ready.init();
        (*s).all.init();
    }

    // The boot path becomes the `main` task: its PCB occupies the base of
    // the page the boot stack already lives on.
    unsafe {
        let pcb = current();
        init_pcb(
            crate::arch::VirtAddr::new(pcb as u32),
            "main",
            MAIN_PRIORITY,
        );
        (*pcb).status = TaskStatus::Running;
        let s = sched();
        (*s).all.push_back(ptr::addr_of_mut!((*pcb).all_tag));
    }

    let idle = thread_start("idle", IDLE_PRIORITY, idle_task, 0).expect("cannot create idle task");
    unsafe {
        (*sched()).idle = idle;
    }

    log::info!("scheduler initialized (main + idle)");
}

/// Runs when nothing else is ready: block until someone needs the queue
/// drained, then halt until the next interrupt.
fn idle_task(_arg: usize) {
    loop {
        thread_block(TaskStatus::Blocked);
        // Unblocked because the ready queue went empty; wait for work.
        enable_and_hlt();
    }
}

/// Create a kernel thread and queue it.
pub fn thread_start(name: &str, priority: u8, function: fn(usize), arg: usize) -> Option<*mut Pcb> {
    let page = memory::alloc_kernel_pages(1)?;
    let pcb = unsafe {
        let pcb = init_pcb(page, name, priority);
        prepare_thread_stack(pcb, function, arg);
        pcb
    };

    enqueue_new_task(pcb);
    log::debug!("started thread '{}' (prio {})", name, priority);
    Some(pcb)
}

/// Put a freshly built task on the ready queue and the all-tasks list.
pub fn enqueue_new_task(pcb: *mut Pcb) {
    interrupts::without_interrupts(|| unsafe {
        let s = sched();
        debug_assert!(!(*s).ready.contains(ptr::addr_of!((*pcb).general_tag)));
        (*s).ready.push_back(ptr::addr_of_mut!((*pcb).general_tag));
        (*s).all.push_back(ptr::addr_of_mut!((*pcb).all_tag));
    });
}

/// Pick the next task and switch to it. Interrupts must be disabled.
///
/// A task whose status is still `Running` was preempted and goes to the
/// back of the queue with a fresh tick budget; any other status means the
/// caller already parked it somewhere (a waiter list, `Died`) and it is
/// simply not requeued.
pub fn schedule() {
    debug_assert!(!interrupts::are_enabled(), "schedule() with interrupts on");

    let cur = current();
    unsafe {
        (*cur).check_stack_sentinel();
        let s = sched();

        if (*cur).status == TaskStatus::Running {
            debug_assert!(!(*s).ready.contains(ptr::addr_of!((*cur).general_tag)));
            (*s).ready.push_back(ptr::addr_of_mut!((*cur).general_tag));
            (*cur).ticks = (*cur).priority;
            (*cur).status = TaskStatus::Ready;
        }

        if (*s).ready.is_empty() {
            unblock_nolock((*s).idle);
        }

        let node = (*s).ready.pop_front().expect("ready queue empty after idle unblock");
        let next = container_of::<Pcb>(node, offset_of!(Pcb, general_tag));
        (*next).status = TaskStatus::Running;
        process::activate(next);

        if next != cur {
            switch_to(cur, next);
        }
    }
}

/// Block the current task with the given status and give up the CPU.
pub fn thread_block(status: TaskStatus) {
    assert!(
        matches!(
            status,
            TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
        ),
        "thread_block with non-blocking status {:?}",
        status
    );
    interrupts::without_interrupts(|| {
        unsafe {
            (*current()).status = status;
        }
        schedule();
    });
}

/// Make a blocked task runnable again, at the *front* of the ready queue
/// so wakeups run promptly.
pub fn thread_unblock(pcb: *mut Pcb) {
    interrupts::without_interrupts(|| unsafe {
        unblock_nolock(pcb);
    });
}

unsafe fn unblock_nolock(pcb: *mut Pcb) {
    let status = (*pcb).status;
    assert!(
        matches!(
            status,
            TaskStatus::Blocked | TaskStatus::Waiting | TaskStatus::Hanging
        ),
        "thread_unblock on task '{}' with status {:?}",
        (*pcb).name(),
        status
    );

    let s = sched();
    assert!(
        !(*s).ready.contains(ptr::addr_of!((*pcb).general_tag)),
        "blocked task '{}' already on ready queue",
        (*pcb).name()
    );
    (*s).ready.push_front(ptr::addr_of_mut!((*pcb).general_tag));
    (*pcb).status = TaskStatus::Ready;
}

/// Voluntarily move to the back of the ready queue without spending the
/// remaining tick budget.
pub fn thread_yield() {
    interrupts::without_interrupts(|| unsafe {
        let cur = current();
        let s = sched();
        debug_assert!(!(*s).ready.contains(ptr::addr_of!((*cur).general_tag)));
        (*s).ready.push_back(ptr::addr_of_mut!((*cur).general_tag));
        (*cur).status = TaskStatus::Ready;
        schedule();
    });
}

/// Terminate the current task. Teardown stops at `Died`: the PCB page and
/// any process resources are not reclaimed.
pub fn thread_exit() -> ! {
    interrupts::disable();
    unsafe {
        let cur = current();
        (*cur).status = TaskStatus::Died;
        crate::list::List::remove(ptr::addr_of_mut!((*cur).all_tag));
    }
    schedule();
    unreachable!("dead task rescheduled");
}
