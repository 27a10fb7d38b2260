//! PIT tick source, global tick counter, and yield-shaped sleeps.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::port::Port;
use crate::interrupts::{self, InterruptFrame, TIMER_VECTOR};
use crate::task;

/// Timer interrupts per second.
pub const TICK_HZ: u32 = 100;

const PIT_INPUT_HZ: u32 = 1_193_180;
const PIT_CONTROL_PORT: u16 = 0x43;
const PIT_COUNTER0_PORT: u16 = 0x40;

/// Ticks since boot.
static TICKS: AtomicU32 = AtomicU32::new(0);

pub fn ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}

/// Program PIT counter 0 for rate generation at [`TICK_HZ`] and hook the
/// timer vector.
pub fn init() {
    let divisor = (PIT_INPUT_HZ / TICK_HZ) as u16;
    unsafe {
        // Counter 0, lobyte/hibyte access, mode 2 (rate generator).
        Port::<u8>::new(PIT_CONTROL_PORT).write(0b0011_0100);
        let mut counter = Port::<u8>::new(PIT_COUNTER0_PORT);
        counter.write(divisor as u8);
        counter.write((divisor >> 8) as u8);
    }
    interrupts::register_handler(TIMER_VECTOR, timer_handler);
    log::info!("timer at {} Hz", TICK_HZ);
}

/// Per-tick bookkeeping: detect stack overflow, account the running task's
/// budget, and preempt when it runs out.
fn timer_handler(_frame: &mut InterruptFrame) {
    let cur = task::current();
    unsafe {
        (*cur).check_stack_sentinel();
        (*cur).elapsed_ticks += 1;
        TICKS.fetch_add(1, Ordering::Relaxed);

        if (*cur).ticks == 0 {
            task::schedule();
        } else {
            (*cur).ticks -= 1;
        }
    }
}

/// Yield until `sleep_ticks` ticks have elapsed. Sleeps are timeout-shaped
/// yields: the task stays runnable and simply re-checks the clock each
/// time it is scheduled.
pub fn ticksleep(sleep_ticks: u32) {
    let start = ticks();
    while ticks().wrapping_sub(start) < sleep_ticks {
        task::thread_yield();
    }
}

/// Sleep at millisecond granularity, rounding up to whole ticks.
pub fn sys_milisleep(milliseconds: u32) {
    let ms_per_tick = 1000 / TICK_HZ;
    let sleep_ticks = (milliseconds + ms_per_tick - 1) / ms_per_tick;
    assert!(sleep_ticks > 0);
    ticksleep(sleep_ticks);
}

pub fn sys_sleep(seconds: u32) {
    let sleep_ticks = seconds * TICK_HZ;
    assert!(sleep_ticks > 0);
    ticksleep(sleep_ticks);
}
