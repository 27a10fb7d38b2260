//! Blocking synchronization primitives: counting semaphore, recursive
//! mutex, condition variable.
//!
//! All three share one discipline: the waiter list is a FIFO of PCBs,
//! manipulated only with interrupts disabled, and a waiter that entered
//! the list first is woken first. The semaphore is the base; the mutex is
//! a binary semaphore plus holder tracking; the condvar parks waiters
//! while the associated mutex is released.

pub mod ioqueue;

use core::cell::UnsafeCell;
use core::mem::offset_of;
use core::ops::{Deref, DerefMut};
use core::ptr;

use crate::arch::instructions::interrupts;
use crate::list::{container_of, List};
use crate::task::{self, Pcb, TaskStatus};

// ---------------------------------------------------------------------------
// Semaphore
// ---------------------------------------------------------------------------

struct SemInner {
    value: u32,
    waiters: List,
}

/// Counting semaphore with strict-FIFO wakeup.
pub struct Semaphore {
    inner: UnsafeCell<SemInner>,
}

// SAFETY: the inner state is only touched with interrupts disabled on a
// single CPU.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Self {
            inner: UnsafeCell::new(SemInner {
                value,
                waiters: List::new(),
            }),
        }
    }

    /// P operation: block (FIFO) while the count is zero, then take one.
    pub fn wait(&self) {
        interrupts::without_interrupts(|| unsafe {
            let inner = self.inner.get();
            (*inner).waiters.ensure_init();

            while (*inner).value == 0 {
                let cur = task::current();
                assert!(
                    !(*inner).waiters.contains(ptr::addr_of!((*cur).general_tag)),
                    "task '{}' waiting on a semaphore it already waits on",
                    (*cur).name()
                );
                (*inner).waiters.push_back(ptr::addr_of_mut!((*cur).general_tag));
                task::thread_block(TaskStatus::Blocked);
            }

            (*inner).value -= 1;
        });
    }

    /// Non-blocking P: take a count if one is available.
    pub fn try_wait(&self) -> bool {
        interrupts::without_interrupts(|| unsafe {
            let inner = self.inner.get();
            if (*inner).value > 0 {
                (*inner).value -= 1;
                true
            } else {
                false
            }
        })
    }

    /// V operation: wake the oldest waiter, if any, and return one count.
    pub fn post(&self) {
        interrupts::without_interrupts(|| unsafe {
            let inner = self.inner.get();
            (*inner).waiters.ensure_init();

            if let Some(node) = (*inner).waiters.pop_front() {
                let waiter = container_of::<Pcb>(node, offset_of!(Pcb, general_tag));
                task::thread_unblock(waiter);
            }
            (*inner).value += 1;
        });
    }
}

// ---------------------------------------------------------------------------
// Recursive lock
// ---------------------------------------------------------------------------

struct LockInner {
    holder: *mut Pcb,
    repeat: u32,
}

/// Recursive mutex: re-acquisition by the holder only bumps a counter;
/// release by anyone else is an invariant violation and panics.
pub struct Lock {
    sem: Semaphore,
    inner: UnsafeCell<LockInner>,
}

unsafe impl Send for Lock {}
unsafe impl Sync for Lock {}

impl Lock {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
            inner: UnsafeCell::new(LockInner {
                holder: ptr::null_mut(),
                repeat: 0,
            }),
        }
    }

    pub fn acquire(&self) {
        let cur = task::current();
        let inner = self.inner.get();
        unsafe {
            if (*inner).holder == cur {
                (*inner).repeat += 1;
                return;
            }
            self.sem.wait();
            debug_assert_eq!((*inner).repeat, 0);
            (*inner).holder = cur;
            (*inner).repeat = 1;
        }
    }

    /// Non-blocking acquire for interrupt context. Refuses recursion (an
    /// ISR must not re-enter a lock held by the task it interrupted) and
    /// refuses to wait.
    pub fn try_acquire(&self) -> bool {
        let cur = task::current();
        let inner = self.inner.get();
        unsafe {
            if (*inner).holder == cur {
                return false;
            }
            if !self.sem.try_wait() {
                return false;
            }
            (*inner).holder = cur;
            (*inner).repeat = 1;
            true
        }
    }

    pub fn release(&self) {
        let cur = task::current();
        let inner = self.inner.get();
        unsafe {
            assert_eq!(
                (*inner).holder,
                cur,
                "lock released by a task that does not hold it"
            );
            if (*inner).repeat > 1 {
                (*inner).repeat -= 1;
                return;
            }
            (*inner).holder = ptr::null_mut();
            (*inner).repeat = 0;
            self.sem.post();
        }
    }

    /// Whether the current task holds this lock.
    pub fn held_by_current(&self) -> bool {
        unsafe { (*self.inner.get()).holder == task::current() }
    }
}

// ---------------------------------------------------------------------------
// Mutex<T>: RAII data wrapper over Lock
// ---------------------------------------------------------------------------

/// A [`Lock`] guarding a value, handed out through an RAII guard.
pub struct Mutex<T> {
    lock: Lock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: Lock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.acquire();
        MutexGuard { mutex: self }
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}

// ---------------------------------------------------------------------------
// Condition variable
// ---------------------------------------------------------------------------

/// Condition variable tied to a [`Mutex`] at the call sites.
pub struct Condvar {
    waiters: UnsafeCell<List>,
}

unsafe impl Send for Condvar {}
unsafe impl Sync for Condvar {}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: UnsafeCell::new(List::new()),
        }
    }

    /// Atomically release the guard's mutex and sleep; reacquire on wake.
    ///
    /// Joining the waiter list and releasing the mutex happen under one
    /// interrupt-disable window, so a signal between them cannot be lost.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex;
        interrupts::without_interrupts(|| unsafe {
            let waiters = self.waiters.get();
            (*waiters).ensure_init();
            let cur = task::current();
            (*waiters).push_back(ptr::addr_of_mut!((*cur).general_tag));
            drop(guard);
            task::thread_block(TaskStatus::Blocked);
        });
        mutex.lock()
    }

    /// Wake the oldest waiter, if any. The caller must hold the associated
    /// mutex; the woken task re-contends for it.
    pub fn signal(&self) {
        interrupts::without_interrupts(|| unsafe {
            let waiters = self.waiters.get();
            (*waiters).ensure_init();
            if let Some(node) = (*waiters).pop_front() {
                let waiter = container_of::<Pcb>(node, offset_of!(Pcb, general_tag));
                task::thread_unblock(waiter);
            }
        });
    }
}
