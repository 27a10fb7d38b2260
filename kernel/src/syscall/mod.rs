//! `int 0x80` system-call gate and dispatch.
//!
//! ABI: number in `eax`, up to three arguments in `ebx`/`ecx`/`edx`,
//! return value back in `eax`. Failures return -1; the kernel logs a
//! diagnostic. Pointer arguments are trusted ring-3 addresses — there is
//! no user-copy layer in this kernel.

use crate::arch::VirtAddr;
use crate::fs;
use crate::interrupts::{self, InterruptFrame, SYSCALL_VECTOR};
use crate::memory;
use crate::task;

/// Recognized system-call numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SyscallNumber {
    GetPid = 0,
    Malloc = 1,
    Free = 2,
    Open = 3,
    Close = 4,
    Write = 5,
    Read = 6,
    Lseek = 7,
    Unlink = 8,
    Mkdir = 9,
    Opendir = 10,
    Closedir = 11,
    Readdir = 12,
}

impl SyscallNumber {
    fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::GetPid,
            1 => Self::Malloc,
            2 => Self::Free,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Write,
            6 => Self::Read,
            7 => Self::Lseek,
            8 => Self::Unlink,
            9 => Self::Mkdir,
            10 => Self::Opendir,
            11 => Self::Closedir,
            12 => Self::Readdir,
            _ => return None,
        })
    }
}

pub fn init() {
    interrupts::register_handler(SYSCALL_VECTOR, syscall_handler);
    log::info!("syscall gate at int {:#x}", SYSCALL_VECTOR);
}

fn syscall_handler(frame: &mut InterruptFrame) {
    let ret = dispatch(frame.eax, frame.ebx, frame.ecx, frame.edx);
    frame.eax = ret as u32;
}

fn dispatch(nr: u32, arg1: u32, arg2: u32, arg3: u32) -> i32 {
    let nr = match SyscallNumber::from_u32(nr) {
        Some(nr) => nr,
        None => {
            log::warn!("unknown syscall {}", nr);
            return -1;
        }
    };

    match nr {
        SyscallNumber::GetPid => task::current_pid() as i32,

        SyscallNumber::Malloc => memory::sys_malloc(arg1 as usize)
            .map(|va| va.as_u32() as i32)
            .unwrap_or(0),

        SyscallNumber::Free => {
            if arg1 != 0 {
                memory::sys_free(VirtAddr::new(arg1));
            }
            0
        }

        SyscallNumber::Open => match user_str(arg1) {
            Some(pathname) => fs::sys_open(pathname, arg2),
            None => -1,
        },

        SyscallNumber::Close => fs::sys_close(arg1 as usize),

        SyscallNumber::Write => {
            // SAFETY: trusted user pointer per the ABI contract above.
            let buf = unsafe { core::slice::from_raw_parts(arg2 as *const u8, arg3 as usize) };
            fs::sys_write(arg1 as usize, buf)
        }

        SyscallNumber::Read => {
            let buf = unsafe { core::slice::from_raw_parts_mut(arg2 as *mut u8, arg3 as usize) };
            fs::sys_read(arg1 as usize, buf)
        }

        SyscallNumber::Lseek => fs::sys_lseek(arg1 as usize, arg2 as i32, arg3),

        SyscallNumber::Unlink => match user_str(arg1) {
            Some(pathname) => fs::sys_unlink(pathname),
            None => -1,
        },

        SyscallNumber::Mkdir => match user_str(arg1) {
            Some(pathname) => fs::sys_mkdir(pathname),
            None => -1,
        },

        SyscallNumber::Opendir => match user_str(arg1) {
            Some(pathname) => fs::sys_opendir(pathname)
                .map(|dir| dir as i32)
                .unwrap_or(0),
            None => 0,
        },

        SyscallNumber::Closedir => fs::sys_closedir(arg1 as *mut fs::dir::Dir),

        SyscallNumber::Readdir => fs::sys_readdir(arg1 as *mut fs::dir::Dir) as i32,
    }
}

/// Borrow a NUL-terminated user string (bounded, UTF-8 checked).
fn user_str(ptr: u32) -> Option<&'static str> {
    const MAX_PATH: usize = 256;
    if ptr == 0 {
        return None;
    }
    let base = ptr as *const u8;
    let mut len = 0;
    unsafe {
        while len < MAX_PATH && *base.add(len) != 0 {
            len += 1;
        }
        core::str::from_utf8(core::slice::from_raw_parts(base, len)).ok()
    }
}
