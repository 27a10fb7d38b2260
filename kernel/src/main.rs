//! Kernel binary: boot entry, init order, and the panic handler.

#![cfg_attr(target_arch = "x86", no_std)]
#![cfg_attr(target_arch = "x86", no_main)]

#[cfg(target_arch = "x86")]
mod kernel_bin {
    use core::arch::global_asm;

    use kernel::arch::instructions::{hlt, interrupts};
    use kernel::task::TaskStatus;
    use kernel::{
        block, console, fs, gdt, interrupts as idt, keyboard, logger, memory, process, serial,
        serial_println, syscall, task, time, usys,
    };

    // The loader leaves us in 32-bit protected mode with paging on and the
    // kernel mapped high; all it owes us beyond that is the RAM size at
    // 0xA00 and the BIOS disk count at 0x475. Pick up a known-good stack
    // whose page doubles as the main task's PCB.
    global_asm!(
        ".section .text._start",
        ".global _start",
        "_start:",
        "mov esp, 0xC009F000",
        "call kernel_main",
        "2:",
        "hlt",
        "jmp 2b",
    );

    /// Bring every subsystem up in dependency order. Interrupts go live
    /// in the middle: the IDE probe and the filesystem mount sleep on
    /// the disk IRQ.
    fn init_all() {
        gdt::init();
        idt::init();
        memory::init();
        task::init();
        time::init();
        console::init();
        keyboard::init();
        syscall::init();
        process::init();

        interrupts::enable();

        block::init();
        fs::init();
    }

    #[no_mangle]
    extern "C" fn kernel_main() -> ! {
        serial::init();
        logger::init();
        serial_println!();
        serial_println!("Welcome to Ferrox ..");

        init_all();
        log::info!("init complete");

        #[cfg(feature = "testing")]
        kernel::tests::run_all();

        process::process_execute(user_prog, "init").expect("cannot create init process");

        // The boot path's job is done; park forever.
        task::thread_block(TaskStatus::Blocked);
        unreachable!("main task unblocked");
    }

    /// First ring-3 program: exercises the syscall gate end to end.
    fn user_prog() {
        let pid = usys::getpid();

        let buf = usys::malloc(64);
        if !buf.is_null() {
            usys::free(buf);
        }

        let mut banner = [0u8; 64];
        let text = b"hello from ring 3, pid ";
        banner[..text.len()].copy_from_slice(text);
        let mut len = text.len();
        len += format_u32(pid, &mut banner[len..]);
        banner[len] = b'\n';
        usys::write(1, &banner[..len + 1]);

        loop {
            // No exit syscall; spin at the bottom of ring 3.
            core::hint::spin_loop();
        }
    }

    /// Format a decimal number without allocating (no std in ring 3).
    fn format_u32(mut value: u32, out: &mut [u8]) -> usize {
        let mut digits = [0u8; 10];
        let mut count = 0;
        loop {
            digits[count] = b'0' + (value % 10) as u8;
            value /= 10;
            count += 1;
            if value == 0 {
                break;
            }
        }
        for i in 0..count {
            out[i] = digits[count - 1 - i];
        }
        count
    }

    // Serial only: the console uses a blocking mutex, and a panicking task
    // must never sleep.
    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        interrupts::disable();
        log::error!("KERNEL PANIC: {}", info);
        loop {
            hlt();
        }
    }
}

#[cfg(not(target_arch = "x86"))]
fn main() {}
