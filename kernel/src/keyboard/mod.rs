//! PS/2 keyboard: interrupt handler feeding the input ring buffer.

pub mod scancodes;

#[cfg(target_arch = "x86")]
mod driver {
    use spin::Mutex;

    use crate::arch::port::Port;
    use crate::interrupts::{self, InterruptFrame, KEYBOARD_VECTOR};
    use crate::sync::ioqueue::IoQueue;

    use super::scancodes::Decoder;

    const KBD_DATA_PORT: u16 = 0x60;

    /// Decoded input consumed by `sys_read(fd 0)`.
    pub static KEYBOARD_QUEUE: IoQueue = IoQueue::new();

    /// Only the interrupt handler touches the decoder; the spin mutex is
    /// for Rust's benefit, never contended on a single CPU.
    static DECODER: Mutex<Decoder> = Mutex::new(Decoder::new());

    pub fn init() {
        interrupts::register_handler(KEYBOARD_VECTOR, keyboard_handler);
        log::info!("keyboard initialized");
    }

    fn keyboard_handler(_frame: &mut InterruptFrame) {
        // The controller expects the byte to be consumed on every IRQ.
        let scancode = unsafe { Port::<u8>::new(KBD_DATA_PORT).read() };

        if let Some(ch) = DECODER.lock().decode(scancode) {
            if !KEYBOARD_QUEUE.try_put(ch) {
                log::warn!("keyboard queue full; dropping input");
            }
        }
    }
}

#[cfg(target_arch = "x86")]
pub use driver::{init, KEYBOARD_QUEUE};
