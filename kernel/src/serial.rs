//! 16550A serial output on COM1.
//!
//! Used as the sink for the `log` facade and the raw `serial_print!` macros.
//! Output masks interrupts around the port lock so a log record emitted from
//! an interrupt handler cannot deadlock against a half-written line.

use core::fmt;
use spin::Mutex;

use crate::arch::instructions::interrupts;
use crate::arch::port::Port;

const COM1_PORT: u16 = 0x3F8;

pub static SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1_PORT));

/// Minimal 16550A driver: polled transmit only.
pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    pub const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Program 115200 8N1 with FIFOs enabled.
    pub fn init(&mut self) {
        unsafe {
            Port::<u8>::new(self.base + 1).write(0x00); // disable interrupts
            Port::<u8>::new(self.base + 3).write(0x80); // DLAB on
            Port::<u8>::new(self.base).write(0x01); // divisor low: 115200 baud
            Port::<u8>::new(self.base + 1).write(0x00); // divisor high
            Port::<u8>::new(self.base + 3).write(0x03); // 8N1, DLAB off
            Port::<u8>::new(self.base + 2).write(0xC7); // FIFO on, clear, 14-byte threshold
            Port::<u8>::new(self.base + 4).write(0x0B); // DTR | RTS | OUT2
        }
    }

    fn transmit_empty(&self) -> bool {
        unsafe { Port::<u8>::new(self.base + 5).read() & 0x20 != 0 }
    }

    pub fn send(&mut self, byte: u8) {
        while !self.transmit_empty() {
            core::hint::spin_loop();
        }
        unsafe {
            Port::<u8>::new(self.base).write(byte);
        }
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.send(b'\r');
            }
            self.send(byte);
        }
        Ok(())
    }
}

pub fn init() {
    SERIAL1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    interrupts::without_interrupts(|| {
        SERIAL1
            .lock()
            .write_fmt(args)
            .expect("Printing to serial failed");
    });
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
