//! Mutex-protected VGA text console.
//!
//! The 80x25 text buffer lives at physical 0xB8000, reached through the
//! kernel's low identity window at `0xC00B8000`. A recursive blocking mutex
//! serializes whole-string writes so concurrent threads cannot interleave
//! inside one message; this is the sink behind file descriptors 1 and 2.

use core::fmt;

use conquer_once::spin::OnceCell;

use crate::arch::port::Port;
use crate::sync::Mutex;

const VGA_BUFFER: *mut u16 = 0xC00B_8000 as *mut u16;
const WIDTH: usize = 80;
const HEIGHT: usize = 25;

/// White on black.
const DEFAULT_ATTR: u16 = 0x07 << 8;

const CURSOR_CMD_PORT: u16 = 0x3D4;
const CURSOR_DATA_PORT: u16 = 0x3D5;

static CONSOLE: OnceCell<Mutex<VgaWriter>> = OnceCell::uninit();

pub struct VgaWriter {
    cursor: usize,
}

impl VgaWriter {
    fn new() -> Self {
        let mut writer = VgaWriter { cursor: 0 };
        writer.clear();
        writer
    }

    fn clear(&mut self) {
        for i in 0..WIDTH * HEIGHT {
            unsafe {
                VGA_BUFFER.add(i).write_volatile(DEFAULT_ATTR | b' ' as u16);
            }
        }
        self.cursor = 0;
        self.sync_hw_cursor();
    }

    fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' | b'\r' => {
                self.cursor = (self.cursor / WIDTH + 1) * WIDTH;
            }
            0x08 => {
                // Backspace: erase the previous cell.
                if self.cursor > 0 {
                    self.cursor -= 1;
                    unsafe {
                        VGA_BUFFER
                            .add(self.cursor)
                            .write_volatile(DEFAULT_ATTR | b' ' as u16);
                    }
                }
            }
            _ => {
                unsafe {
                    VGA_BUFFER
                        .add(self.cursor)
                        .write_volatile(DEFAULT_ATTR | byte as u16);
                }
                self.cursor += 1;
            }
        }
        if self.cursor >= WIDTH * HEIGHT {
            self.scroll();
        }
    }

    fn scroll(&mut self) {
        unsafe {
            // Move rows 1..25 up one line, blank the last row.
            core::ptr::copy(VGA_BUFFER.add(WIDTH), VGA_BUFFER, WIDTH * (HEIGHT - 1));
            for i in 0..WIDTH {
                VGA_BUFFER
                    .add(WIDTH * (HEIGHT - 1) + i)
                    .write_volatile(DEFAULT_ATTR | b' ' as u16);
            }
        }
        self.cursor -= WIDTH;
    }

    fn sync_hw_cursor(&mut self) {
        let pos = self.cursor as u16;
        unsafe {
            let mut cmd = Port::<u8>::new(CURSOR_CMD_PORT);
            let mut data = Port::<u8>::new(CURSOR_DATA_PORT);
            cmd.write(0x0E);
            data.write((pos >> 8) as u8);
            cmd.write(0x0F);
            data.write(pos as u8);
        }
    }
}

impl fmt::Write for VgaWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
        self.sync_hw_cursor();
        Ok(())
    }
}

pub fn init() {
    CONSOLE
        .try_init_once(|| Mutex::new(VgaWriter::new()))
        .expect("console already initialized");
    log::info!("VGA console initialized");
}

/// Write a string to the console under the console mutex.
pub fn console_print(s: &str) {
    use core::fmt::Write;
    if let Ok(console) = CONSOLE.try_get() {
        let mut writer = console.lock();
        let _ = writer.write_str(s);
    }
}

/// Write raw bytes to the console (lossy for non-UTF-8 input).
pub fn console_write_bytes(bytes: &[u8]) {
    if let Ok(console) = CONSOLE.try_get() {
        let mut writer = console.lock();
        for &b in bytes {
            writer.put_byte(b);
        }
        writer.sync_hw_cursor();
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;
    if let Ok(console) = CONSOLE.try_get() {
        let _ = console.lock().write_fmt(args);
    }
}

#[macro_export]
macro_rules! console_print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! console_println {
    () => ($crate::console_print!("\n"));
    ($($arg:tt)*) => ($crate::console_print!("{}\n", format_args!($($arg)*)));
}
