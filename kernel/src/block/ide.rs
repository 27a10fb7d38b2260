//! PIO-mode IDE channel driver.
//!
//! Two fixed channels (primary 0x1F0/IRQ 14, secondary 0x170/IRQ 15), up
//! to two drives each. A channel's mutex is held for an entire request,
//! interrupt wait included, so there is at most one in-flight command per
//! channel and the ISR's semaphore post pairs with exactly one waiter.

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::string::String;
use bitflags::bitflags;

use crate::arch::port::{insw, outsw, Port};
use crate::interrupts::{self, InterruptFrame, IDE_PRIMARY_VECTOR, IDE_SECONDARY_VECTOR};
use crate::sync::{Lock, Semaphore};
use crate::time;

pub const SECTOR_SIZE: usize = 512;
const WORDS_PER_SECTOR: usize = SECTOR_SIZE / 2;

/// The sector-count register is 8 bits; cap chunks below the 0 == 256
/// encoding.
const MAX_SECTORS_PER_CMD: u32 = 255;

/// Bound on the pre-write `!BSY && DRQ` poll: 30 s in 10 ms steps.
const BUSY_WAIT_STEPS: u32 = 3000;
const BUSY_WAIT_STEP_MS: u32 = 10;

const CMD_READ: u8 = 0x20;
const CMD_WRITE: u8 = 0x30;
const CMD_IDENTIFY: u8 = 0xEC;

/// Device-register bits: the two always-set MBS bits plus LBA mode.
const DEV_MBS: u8 = 0xA0;
const DEV_LBA: u8 = 0x40;
const DEV_SLAVE: u8 = 0x10;

bitflags! {
    #[derive(Debug, Clone, Copy)]
    struct Status: u8 {
        const ERR = 1 << 0;
        const DRQ = 1 << 3;
        const DF = 1 << 5;
        const DRDY = 1 << 6;
        const BSY = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveSelect {
    Master,
    Slave,
}

/// One IDE bus.
pub struct IdeChannel {
    port_base: u16,
    irq: u8,
    /// Serializes requests; held across the interrupt wait.
    lock: Lock,
    /// Posted exactly once per commanded transfer by the channel ISR.
    disk_done: Semaphore,
    /// Set while a command is outstanding so stray IRQs are not counted.
    expecting_intr: AtomicBool,
}

pub static CHANNELS: [IdeChannel; 2] = [
    IdeChannel::new(0x1F0, IDE_PRIMARY_VECTOR),
    IdeChannel::new(0x170, IDE_SECONDARY_VECTOR),
];

impl IdeChannel {
    const fn new(port_base: u16, irq: u8) -> Self {
        Self {
            port_base,
            irq,
            lock: Lock::new(),
            disk_done: Semaphore::new(0),
            expecting_intr: AtomicBool::new(false),
        }
    }

    fn data_port(&self) -> u16 {
        self.port_base
    }

    fn status_port(&self) -> Port<u8> {
        Port::new(self.port_base + 7)
    }

    /// Program sector count, LBA 0..23, and the device register (LBA mode,
    /// drive bit, LBA 24..27).
    fn setup(&self, drive: DriveSelect, lba: u32, sec_cnt: u8) {
        unsafe {
            Port::<u8>::new(self.port_base + 2).write(sec_cnt);
            Port::<u8>::new(self.port_base + 3).write(lba as u8);
            Port::<u8>::new(self.port_base + 4).write((lba >> 8) as u8);
            Port::<u8>::new(self.port_base + 5).write((lba >> 16) as u8);

            let mut device = DEV_MBS | DEV_LBA | ((lba >> 24) as u8 & 0x0F);
            if drive == DriveSelect::Slave {
                device |= DEV_SLAVE;
            }
            Port::<u8>::new(self.port_base + 6).write(device);
        }
    }

    fn command(&self, cmd: u8) {
        self.expecting_intr.store(true, Ordering::SeqCst);
        unsafe {
            let mut port = self.status_port();
            port.write(cmd);
        }
    }

    /// Sleep until the channel ISR reports command completion.
    fn wait_irq(&self) {
        self.disk_done.wait();
    }

    /// Poll for `!BSY && DRQ` before shoving write data at the device; it
    /// raises no IRQ until it can accept the first sector. A drive that
    /// stays busy past 30 s is a hardware stall and fatal.
    fn poll_data_request(&self) {
        for _ in 0..BUSY_WAIT_STEPS {
            let status = unsafe { Status::from_bits_retain(self.status_port().read()) };
            if status.contains(Status::ERR) || status.contains(Status::DF) {
                panic!("ide channel {:#x}: drive error, status {:?}", self.port_base, status);
            }
            if !status.contains(Status::BSY) && status.contains(Status::DRQ) {
                return;
            }
            time::sys_milisleep(BUSY_WAIT_STEP_MS);
        }
        panic!("ide channel {:#x}: not ready within 30 s", self.port_base);
    }

    /// Read `sec_cnt` sectors at `lba` into `buf`.
    pub fn read(&self, drive: DriveSelect, lba: u32, sec_cnt: u32, buf: &mut [u8]) {
        assert!(sec_cnt > 0 && buf.len() >= sec_cnt as usize * SECTOR_SIZE);

        self.lock.acquire();
        let mut lba = lba;
        let mut remaining = sec_cnt;
        let mut offset = 0usize;

        while remaining > 0 {
            let chunk = remaining.min(MAX_SECTORS_PER_CMD);
            self.setup(drive, lba, chunk as u8);
            self.command(CMD_READ);
            self.wait_irq();

            let words = chunk as usize * WORDS_PER_SECTOR;
            // SAFETY: the buffer bound was checked above; u8 -> u16 view is
            // alignment-free via the raw pointer.
            unsafe {
                let dst = core::slice::from_raw_parts_mut(
                    buf.as_mut_ptr().add(offset) as *mut u16,
                    words,
                );
                insw(self.data_port(), dst);
            }

            lba += chunk;
            offset += chunk as usize * SECTOR_SIZE;
            remaining -= chunk;
        }
        self.lock.release();
    }

    /// Write `sec_cnt` sectors from `buf` at `lba`.
    pub fn write(&self, drive: DriveSelect, lba: u32, sec_cnt: u32, buf: &[u8]) {
        assert!(sec_cnt > 0 && buf.len() >= sec_cnt as usize * SECTOR_SIZE);

        self.lock.acquire();
        let mut lba = lba;
        let mut remaining = sec_cnt;
        let mut offset = 0usize;

        while remaining > 0 {
            let chunk = remaining.min(MAX_SECTORS_PER_CMD);
            self.setup(drive, lba, chunk as u8);
            self.command(CMD_WRITE);
            self.poll_data_request();

            let words = chunk as usize * WORDS_PER_SECTOR;
            unsafe {
                let src =
                    core::slice::from_raw_parts(buf.as_ptr().add(offset) as *const u16, words);
                outsw(self.data_port(), src);
            }
            // Completion IRQ arrives after the device drained the data.
            self.wait_irq();

            lba += chunk;
            offset += chunk as usize * SECTOR_SIZE;
            remaining -= chunk;
        }
        self.lock.release();
    }

    /// Issue IDENTIFY and return the 256-word parameter block, or `None`
    /// if no drive answers.
    pub fn identify(&self, drive: DriveSelect) -> Option<[u16; 256]> {
        self.lock.acquire();
        self.setup(drive, 0, 0);
        // A channel with no drive attached floats the bus.
        let present = unsafe { self.status_port().read() } != 0;
        if !present {
            self.expecting_intr.store(false, Ordering::SeqCst);
            self.lock.release();
            return None;
        }

        self.command(CMD_IDENTIFY);
        self.wait_irq();

        let mut words = [0u16; 256];
        unsafe {
            insw(self.data_port(), &mut words);
        }
        self.lock.release();
        Some(words)
    }

    fn handle_irq(&self) {
        if self.expecting_intr.swap(false, Ordering::SeqCst) {
            self.disk_done.post();
            // Reading the status register acknowledges the drive.
            unsafe {
                let _ = self.status_port().read();
            }
        }
    }
}

fn ide_irq_handler(frame: &mut InterruptFrame) {
    let channel = (frame.vec_no as u8 - IDE_PRIMARY_VECTOR) as usize;
    CHANNELS[channel].handle_irq();
}

pub fn init() {
    interrupts::register_handler(IDE_PRIMARY_VECTOR, ide_irq_handler);
    interrupts::register_handler(IDE_SECONDARY_VECTOR, ide_irq_handler);
    log::info!(
        "IDE channels at {:#x}/irq {} and {:#x}/irq {}",
        CHANNELS[0].port_base,
        CHANNELS[0].irq,
        CHANNELS[1].port_base,
        CHANNELS[1].irq
    );
}

/// Swap the byte pairs of an IDENTIFY string field into readable order.
pub fn identify_string(words: &[u16], range: core::ops::Range<usize>) -> String {
    let mut out = String::new();
    for &word in &words[range] {
        let hi = (word >> 8) as u8;
        let lo = (word & 0xFF) as u8;
        for byte in [hi, lo] {
            if (0x20..0x7F).contains(&byte) {
                out.push(byte as char);
            }
        }
    }
    String::from(out.trim_end())
}

/// Total addressable sectors from IDENTIFY words 60..61.
pub fn identify_sectors(words: &[u16]) -> u32 {
    (words[60] as u32) | ((words[61] as u32) << 16)
}
