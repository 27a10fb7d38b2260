//! Disk layer: IDE channels, the probed-disk registry, and partition
//! discovery.

pub mod partition;

#[cfg(target_arch = "x86")]
pub mod ide;

#[cfg(target_arch = "x86")]
mod registry {
    use alloc::string::String;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU32, Ordering};

    use conquer_once::spin::OnceCell;

    use crate::arch::VirtAddr;

    use super::ide::{self, DriveSelect, CHANNELS};
    use super::partition;

    /// BIOS-reported disk count, through the kernel's low identity window.
    const DISK_COUNT_ADDR: VirtAddr = VirtAddr::new(0xC000_0475);

    /// A probed drive.
    pub struct Disk {
        pub channel: usize,
        pub drive: DriveSelect,
        /// `hda`..`hdd` by probe order.
        pub name: &'static str,
        pub model: String,
        pub serial: String,
        pub sec_cnt: u32,
        /// Filled in once the partition scan finishes.
        pub part_cnt: AtomicU32,
    }

    static DISK_NAMES: [&str; 4] = ["hda", "hdb", "hdc", "hdd"];

    static DISKS: OnceCell<Vec<Disk>> = OnceCell::uninit();

    fn disks() -> &'static Vec<Disk> {
        DISKS.try_get().expect("disk layer not initialized")
    }

    pub fn disk_name(disk: usize) -> &'static str {
        disks()[disk].name
    }

    pub fn disk_sectors(disk: usize) -> u32 {
        disks()[disk].sec_cnt
    }

    /// Read `sec_cnt` sectors from absolute `lba` on `disk`.
    pub fn disk_read(disk: usize, lba: u32, sec_cnt: u32, buf: &mut [u8]) {
        let d = &disks()[disk];
        CHANNELS[d.channel].read(d.drive, lba, sec_cnt, buf);
    }

    /// Write `sec_cnt` sectors to absolute `lba` on `disk`.
    pub fn disk_write(disk: usize, lba: u32, sec_cnt: u32, buf: &[u8]) {
        let d = &disks()[disk];
        CHANNELS[d.channel].write(d.drive, lba, sec_cnt, buf);
    }

    /// Probe up to four drives, then scan each one's partition table.
    pub fn init() {
        ide::init();

        let disk_cnt = unsafe { *DISK_COUNT_ADDR.as_ptr::<u8>() } as usize;
        assert!(disk_cnt > 0 && disk_cnt <= 4, "BIOS reports {} disks", disk_cnt);
        log::info!("BIOS reports {} disk(s)", disk_cnt);

        let mut found = Vec::new();
        for idx in 0..disk_cnt {
            let channel = idx / 2;
            let drive = if idx % 2 == 0 {
                DriveSelect::Master
            } else {
                DriveSelect::Slave
            };

            let words = match CHANNELS[channel].identify(drive) {
                Some(words) => words,
                None => continue,
            };

            let disk = Disk {
                channel,
                drive,
                name: DISK_NAMES[idx],
                model: ide::identify_string(&words, 27..47),
                serial: ide::identify_string(&words, 10..20),
                sec_cnt: ide::identify_sectors(&words),
                part_cnt: AtomicU32::new(0),
            };
            log::info!(
                "{}: {} ({} sectors, serial {})",
                disk.name,
                disk.model,
                disk.sec_cnt,
                disk.serial
            );
            found.push(disk);
        }

        DISKS
            .try_init_once(|| found)
            .expect("disk layer already initialized");

        for idx in 0..disks().len() {
            partition::scan_disk(idx);
            let count =
                partition::with_partitions(|parts| parts.iter().filter(|p| p.disk == idx).count());
            disks()[idx].part_cnt.store(count as u32, Ordering::Relaxed);
        }
    }
}

#[cfg(target_arch = "x86")]
pub use registry::{disk_name, disk_read, disk_sectors, disk_write, init, Disk};
