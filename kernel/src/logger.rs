//! `log` facade wired to the serial port.

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::serial_println;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        serial_println!("[{}] {} - {}", tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

fn max_level() -> Level {
    if cfg!(feature = "verbose") {
        Level::Debug
    } else {
        Level::Info
    }
}

pub fn init() {
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(if cfg!(feature = "verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    log::info!("Serial logger initialized");
}
