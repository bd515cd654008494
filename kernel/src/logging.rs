//! Installs the `log` facade on top of the serial port.
//!
//! Before this is installed, early boot code uses `serial_println!`
//! directly; the panic handler always uses `serial_println!` rather than
//! `log`, since a panic can occur before (or because) logger
//! installation itself failed.

use log::{LevelFilter, Metadata, Record};

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::serial_println!("[{:<5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

#[cfg(debug_assertions)]
fn max_level() -> LevelFilter {
    LevelFilter::Trace
}

#[cfg(not(debug_assertions))]
fn max_level() -> LevelFilter {
    LevelFilter::Info
}

static LOGGER: SerialLogger = SerialLogger;

/// Installs the global logger. Must be called exactly once, before any
/// other subsystem logs.
pub fn init() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(max_level()))
        .expect("logger already installed");
}
