//! Kernel logging facility
//!
//! Routes the `log` facade to COM1. Log levels are configured based on build
//! configuration (debug/release).

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;
use x86_64::instructions::interrupts::without_interrupts;

/// Global logger instance available throughout the kernel
pub static LOGGER: Logger = Logger::new();

/// Serializing logger; one record is written at a time.
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message"
    ///
    /// Traps log too, so the lock is only ever held with interrupts off.
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            without_interrupts(|| {
                let _guard = self.inner.lock();
                crate::serial_println!("[{}] {}", record.level(), record.args());
            });
        }
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`] as the `log` backend.
///
/// Debug builds log at `Debug`, release builds at `Info`. Calling this twice
/// leaves the first installation in place.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(
            #[cfg(debug_assertions)]
            LevelFilter::Debug,
            #[cfg(not(debug_assertions))]
            LevelFilter::Info,
        );
    }
}
