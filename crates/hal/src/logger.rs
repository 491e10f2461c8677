//! Logger implementation for the pager.
//!
//! Implements the `log::Log` trait. Kernels route records to their console
//! with [`set_output`]; host builds fall back to stderr.

use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

use log::{LevelFilter, Metadata, Record};

/// Console sink for formatted records.
pub type OutputFn = fn(fmt::Arguments<'_>);

static OUTPUT: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Global logger instance
static LOGGER: SimpleLogger = SimpleLogger;

/// Simple Logger implementation
struct SimpleLogger;

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ptr = OUTPUT.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: only set_output stores into OUTPUT, always from an OutputFn
            let output: OutputFn = unsafe { core::mem::transmute::<*mut (), OutputFn>(ptr) };
            output(format_args!("{:<5} {}", record.level(), record.args()));
            return;
        }
        #[cfg(any(test, feature = "std"))]
        {
            extern crate std;
            std::eprintln!("{:<5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Route log output to a console callback.
pub fn set_output(output: OutputFn) {
    OUTPUT.store(output as *mut (), Ordering::Release);
}

/// Initialize the logger.
///
/// Safe to call more than once: later calls only adjust the level, so every
/// test can initialise logging without coordinating.
pub fn init(max_level: LevelFilter) {
    // Err only means a logger is already installed
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(max_level);
}
