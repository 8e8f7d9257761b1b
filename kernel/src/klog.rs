//! `log` facade wired to the kernel console.
//!
//! Subsystems log through `log::info!` and friends; everything lands on the
//! same UART sink as `println!`, prefixed with the level and target.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info || cfg!(feature = "verbose-fault-log")
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::println!(
                "[{:>5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Called once, early in boot.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if cfg!(feature = "verbose-fault-log") {
            LevelFilter::Trace
        } else {
            LevelFilter::Info
        });
    }
}
