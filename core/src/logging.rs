//! # Kernel Logger
//!
//! `log` backend writing to the HAL console. Records are prefixed with the
//! level and the emitting CPU. Output is serialized by a lock taken inside
//! a critical section, so an interrupt handler that logs cannot deadlock
//! against the code it interrupted.

use crate::{critical, percpu};
use core::fmt::{self, Write};
use kestrel_hal::Console;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Logger over the kernel console
#[derive(Debug)]
pub struct KernelLogger {
    output: spin::Mutex<()>,
}

static LOGGER: KernelLogger = KernelLogger {
    output: spin::Mutex::new(()),
};

struct ConsoleWriter<'a>(&'a dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let Some(hal) = kestrel_hal::try_hal() else {
            return;
        };
        let token = percpu::current().map(|_| critical::enter());
        {
            let _output = self.output.lock();
            let mut writer = ConsoleWriter(hal.console());
            let _ = match hal.cpu().current_cpu_id() {
                Some(cpu) => writeln!(
                    writer,
                    "[{:>5}][{}] {}: {}",
                    record.level(),
                    cpu,
                    record.target(),
                    record.args()
                ),
                None => writeln!(
                    writer,
                    "[{:>5}][----] {}: {}",
                    record.level(),
                    record.target(),
                    record.args()
                ),
            };
        }
        if let Some(token) = token {
            critical::exit(token);
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger with the given maximum level
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
