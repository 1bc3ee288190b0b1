//! `log` backend writing to the console.

use irq_spin::Interrupts as _;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::{interrupts::RiscvInterrupts, println};

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // the id is only meaningful with interrupts masked
        let cpu = irq_spin::with_disabled::<RiscvInterrupts, _, _>(RiscvInterrupts::cpu_id);
        println!(
            "[{:5} hart{cpu}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Routes `log` records at `level` and above to the console.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
