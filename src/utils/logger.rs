/*
 * Kernel Log Sink
 *
 * Backs the `log` facade with the serial port. Every line is stamped with
 * the uptime and the emitting core, so traces from preempting threads can
 * be told apart when they interleave:
 *
 *   [   12.042] cpu0 INFO  Scheduler running on core 0
 *
 * The stamp reads only lock-free machine state (the atomic clock and the
 * APIC id), so logging is safe from any context that may hold kernel locks.
 */

use log::{LevelFilter, Metadata, Record};

use crate::machine;

struct KernelLog;

static LOGGER: KernelLog = KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ms = machine::timer::clock_ms();
        serial_println!(
            "[{:5}.{:03}] cpu{} {:5} {}",
            ms / 1000,
            ms % 1000,
            machine::core_id(),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the kernel logger at Info level. The serial port must already
/// be usable; a second installation is a boot-sequence bug.
pub fn init() {
    log::set_logger(&LOGGER).expect("logger installed twice");
    log::set_max_level(LevelFilter::Info);
    log::info!("Kernel log online");
}
