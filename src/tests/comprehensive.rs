/*
 * Comprehensive Test Runner
 *
 * Executes every suite in sequence from the init process and prints a
 * summary. The return value becomes init's exit status: zero when every
 * check passed.
 */

use super::{Tally, pipe_tests, process_tests, sched_tests, socket_tests};

fn banner(title: &str) {
    serial_println!();
    serial_println!("=== {} ===", title);
}

/// Run all suites. Returns the number of failed checks.
pub fn run_all() -> i32 {
    let mut total = Tally::new();

    serial_println!();
    serial_println!("========================================");
    serial_println!(" MYRTOS KERNEL TEST SUITE");
    serial_println!("========================================");

    banner("Phase 1: Scheduler");
    total.absorb(sched_tests::run());

    banner("Phase 2: Processes");
    total.absorb(process_tests::run());

    banner("Phase 3: Pipes");
    total.absorb(pipe_tests::run());

    banner("Phase 4: Sockets");
    total.absorb(socket_tests::run());

    serial_println!();
    serial_println!("========================================");
    serial_println!(
        " RESULT: {} passed, {} failed",
        total.passed,
        total.failed
    );
    serial_println!("========================================");

    total.failed as i32
}
