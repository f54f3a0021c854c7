/*
 * Test Suite for the Myrtos Kernel
 *
 * In-kernel tests, driven by the init process. Each suite exercises one
 * subsystem through the same call surface user tasks would use and returns
 * its pass/fail tally; `comprehensive::run_all` chains them and prints the
 * summary.
 *
 * Suites:
 * - `sched_tests`   - spawn/wakeup, timed sleep, priority feedback, boost
 * - `process_tests` - exec/exit/wait, reparenting, procinfo stream
 * - `pipe_tests`    - transfers, EOF, broken pipe, capacity, fid limits
 * - `socket_tests`  - listen/connect/accept, shutdown, timeouts
 *
 * Cross-process coordination inside tests goes through static atomics;
 * processes under test get their inputs through exec argument buffers.
 */

pub mod comprehensive;
pub mod pipe_tests;
pub mod process_tests;
pub mod socket_tests;

/// Pass/fail bookkeeping for one suite.
pub struct Tally {
    pub passed: usize,
    pub failed: usize,
}

impl Tally {
    pub fn new() -> Self {
        Tally { passed: 0, failed: 0 }
    }

    /// Record one check, logging its outcome.
    pub fn check(&mut self, name: &str, ok: bool) {
        if ok {
            log::info!("  ok: {}", name);
            self.passed += 1;
        } else {
            log::error!("  FAILED: {}", name);
            self.failed += 1;
        }
    }

    pub fn absorb(&mut self, (passed, failed): (usize, usize)) {
        self.passed += passed;
        self.failed += failed;
    }
}

impl Default for Tally {
    fn default() -> Self {
        Self::new()
    }
}
