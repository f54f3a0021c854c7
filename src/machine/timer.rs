/*
 * Clock and Alarm
 *
 * The PIT runs in rate-generator mode at 1 kHz, giving the kernel a
 * millisecond-resolution monotonic clock. On top of the periodic tick sits a
 * per-core one-shot alarm: the scheduler arms it with the remaining
 * timeslice, and when the deadline passes the tick handler reports it so the
 * interrupt path can preempt the running thread.
 *
 * `cancel_alarm` returns the unexpired remainder, which the scheduler stores
 * back into the outgoing thread's remaining timeslice.
 */

use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::instructions::port::Port;

use super::MAX_CORES;

/// PIT input clock (Hz) and the divisor for a 1 kHz tick.
const PIT_FREQUENCY: u64 = 1_193_182;
const PIT_HZ: u64 = 1000;
const PIT_DIVISOR: u16 = (PIT_FREQUENCY / PIT_HZ) as u16;

/// Milliseconds since boot.
static UPTIME_MS: AtomicU64 = AtomicU64::new(0);

/// Per-core alarm deadlines in absolute milliseconds. u64::MAX = unarmed.
const UNARMED: u64 = u64::MAX;
static ALARMS: [AtomicU64; MAX_CORES] = [const { AtomicU64::new(UNARMED) }; MAX_CORES];

/// Program PIT channel 0 for a periodic 1 kHz tick.
pub fn init() {
    let mut cmd: Port<u8> = Port::new(0x43);
    let mut ch0: Port<u8> = Port::new(0x40);
    unsafe {
        cmd.write(0x34); // channel 0, lobyte/hibyte, rate generator
        ch0.write((PIT_DIVISOR & 0xFF) as u8);
        ch0.write((PIT_DIVISOR >> 8) as u8);
    }
    log::info!("Timer initialized (PIT @ {} Hz)", PIT_HZ);
}

/// Monotonic milliseconds since boot.
pub fn clock_ms() -> u64 {
    UPTIME_MS.load(Ordering::Relaxed)
}

/// Arm this core's one-shot alarm to fire in `ms` milliseconds (minimum 1).
pub fn set_alarm(ms: u64) {
    let deadline = clock_ms() + ms.max(1);
    ALARMS[super::core_id()].store(deadline, Ordering::Relaxed);
}

/// Disarm this core's alarm and return the unexpired remainder in ms.
pub fn cancel_alarm() -> u64 {
    let deadline = ALARMS[super::core_id()].swap(UNARMED, Ordering::Relaxed);
    if deadline == UNARMED {
        return 0;
    }
    deadline.saturating_sub(clock_ms())
}

/// Advance the clock by one tick and check this core's alarm.
///
/// Called from the timer interrupt handler with interrupts disabled.
/// Returns true when the alarm deadline has passed; the caller then routes
/// control into the scheduler after acknowledging the interrupt.
pub fn on_tick() -> bool {
    let now = UPTIME_MS.fetch_add(1, Ordering::Relaxed) + 1;
    let alarm = &ALARMS[super::core_id()];
    let deadline = alarm.load(Ordering::Relaxed);
    if deadline != UNARMED && now >= deadline {
        alarm.store(UNARMED, Ordering::Relaxed);
        return true;
    }
    false
}
