//! System tick tracking.
//!
//! The timer interrupt advances a global tick counter; everything that needs
//! a clock (scheduler sleep deadlines, HID poll intervals, key repeat) reads
//! it through [`ticks`]. The PIT itself is programmed once at boot.

use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::instructions::port::Port;

/// Timer interrupt frequency in Hz. One tick is one millisecond.
pub const TIMER_HZ: u64 = 1000;

/// PIT input clock.
const PIT_FREQUENCY: u64 = 1_193_182;

/// Ticks since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Program PIT channel 0 for periodic interrupts at [`TIMER_HZ`].
pub fn init() {
    let divisor = (PIT_FREQUENCY / TIMER_HZ) as u16;
    unsafe {
        // Channel 0, lobyte/hibyte access, rate generator.
        Port::<u8>::new(0x43).write(0x36);
        let mut data = Port::<u8>::new(0x40);
        data.write((divisor & 0xff) as u8);
        data.write((divisor >> 8) as u8);
    }
    log::debug!("PIT programmed for {} Hz (divisor {})", TIMER_HZ, divisor);
}

/// Called from the timer interrupt to advance system time.
pub fn tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Ticks elapsed since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Convert milliseconds to ticks, rounding a nonzero duration up to at
/// least one tick.
pub fn ms_to_ticks(ms: u64) -> u64 {
    let ticks = (ms * TIMER_HZ) / 1000;
    if ticks == 0 && ms > 0 { 1 } else { ticks }
}
