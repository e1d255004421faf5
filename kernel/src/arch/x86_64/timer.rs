//! PIT timer tick source
//!
//! Programs the legacy PIT for a 1000 Hz tick behind the remapped PIC.
//! One tick equals one millisecond; the scheduler and `sleep` share this
//! single monotonic domain.

use core::sync::atomic::{AtomicU64, Ordering};

use pic8259::ChainedPics;
use spin::Mutex;

/// PIC vector remap bases: IRQ0 lands on vector 32.
pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Timer frequency (ticks per second). One tick = 1 ms.
pub const TICK_HZ: u64 = 1000;

pub static PICS: Mutex<ChainedPics> =
    // SAFETY: standard PIC ports with the conventional remap offsets.
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonic milliseconds since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Called from the timer IRQ path, once per tick.
pub fn on_tick() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

/// Advance time artificially; test support for sleep/wake deadlines.
#[cfg(not(target_os = "none"))]
pub fn advance(ticks: u64) {
    TICKS.fetch_add(ticks, Ordering::Relaxed);
}

/// Program the PIT for TICK_HZ and unmask the timer line.
pub fn init() {
    #[cfg(target_os = "none")]
    {
        use x86_64::instructions::port::Port;
        const PIT_FREQUENCY: u64 = 1_193_182;
        let divisor = (PIT_FREQUENCY / TICK_HZ) as u16;
        // SAFETY: standard PIT command/data ports; mode 3 square wave on
        // channel 0.
        unsafe {
            let mut command: Port<u8> = Port::new(0x43);
            let mut channel0: Port<u8> = Port::new(0x40);
            command.write(0x36u8);
            channel0.write((divisor & 0xFF) as u8);
            channel0.write((divisor >> 8) as u8);
        }
        // SAFETY: one-time PIC init during bring-up.
        unsafe { PICS.lock().initialize() };
    }
    log::debug!(target: "timer", "PIT programmed for {} Hz", TICK_HZ);
}

/// Acknowledge an IRQ at the PIC.
pub fn end_of_interrupt(vector: u8) {
    #[cfg(target_os = "none")]
    {
        // SAFETY: vector came from the IRQ dispatch path.
        unsafe { PICS.lock().notify_end_of_interrupt(vector) };
    }
    #[cfg(not(target_os = "none"))]
    let _ = vector;
}
