//! IRQ dispatch
//!
//! Device vectors land here from the trap gateway. Line 0 is the timer:
//! it advances the monotonic clock and drives the scheduler tick. Other
//! lines go to whatever handler a driver registered.

use spin::Mutex;

use crate::arch::TrapFrame;

/// A registered device interrupt handler.
pub type IrqHandler = fn(u8, &mut TrapFrame);

const LINES: usize = 16;

static HANDLERS: Mutex<[Option<IrqHandler>; LINES]> = Mutex::new([None; LINES]);

/// Register a handler for an IRQ line (0-15).
pub fn register(line: u8, handler: IrqHandler) {
    if (line as usize) < LINES {
        HANDLERS.lock()[line as usize] = Some(handler);
    }
}

/// Dispatch a remapped PIC vector (32..48).
pub fn dispatch(vector: u8, frame: &mut TrapFrame) {
    let line = vector.wrapping_sub(32);
    if line as usize >= LINES {
        log::warn!(target: "irq", "vector {} outside the PIC range", vector);
        return;
    }

    if line == 0 {
        #[cfg(target_arch = "x86_64")]
        crate::arch::x86_64::timer::on_tick();
        crate::sched::tick(frame);
    } else {
        let handler = HANDLERS.lock()[line as usize];
        match handler {
            Some(handler) => handler(line, frame),
            None => log::debug!(target: "irq", "unclaimed IRQ line {}", line),
        }
    }

    #[cfg(target_arch = "x86_64")]
    crate::arch::x86_64::timer::end_of_interrupt(vector);
}
