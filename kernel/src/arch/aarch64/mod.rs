//! AArch64 skeleton port
//!
//! Placeholder back-end: compiles for the target but brings up nothing.
//! EL1 translation tables, the vector table and a GIC driver are the
//! missing pieces before the core can run here.

pub fn init() {}

pub fn halt() -> ! {
    loop {
        // WFE once the exception vectors exist; spin until then.
        core::hint::spin_loop();
    }
}
