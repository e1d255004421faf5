//! i386 skeleton port
//!
//! Placeholder back-end: compiles for the target but brings up nothing.
//! The 32-bit port needs its own descriptor tables, 2-level paging and a
//! PAE decision before any of the core can run here.

pub fn init() {}

pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}
