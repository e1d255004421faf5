//! Crash handling
//!
//! Central exception dispatcher. Kernel-mode faults are fatal: the system
//! renders a diagnostic report and halts. User-mode faults go through the
//! recovery ladder (COW, stack growth, signal). A reserved-bit page fault
//! is always fatal regardless of origin, because it means a corrupted
//! page-table entry.

pub mod report;
pub mod user;

use crate::arch::TrapFrame;
use crate::process::Signal;

bitflags::bitflags! {
    /// Architectural page-fault error code, decoded.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u64 {
        /// Fault on a present page (protection), not a missing one
        const PRESENT        = 1 << 0;
        const WRITE          = 1 << 1;
        const USER           = 1 << 2;
        /// Reserved bit set in a PTE; the tables are corrupt
        const RESERVED       = 1 << 3;
        const INSTRUCTION    = 1 << 4;
        const PROTECTION_KEY = 1 << 5;
        const SHADOW_STACK   = 1 << 6;
    }
}

/// x86 exception vectors the dispatcher names explicitly.
pub const VECTOR_PAGE_FAULT: u64 = 14;

/// Map an exception vector to the POSIX-style signal delivered to user
/// processes when recovery fails.
pub fn signal_for_vector(vector: u64) -> Signal {
    match vector {
        0 => Signal::SIGFPE,          // divide error
        16 | 19 => Signal::SIGFPE,    // x87 / SIMD floating point
        1 | 3 => Signal::SIGTRAP,     // debug, breakpoint
        6 => Signal::SIGILL,          // invalid opcode
        17 => Signal::SIGBUS,         // alignment check
        13 | 14 => Signal::SIGSEGV,   // general protection, page fault
        _ => Signal::SIGILL,
    }
}

/// Entry from the trap gateway for vectors 0-31.
pub fn handle_exception(frame: &mut TrapFrame) {
    if frame.vector == VECTOR_PAGE_FAULT {
        let code = PageFaultCode::from_bits_truncate(frame.error_code);
        if code.contains(PageFaultCode::RESERVED) {
            report::kernel_panic(frame, "page-table entry has reserved bits set");
        }
    }

    if frame.from_user() {
        user::handle_user_fault(frame);
    } else {
        report::kernel_panic(frame, "exception in kernel mode");
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn vector_to_signal() {
        assert_eq!(signal_for_vector(0), Signal::SIGFPE);
        assert_eq!(signal_for_vector(6), Signal::SIGILL);
        assert_eq!(signal_for_vector(13), Signal::SIGSEGV);
        assert_eq!(signal_for_vector(14), Signal::SIGSEGV);
        assert_eq!(signal_for_vector(3), Signal::SIGTRAP);
        assert_eq!(signal_for_vector(17), Signal::SIGBUS);
    }

    #[test]
    fn page_fault_code_decoding() {
        let code = PageFaultCode::from_bits_truncate(0b0110);
        assert!(code.contains(PageFaultCode::WRITE));
        assert!(code.contains(PageFaultCode::USER));
        assert!(!code.contains(PageFaultCode::PRESENT));
        assert!(!code.contains(PageFaultCode::RESERVED));
    }
}
