//! Trap gateway: entry stubs and the TrapFrame
//!
//! Every vector lands in a naked stub that materializes a [`TrapFrame`] on
//! the current kernel stack; this is the only place a frame comes into
//! existence. The common path swaps GS on user entry, calls
//! [`trap_dispatch`], and returns through `iretq`. All suspended-thread
//! manipulation (context switch, fork child setup, signal delivery) works
//! on these frames.

use spin::Mutex;

/// Saved CPU state at kernel entry. Field order mirrors the push sequence
/// in the common stub; the tail (`rip` onward) is the hardware interrupt
/// frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// RFLAGS with the interrupt-enable bit set.
pub const RFLAGS_IF: u64 = 0x202;

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: RFLAGS_IF,
            rsp: 0,
            ss: 0,
        }
    }

    /// Fabricate a frame that starts a ring 3 thread at `entry` with the
    /// given user stack.
    pub fn new_user(entry: u64, stack_top: u64) -> Self {
        let selectors = super::gdt::selectors();
        let mut frame = Self::zeroed();
        frame.rip = entry;
        frame.rsp = stack_top;
        frame.cs = selectors.user_code.0 as u64;
        frame.ss = selectors.user_data.0 as u64;
        frame.rflags = RFLAGS_IF;
        frame
    }

    /// Fabricate a frame that starts a ring 0 thread at `entry`.
    pub fn new_kernel(entry: u64, stack_top: u64) -> Self {
        let selectors = super::gdt::selectors();
        let mut frame = Self::zeroed();
        frame.rip = entry;
        // Leave room for the fake return address convention.
        frame.rsp = stack_top - 8;
        frame.cs = selectors.kernel_code.0 as u64;
        frame.ss = selectors.kernel_data.0 as u64;
        frame.rflags = RFLAGS_IF;
        frame
    }

    /// Did this trap come out of ring 3?
    pub const fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Syscall number register.
    pub const fn syscall_number(&self) -> u64 {
        self.rax
    }

    /// The six syscall argument registers, in ABI order.
    pub const fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    /// Store a syscall return value.
    pub fn set_return(&mut self, value: i64) {
        self.rax = value as u64;
    }
}

/// Entries kept in the saved-IP ring for the crash diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingEntry {
    pub vector: u64,
    pub rip: u64,
    pub error_code: u64,
}

/// Depth of the saved-IP ring behind the crash "frames" screen.
pub const FRAME_RING_SIZE: usize = 32;

struct FrameRing {
    entries: [RingEntry; FRAME_RING_SIZE],
    next: usize,
    recorded: usize,
}

static FRAME_RING: Mutex<FrameRing> = Mutex::new(FrameRing {
    entries: [RingEntry {
        vector: 0,
        rip: 0,
        error_code: 0,
    }; FRAME_RING_SIZE],
    next: 0,
    recorded: 0,
});

fn ring_record(frame: &TrapFrame) {
    let mut ring = FRAME_RING.lock();
    let slot = ring.next;
    ring.entries[slot] = RingEntry {
        vector: frame.vector,
        rip: frame.rip,
        error_code: frame.error_code,
    };
    ring.next = (slot + 1) % FRAME_RING_SIZE;
    ring.recorded = (ring.recorded + 1).min(FRAME_RING_SIZE);
}

/// Snapshot the ring, most recent entry first.
pub fn ring_snapshot() -> ([RingEntry; FRAME_RING_SIZE], usize) {
    let ring = FRAME_RING.lock();
    let mut out = [RingEntry::default(); FRAME_RING_SIZE];
    for i in 0..ring.recorded {
        let idx = (ring.next + FRAME_RING_SIZE - 1 - i) % FRAME_RING_SIZE;
        out[i] = ring.entries[idx];
    }
    (out, ring.recorded)
}

/// Test support: reset the ring between cases.
#[cfg(not(target_os = "none"))]
pub fn ring_clear() {
    let mut ring = FRAME_RING.lock();
    ring.next = 0;
    ring.recorded = 0;
}

/// Central dispatch, called by the common stub with the freshly built
/// frame. Routing: exceptions to the crash handler, device vectors to the
/// IRQ layer, the syscall gate to the dispatcher.
#[no_mangle]
pub extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    ring_record(frame);
    match frame.vector {
        0..=31 => crate::crash::handle_exception(frame),
        SYSCALL_VECTOR_U64 => crate::syscall::dispatch(frame),
        32..=47 => crate::irq::dispatch(frame.vector as u8, frame),
        other => {
            log::warn!(target: "trap", "spurious vector {} at {:#x}", other, frame.rip);
        }
    }
}

/// Software interrupt vector for the syscall gate.
pub const SYSCALL_VECTOR: u8 = 0x80;
const SYSCALL_VECTOR_U64: u64 = SYSCALL_VECTOR as u64;

/// Offset of `cs` within the frame, used by the assembly stubs.
const CS_OFFSET: usize = 18 * 8;

/// The common trap path: save registers, swap GS for user entries, call
/// the dispatcher, undo, `iretq`. The stack already holds
/// `[vector][error][rip][cs][rflags][rsp][ss]` when this runs.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub(super) unsafe extern "C" fn trap_common() {
    core::arch::naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // User entry: switch to the kernel GS base.
        "test qword ptr [rsp + {cs_off}], 3",
        "jz 2f",
        "swapgs",
        "2:",
        "mov rdi, rsp",
        "cld",
        "call {dispatch}",
        // The dispatcher may have switched frames (context switch); the
        // frame on the stack decides whether we return to user.
        "test qword ptr [rsp + {cs_off}], 3",
        "jz 3f",
        "swapgs",
        "3:",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "add rsp, 16",
        "iretq",
        cs_off = const CS_OFFSET,
        dispatch = sym trap_dispatch,
    );
}

/// Resume a thread directly from a stored frame, bypassing any stacked
/// trap context. Used for a fork child's first run and for fresh threads:
/// the frame's own `rsp`/`rip` take over, so the kernel stack this runs on
/// is simply abandoned.
///
/// # Safety
///
/// `frame` must point to a fully-populated frame whose selectors and
/// stack are valid in the current address space; interrupts must be
/// disabled around the call.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn frame_restore(frame: *const TrapFrame) -> ! {
    core::arch::naked_asm!(
        "mov rsp, rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // rsp now sits at the vector slot; cs is 24 bytes up.
        "test qword ptr [rsp + 24], 3",
        "jz 2f",
        "swapgs",
        "2:",
        "add rsp, 16",
        "iretq",
    );
}

macro_rules! trap_stub {
    ($name:ident, $vector:literal, noerr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            );
        }
    };
    ($name:ident, $vector:literal, err) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            // The CPU already pushed the error code.
            core::arch::naked_asm!(
                "push {vector}",
                "jmp {common}",
                vector = const $vector,
                common = sym trap_common,
            );
        }
    };
}

macro_rules! trap_table {
    ($(($name:ident, $vector:literal, $kind:tt)),* $(,)?) => {
        $(trap_stub!($name, $vector, $kind);)*

        /// Entry address for `vector`, if a stub exists for it.
        #[cfg(target_arch = "x86_64")]
        pub fn stub_for(vector: u8) -> Option<u64> {
            match vector {
                $($vector => Some($name as usize as u64),)*
                _ => None,
            }
        }
    };
}

#[rustfmt::skip]
trap_table!(
    (stub_divide_error, 0, noerr),
    (stub_debug, 1, noerr),
    (stub_nmi, 2, noerr),
    (stub_breakpoint, 3, noerr),
    (stub_overflow, 4, noerr),
    (stub_bound_range, 5, noerr),
    (stub_invalid_opcode, 6, noerr),
    (stub_device_not_available, 7, noerr),
    (stub_double_fault, 8, err),
    (stub_coproc_overrun, 9, noerr),
    (stub_invalid_tss, 10, err),
    (stub_segment_not_present, 11, err),
    (stub_stack_segment, 12, err),
    (stub_general_protection, 13, err),
    (stub_page_fault, 14, err),
    (stub_x87_fp, 16, noerr),
    (stub_alignment_check, 17, err),
    (stub_machine_check, 18, noerr),
    (stub_simd_fp, 19, noerr),
    (stub_virtualization, 20, noerr),
    (stub_control_protection, 21, err),
    (stub_irq0, 32, noerr),
    (stub_irq1, 33, noerr),
    (stub_irq2, 34, noerr),
    (stub_irq3, 35, noerr),
    (stub_irq4, 36, noerr),
    (stub_irq5, 37, noerr),
    (stub_irq6, 38, noerr),
    (stub_irq7, 39, noerr),
    (stub_irq8, 40, noerr),
    (stub_irq9, 41, noerr),
    (stub_irq10, 42, noerr),
    (stub_irq11, 43, noerr),
    (stub_irq12, 44, noerr),
    (stub_irq13, 45, noerr),
    (stub_irq14, 46, noerr),
    (stub_irq15, 47, noerr),
    (stub_syscall_gate, 0x80, noerr),
);

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_stub_offsets() {
        // The assembly hard-codes cs at 18 qwords into the frame.
        assert_eq!(core::mem::offset_of!(TrapFrame, cs), CS_OFFSET);
        assert_eq!(core::mem::offset_of!(TrapFrame, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, rip), 17 * 8);
        assert_eq!(core::mem::size_of::<TrapFrame>(), 22 * 8);
    }

    #[test]
    fn user_frame_selectors() {
        use super::super::gdt::{USER_CODE_SELECTOR, USER_DATA_SELECTOR};

        let frame = TrapFrame::new_user(0x40_0000, 0x7FFF_FFFF_F000);
        assert!(frame.from_user());
        assert_eq!(frame.cs, USER_CODE_SELECTOR as u64);
        assert_eq!(frame.ss, USER_DATA_SELECTOR as u64);
        assert_eq!(frame.rflags & 0x200, 0x200);

        let kframe = TrapFrame::new_kernel(0xFFFF_8000_0010_0000, 0xFFFF_8000_0020_0000);
        assert!(!kframe.from_user());
    }

    #[test]
    fn syscall_argument_extraction() {
        let mut frame = TrapFrame::zeroed();
        frame.rax = 16;
        frame.rdi = 1;
        frame.rsi = 2;
        frame.rdx = 3;
        frame.r10 = 4;
        frame.r8 = 5;
        frame.r9 = 6;
        assert_eq!(frame.syscall_number(), 16);
        assert_eq!(frame.syscall_args(), [1, 2, 3, 4, 5, 6]);
        frame.set_return(-38);
        assert_eq!(frame.rax as i64, -38);
    }

    #[test]
    fn ring_keeps_most_recent_first() {
        ring_clear();
        for vector in 0..5u64 {
            let mut frame = TrapFrame::zeroed();
            frame.vector = 32; // routed to irq dispatch, which tolerates tests
            frame.rip = 0x1000 + vector;
            super::ring_record(&frame);
        }
        let (entries, count) = ring_snapshot();
        assert_eq!(count, 5);
        assert_eq!(entries[0].rip, 0x1004);
        assert_eq!(entries[4].rip, 0x1000);
    }
}
