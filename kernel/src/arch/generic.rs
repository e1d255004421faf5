//! Generic placeholders for the skeleton ports
//!
//! The i386 and aarch64 back-ends compile the portable core against these
//! types; none of them reaches hardware. A real port replaces the lot the
//! way `arch::x86_64` does.

/// Register snapshot shape shared with the primary port so the portable
/// core compiles unchanged.
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

    pub fn new_user(entry: u64, stack_top: u64) -> Self {
        let mut frame = Self::zeroed();
        frame.rip = entry;
        frame.rsp = stack_top;
        frame.cs = 3;
        frame
    }

    pub fn new_kernel(entry: u64, stack_top: u64) -> Self {
        let mut frame = Self::zeroed();
        frame.rip = entry;
        frame.rsp = stack_top;
        frame
    }

    pub const fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    pub const fn syscall_number(&self) -> u64 {
        self.rax
    }

    pub const fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    pub fn set_return(&mut self, value: i64) {
        self.rax = value as u64;
    }
}

#[derive(Clone, Default)]
pub struct FpuState;

impl FpuState {
    pub const fn new() -> Self {
        Self
    }

    pub fn save(&mut self) {}

    pub fn restore(&self) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsBases {
    pub fs_base: u64,
    pub gs_base: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RingEntry {
    pub vector: u64,
    pub rip: u64,
    pub error_code: u64,
}

pub const FRAME_RING_SIZE: usize = 32;

pub fn ring_snapshot() -> ([RingEntry; FRAME_RING_SIZE], usize) {
    ([RingEntry::default(); FRAME_RING_SIZE], 0)
}
