//! Process and thread management
//!
//! PCBs and TCBs live in arenas owned by the process table; every
//! cross-reference is a typed id resolved through the table, never a
//! pointer. Destruction order on reap: threads, file descriptors, IPC
//! channels, VMAs, page table, then the PCB slot itself.

extern crate alloc;

pub mod fork;
pub mod lifecycle;
pub mod pcb;
pub mod table;
pub mod thread;
pub mod wait;

pub use pcb::{Process, ProcessMemory};
pub use table::{ProcessTable, PROCESS_TABLE};
pub use thread::Thread;

/// Process id. Monotonic within a boot; the table maps ids to arena slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl core::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread id, globally unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kernel's own process (idle and kernel threads).
pub const KERNEL_PID: ProcessId = ProcessId(0);

/// Task state, shared by processes and threads.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Sleeping,
    Blocked,
    Stopped,
    Waiting,
    /// Exited, waiting to be reaped
    Zombie,
    /// Reaped; the slot is eligible for reclamation
    Terminated,
}

/// Scheduling priority, lowest to highest.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Idle = 0,
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    pub const COUNT: usize = 5;

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Priority::Idle),
            1 => Some(Priority::Low),
            2 => Some(Priority::Normal),
            3 => Some(Priority::High),
            4 => Some(Priority::Critical),
            _ => None,
        }
    }
}

/// Ring the process's threads run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Kernel,
    User,
}

/// Which syscall table the process's threads dispatch through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compat {
    #[default]
    Native,
    Linux,
}

/// Per-process security record. `critical` is kernel-authoritative: user
/// code can query it through kernel_ctl but never set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Security {
    pub mode: ExecMode,
    pub uid: u32,
    pub gid: u32,
    pub critical: bool,
}

impl Security {
    pub const fn kernel() -> Self {
        Self {
            mode: ExecMode::Kernel,
            uid: 0,
            gid: 0,
            critical: true,
        }
    }

    pub const fn user(uid: u32, gid: u32) -> Self {
        Self {
            mode: ExecMode::User,
            uid,
            gid,
            critical: false,
        }
    }
}

/// Ceilings for the arenas.
pub const MAX_PROCESSES: usize = 256;
pub const MAX_THREADS: usize = 1024;

/// Signals delivered on unrecoverable user faults.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    SIGILL = 4,
    SIGTRAP = 5,
    SIGBUS = 7,
    SIGFPE = 8,
    SIGKILL = 9,
    SIGSEGV = 11,
}

impl Signal {
    /// Exit code for a signal death, wait(2) convention.
    pub const fn exit_code(self) -> i32 {
        128 + self as i32
    }
}
