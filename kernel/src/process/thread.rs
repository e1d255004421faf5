//! Thread control block

extern crate alloc;

use alloc::{boxed::Box, vec, vec::Vec};

use super::{Priority, ProcessId, TaskState, ThreadId};
use crate::arch::{FpuState, TlsBases, TrapFrame};
use crate::ipc::ChannelId;

/// Kernel stack size per thread.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Default user stack: one mapped page, growable.
pub const USER_STACK_TOP: u64 = 0x7FFF_FFFF_F000;
/// How far below its top a user stack may grow.
pub const USER_STACK_LIMIT: u64 = 8 * 1024 * 1024;
/// Gap between consecutive thread stacks in one process.
pub const USER_STACK_STRIDE: u64 = 16 * 1024 * 1024;

/// Heap-allocated kernel stack. The thread's trap entries and syscalls run
/// on it; freed when the parent reaps the thread.
pub struct KernelStack {
    buf: Vec<u8>,
}

impl KernelStack {
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; KERNEL_STACK_SIZE],
        }
    }

    /// Stack top, 16-byte aligned as the ABI requires.
    pub fn top(&self) -> u64 {
        let end = self.buf.as_ptr() as u64 + self.buf.len() as u64;
        end & !0xF
    }
}

impl Default for KernelStack {
    fn default() -> Self {
        Self::new()
    }
}

/// User stack descriptor with its growth low-water mark.
#[derive(Debug, Clone, Copy)]
pub struct UserStack {
    /// Highest address (exclusive) of the stack area
    pub top: u64,
    /// Lowest currently-mapped address
    pub low_mark: u64,
    /// Absolute floor the stack may grow down to
    pub limit: u64,
}

/// What a non-runnable thread is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitTarget {
    #[default]
    Nothing,
    /// wait(): a specific child (or any when None), with the user address
    /// the exit status is delivered to
    Child {
        pid: Option<ProcessId>,
        status_out: u64,
    },
    /// IPC wait(): the channel's write latch
    Channel(ChannelId),
}

/// Thread control block. Owned by the process table arena; referenced
/// everywhere by `ThreadId`.
pub struct Thread {
    pub tid: ThreadId,
    pub process: ProcessId,
    pub state: TaskState,
    pub priority: Priority,
    /// Critical-section latch: inhibits preemption while set. A fault in a
    /// critical thread is fatal to the system.
    pub critical: bool,
    /// The suspended CPU state; the only representation of a paused thread.
    pub frame: TrapFrame,
    /// Lazily allocated FPU block
    pub fpu: Option<Box<FpuState>>,
    pub kernel_stack: KernelStack,
    pub user_stack: Option<UserStack>,
    pub tls: TlsBases,
    /// Linux set_tid_address: zeroed and futex-woken on exit
    pub clear_child_tid: u64,
    /// Tick accounting, split by ring
    pub kernel_time: u64,
    pub user_time: u64,
    /// Remaining round-robin ticks in the current slice
    pub time_slice: u32,
    /// Absolute tick deadline for Sleeping threads
    pub wake_at: Option<u64>,
    pub waiting_for: WaitTarget,
    pub exit_code: i32,
}

/// Round-robin slice per priority, in ticks.
pub fn slice_for(priority: Priority) -> u32 {
    match priority {
        Priority::Idle => 1,
        Priority::Low => 5,
        Priority::Normal => 10,
        Priority::High => 20,
        Priority::Critical => u32::MAX,
    }
}

impl Thread {
    /// Kernel thread starting at `entry` on its own kernel stack.
    pub fn new_kernel(tid: ThreadId, process: ProcessId, entry: u64, priority: Priority) -> Self {
        let kernel_stack = KernelStack::new();
        let frame = TrapFrame::new_kernel(entry, kernel_stack.top());
        Self {
            tid,
            process,
            state: TaskState::Ready,
            priority,
            critical: false,
            frame,
            fpu: None,
            kernel_stack,
            user_stack: None,
            tls: TlsBases::default(),
            clear_child_tid: 0,
            kernel_time: 0,
            user_time: 0,
            time_slice: slice_for(priority),
            wake_at: None,
            waiting_for: WaitTarget::Nothing,
            exit_code: 0,
        }
    }

    /// User thread resuming (or starting) from `frame`.
    pub fn new_user(
        tid: ThreadId,
        process: ProcessId,
        frame: TrapFrame,
        user_stack: UserStack,
        priority: Priority,
    ) -> Self {
        Self {
            tid,
            process,
            state: TaskState::Ready,
            priority,
            critical: false,
            frame,
            fpu: None,
            kernel_stack: KernelStack::new(),
            user_stack: Some(user_stack),
            tls: TlsBases::default(),
            clear_child_tid: 0,
            kernel_time: 0,
            user_time: 0,
            time_slice: slice_for(priority),
            wake_at: None,
            waiting_for: WaitTarget::Nothing,
            exit_code: 0,
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }

    /// Touch the FPU block into existence.
    pub fn fpu_mut(&mut self) -> &mut FpuState {
        self.fpu.get_or_insert_with(|| Box::new(FpuState::new()))
    }

    /// Charge one tick to the ring the thread was interrupted in.
    pub fn account_tick(&mut self, from_user: bool) {
        if from_user {
            self.user_time += 1;
        } else {
            self.kernel_time += 1;
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn kernel_stack_top_is_aligned() {
        let stack = KernelStack::new();
        assert_eq!(stack.top() % 16, 0);
        let base = stack.buf.as_ptr() as u64;
        assert!(stack.top() > base);
        assert!(stack.top() <= base + KERNEL_STACK_SIZE as u64);
    }

    #[test]
    fn slices_scale_with_priority() {
        assert!(slice_for(Priority::High) > slice_for(Priority::Normal));
        assert!(slice_for(Priority::Normal) > slice_for(Priority::Idle));
        // Critical threads never exhaust their slice.
        assert_eq!(slice_for(Priority::Critical), u32::MAX);
    }

    #[test]
    fn tick_accounting_splits_rings() {
        let mut thread = Thread::new_kernel(ThreadId(1), ProcessId(0), 0x1000, Priority::Normal);
        thread.account_tick(true);
        thread.account_tick(true);
        thread.account_tick(false);
        assert_eq!(thread.user_time, 2);
        assert_eq!(thread.kernel_time, 1);
    }
}
