//! Per-thread CPU context pieces outside the TrapFrame
//!
//! The TrapFrame carries the general-purpose state; this module owns what
//! it does not: the FPU/SSE block and the TLS segment bases. The scheduler
//! calls [`apply`] when switching to a thread of a different process.

/// FXSAVE area. 512 bytes, 16-byte aligned, one per thread that has
/// touched the FPU.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FpuState {
    area: [u8; 512],
}

impl FpuState {
    pub const fn new() -> Self {
        Self { area: [0; 512] }
    }

    /// Store the current FPU/SSE state into this block.
    pub fn save(&mut self) {
        #[cfg(target_os = "none")]
        // SAFETY: the area is 512 bytes and 16-byte aligned as fxsave64
        // requires.
        unsafe {
            core::arch::asm!("fxsave64 [{}]", in(reg) self.area.as_mut_ptr());
        }
    }

    /// Load this block into the FPU.
    pub fn restore(&self) {
        #[cfg(target_os = "none")]
        // SAFETY: the area holds a layout previously produced by fxsave64
        // (or the zeroed power-on state).
        unsafe {
            core::arch::asm!("fxrstor64 [{}]", in(reg) self.area.as_ptr());
        }
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-local segment bases (FS for TLS, GS for the user-mode side of
/// swapgs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlsBases {
    pub fs_base: u64,
    pub gs_base: u64,
}

/// Install a thread's TLS bases. The user GS value parks in KERNEL_GS_BASE
/// while the kernel runs; swapgs activates it on the way out.
pub fn set_tls(tls: TlsBases) {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::{FsBase, KernelGsBase};
        use x86_64::VirtAddr;
        FsBase::write(VirtAddr::new(tls.fs_base));
        KernelGsBase::write(VirtAddr::new(tls.gs_base));
    }
    #[cfg(not(target_os = "none"))]
    let _ = tls;
}

/// Read back the active TLS bases (for fork and local_thread_state).
pub fn current_tls() -> TlsBases {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::{FsBase, KernelGsBase};
        TlsBases {
            fs_base: FsBase::read().as_u64(),
            gs_base: KernelGsBase::read().as_u64(),
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        TlsBases::default()
    }
}

/// Apply the per-thread machine state on a context switch: ring 0 stack
/// for traps and syscalls, page-table root when the process changes, TLS
/// bases. The TrapFrame itself is swapped by the scheduler.
///
/// This is the single owner of RSP0 after bring-up: the incoming thread's
/// kernel stack top goes verbatim into the TSS slot and the per-CPU
/// syscall slot, always both, so the interrupt and SYSCALL entry paths
/// can never disagree about the ring 0 stack.
pub fn apply(kernel_stack_top: u64, root: Option<crate::mm::PhysicalAddress>, tls: TlsBases) {
    super::gdt::publish_rsp0(kernel_stack_top);
    super::syscall::set_kernel_rsp(kernel_stack_top);
    if let Some(root) = root {
        super::mmu::write_cr3(root);
    }
    set_tls(tls);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn apply_publishes_kernel_stack_verbatim() {
        // RSP0 must hold exactly the value passed in, never anything
        // derived from the stack pointer at the time of the call.
        apply(0xFFFF_9000_DEAD_0000, None, TlsBases::default());
        assert_eq!(super::super::gdt::rsp0(), 0xFFFF_9000_DEAD_0000);
        apply(0xFFFF_9000_BEEF_8000, None, TlsBases::default());
        assert_eq!(super::super::gdt::rsp0(), 0xFFFF_9000_BEEF_8000);
    }
}
