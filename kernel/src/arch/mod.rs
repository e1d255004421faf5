//! Architecture dispatch
//!
//! x86_64 is the primary target; the i386 and aarch64 back-ends are
//! skeleton ports that bring up nothing beyond a halt loop.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86")]
pub mod i386;

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(not(target_arch = "x86_64"))]
mod generic;

// Arch-neutral surface consumed by the scheduler, crash handler and
// syscall layer. The primary port provides the real thing; the skeleton
// ports get the generic placeholders.
#[cfg(target_arch = "x86_64")]
pub use x86_64::{
    context::{FpuState, TlsBases},
    trap::{ring_snapshot, RingEntry, TrapFrame, FRAME_RING_SIZE, RFLAGS_IF},
};
#[cfg(not(target_arch = "x86_64"))]
pub use generic::{
    ring_snapshot, FpuState, RingEntry, TlsBases, TrapFrame, FRAME_RING_SIZE, RFLAGS_IF,
};

/// Monotonic tick counter (1 ms domain on every port).
pub fn ticks() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::timer::ticks()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}

/// Install a thread's machine state on a context switch.
pub fn apply_context(
    kernel_stack_top: u64,
    root: Option<crate::mm::PhysicalAddress>,
    tls: TlsBases,
) {
    #[cfg(target_arch = "x86_64")]
    x86_64::context::apply(kernel_stack_top, root, tls);
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = (kernel_stack_top, root, tls);
    }
}

/// Install TLS bases for the running thread (local_thread_state,
/// arch_prctl).
pub fn set_tls(tls: TlsBases) {
    #[cfg(target_arch = "x86_64")]
    x86_64::context::set_tls(tls);
    #[cfg(not(target_arch = "x86_64"))]
    let _ = tls;
}

/// The page-fault address register (CR2 on x86).
pub fn fault_address() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::mmu::read_cr2()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        0
    }
}

pub fn init() {
    #[cfg(target_arch = "x86_64")]
    x86_64::init();
    #[cfg(target_arch = "x86")]
    i386::init();
    #[cfg(target_arch = "aarch64")]
    aarch64::init();
}

pub fn halt() -> ! {
    #[cfg(target_arch = "x86_64")]
    x86_64::halt();
    #[cfg(target_arch = "x86")]
    i386::halt();
    #[cfg(target_arch = "aarch64")]
    aarch64::halt();
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
    loop {
        core::hint::spin_loop();
    }
}

/// Run `f` with interrupts disabled.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(target_arch = "x86_64")]
    {
        x86_64::without_interrupts(f)
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        f()
    }
}
