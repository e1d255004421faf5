//! x86_64 architecture support

pub mod context;
pub mod gdt;
pub mod idt;
pub mod mmu;
pub mod serial;
pub mod syscall;
pub mod timer;
pub mod trap;

/// Bring up the BSP: descriptor tables, trap gateway, syscall MSRs, timer.
pub fn init() {
    gdt::init();
    idt::init();
    syscall::init();
    timer::init();
    log::info!(target: "arch", "x86_64 bring-up complete");
}

/// Enable interrupts.
pub fn enable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::enable();
}

/// Disable interrupts.
pub fn disable_interrupts() {
    #[cfg(target_os = "none")]
    x86_64::instructions::interrupts::disable();
}

/// Run `f` with interrupts disabled.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    #[cfg(target_os = "none")]
    {
        x86_64::instructions::interrupts::without_interrupts(f)
    }
    #[cfg(not(target_os = "none"))]
    {
        f()
    }
}

/// Halt this CPU forever.
pub fn halt() -> ! {
    loop {
        #[cfg(target_os = "none")]
        x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Wait for the next interrupt.
pub fn wait_for_interrupt() {
    #[cfg(target_os = "none")]
    x86_64::instructions::hlt();
    #[cfg(not(target_os = "none"))]
    core::hint::spin_loop();
}
