//! SYSCALL/SYSRET fast path
//!
//! The MSR entry builds the same hardware-shaped tail the interrupt stubs
//! get from the CPU, then funnels into the common trap path, so a `syscall`
//! instruction and an `int 0x80` produce byte-identical [`TrapFrame`]s and
//! return through the same `iretq` epilogue. That keeps context switches
//! inside syscalls (sleep, yield, wait) uniform with preemption.

use core::cell::UnsafeCell;

use super::trap::SYSCALL_VECTOR;

/// Per-CPU stack slots reached via `gs:` from the entry stub. Offset 0 is
/// the current thread's kernel stack top, offset 8 a scratch slot for the
/// user stack pointer.
#[repr(C)]
pub struct SyscallStacks {
    kernel_rsp: UnsafeCell<u64>,
    user_scratch: UnsafeCell<u64>,
}

// SAFETY: accessed only by the owning CPU through gs-relative addressing
// and by the scheduler with interrupts disabled.
unsafe impl Sync for SyscallStacks {}

pub static SYSCALL_STACKS: SyscallStacks = SyscallStacks {
    kernel_rsp: UnsafeCell::new(0),
    user_scratch: UnsafeCell::new(0),
};

/// Publish the current thread's kernel stack top for syscall entry. Called
/// by the scheduler on every context switch, interrupts disabled.
pub fn set_kernel_rsp(stack_top: u64) {
    // SAFETY: single writer (the scheduler on this CPU) with interrupts
    // disabled; the entry stub only reads it after swapgs.
    unsafe { *SYSCALL_STACKS.kernel_rsp.get() = stack_top };
}

/// SYSCALL instruction entry.
///
/// Stacks the user return state in hardware-interrupt order, then joins
/// the common trap path with the syscall gate vector. GS is swapped back
/// before the jump because the common path performs its own user-entry
/// swap.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "swapgs",
        "mov gs:[8], rsp",
        "mov rsp, gs:[0]",
        "push {uss}",             // user ss
        "push qword ptr gs:[8]",  // user rsp
        "push r11",               // rflags (as saved by SYSCALL)
        "push {ucs}",             // user cs
        "push rcx",               // rip (as saved by SYSCALL)
        "swapgs",
        "push 0",                 // error code slot
        "push {vector}",
        "jmp {common}",
        uss = const super::gdt::USER_DATA_SELECTOR,
        ucs = const super::gdt::USER_CODE_SELECTOR,
        vector = const SYSCALL_VECTOR,
        common = sym super::trap::trap_common,
    );
}

/// Program the SYSCALL MSRs: entry point, segment bases, and an RFLAGS
/// mask that clears IF until the kernel stack is in place.
pub fn init() {
    #[cfg(target_os = "none")]
    {
        use x86_64::registers::model_specific::{Efer, EferFlags, KernelGsBase, LStar, SFMask, Star};
        use x86_64::registers::rflags::RFlags;
        use x86_64::VirtAddr;

        let selectors = super::gdt::selectors();
        // SAFETY: one-shot MSR programming during bring-up; the selectors
        // satisfy the STAR layout checks.
        unsafe {
            Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
            LStar::write(VirtAddr::new(syscall_entry as usize as u64));
            if let Err(e) = Star::write(
                selectors.user_code,
                selectors.user_data,
                selectors.kernel_code,
                selectors.kernel_data,
            ) {
                panic!("STAR selector layout rejected: {}", e);
            }
            SFMask::write(RFlags::INTERRUPT_FLAG);
        }
        // While in the kernel, gs points at the per-CPU stack slots; the
        // value swapped in for user mode starts as zero.
        use x86_64::registers::model_specific::GsBase;
        GsBase::write(VirtAddr::new(&SYSCALL_STACKS as *const _ as u64));
        KernelGsBase::write(VirtAddr::new(0));
    }
}
