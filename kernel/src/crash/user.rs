//! User-mode fault recovery
//!
//! Recovery ladder, in order: copy-on-write resolution for writes to
//! read-only pages inside COW areas, downward stack growth for accesses
//! just below the stack within its limit, then signal translation. A
//! critical process never takes the signal path; its fault escalates to a
//! kernel panic.

use super::{report, signal_for_vector, PageFaultCode, VECTOR_PAGE_FAULT};
use crate::{
    arch::{self, TrapFrame},
    process::{lifecycle, table::ProcessTable, ProcessId, Signal, PROCESS_TABLE},
    sched,
};

/// What the recovery ladder decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Fault repaired; resume the thread as if nothing happened
    Resumed,
    /// Unrecoverable for this process: deliver the signal
    Signaled(Signal),
    /// Critical process faulted: treat as a kernel crash
    Fatal,
}

/// The decision core, separated from frame plumbing so it is testable:
/// given the faulting process and fault facts, pick a resolution and
/// apply any memory repair.
pub fn resolve_user_fault(
    table: &mut ProcessTable,
    pid: ProcessId,
    vector: u64,
    error_code: u64,
    fault_addr: u64,
) -> Resolution {
    let critical = table
        .process(pid)
        .map(|p| p.security.critical)
        .unwrap_or(false);
    if critical {
        return Resolution::Fatal;
    }

    if vector == VECTOR_PAGE_FAULT {
        let code = PageFaultCode::from_bits_truncate(error_code);
        if code.contains(PageFaultCode::RESERVED) {
            return Resolution::Fatal;
        }
        if let Some(process) = table.process_mut(pid) {
            let memory = &mut process.memory;
            let mut frames = crate::mm::FRAME_ALLOCATOR.lock();

            // 1. Write to a read-only page of a COW area: duplicate.
            if code.contains(PageFaultCode::WRITE) {
                if let Ok(true) =
                    memory
                        .vmas
                        .resolve_cow_write(&memory.space, &mut frames, fault_addr)
                {
                    return Resolution::Resumed;
                }
            }

            // 2. Access just below the stack, within its growth limit.
            if let Ok(true) = memory.vmas.grow_stack(&memory.space, &mut frames, fault_addr) {
                return Resolution::Resumed;
            }
        }
    }

    Resolution::Signaled(signal_for_vector(vector))
}

/// Frame-level entry: apply the resolution to the real machine state.
pub fn handle_user_fault(frame: &mut TrapFrame) {
    let Some((pid, tid)) = sched::current() else {
        report::kernel_panic(frame, "user fault with no current thread");
    };
    let fault_addr = arch::fault_address();

    let resolution = {
        let mut table = PROCESS_TABLE.lock();
        // A critical *thread* escalates like a critical process.
        let critical_thread = table
            .thread(tid)
            .map(|t| t.critical)
            .unwrap_or(false);
        if critical_thread {
            Resolution::Fatal
        } else {
            resolve_user_fault(&mut table, pid, frame.vector, frame.error_code, fault_addr)
        }
    };

    match resolution {
        Resolution::Resumed => {}
        Resolution::Fatal => {
            report::kernel_panic(frame, "critical process faulted");
        }
        Resolution::Signaled(signal) => {
            log::warn!(
                target: "crash",
                "process {} gets {:?}: vector {} at {:#x}, fault address {:#x}",
                pid, signal, frame.vector, frame.rip, fault_addr
            );
            let mut table = PROCESS_TABLE.lock();
            // Core-dump state: the process dies with the signal encoded in
            // its exit code; no dump is written in this core.
            let _ = lifecycle::exit_process(&mut table, pid, signal.exit_code());
            drop(table);
            sched::reschedule(frame);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::process::{Compat, Security, PROCESS_TABLE};
    use crate::test_support;

    #[test]
    fn critical_process_fault_is_fatal() {
        test_support::ensure_boot();
        let mut table = PROCESS_TABLE.lock();
        let pid = table
            .create_process(None, "crit-fault", Security::user(0, 0), Compat::Native)
            .expect("process");
        table.set_critical(pid, true).expect("mark critical");

        // Null dereference in a critical process goes the kernel-panic
        // route, not the signal route.
        let resolution = resolve_user_fault(&mut table, pid, 14, 0b100, 0);
        assert_eq!(resolution, Resolution::Fatal);
        let _ = table.reap(pid);
    }

    #[test]
    fn reserved_bit_is_always_fatal() {
        test_support::ensure_boot();
        let mut table = PROCESS_TABLE.lock();
        let pid = table
            .create_process(None, "rsvd-fault", Security::user(1000, 1000), Compat::Native)
            .expect("process");
        let code = (PageFaultCode::RESERVED | PageFaultCode::USER).bits();
        assert_eq!(
            resolve_user_fault(&mut table, pid, 14, code, 0x4000_0000),
            Resolution::Fatal
        );
        let _ = table.reap(pid);
    }

    #[test]
    fn plain_bad_access_signals_segv() {
        test_support::ensure_boot();
        let mut table = PROCESS_TABLE.lock();
        let pid = table
            .create_process(None, "segv", Security::user(1000, 1000), Compat::Native)
            .expect("process");
        // Read of an unmapped address, no VMA anywhere near.
        assert_eq!(
            resolve_user_fault(&mut table, pid, 14, 0b100, 0x12345000),
            Resolution::Signaled(Signal::SIGSEGV)
        );
        // Invalid opcode.
        assert_eq!(
            resolve_user_fault(&mut table, pid, 6, 0, 0),
            Resolution::Signaled(Signal::SIGILL)
        );
        let _ = table.reap(pid);
    }

    #[test]
    fn cow_write_fault_resumes() {
        use crate::mm::vma::VmaFlags;
        test_support::ensure_boot();
        let mut table = PROCESS_TABLE.lock();
        let pid = table
            .create_process(None, "cow-fault", Security::user(1000, 1000), Compat::Native)
            .expect("process");
        {
            let process = table.process_mut(pid).expect("pcb");
            let memory = &mut process.memory;
            let mut frames = crate::mm::FRAME_ALLOCATOR.lock();
            memory
                .vmas
                .map_anon(
                    &memory.space,
                    &mut frames,
                    0x4100_0000,
                    crate::mm::PAGE_SIZE as u64,
                    VmaFlags::READ | VmaFlags::WRITE,
                )
                .expect("map");
            // Pretend a fork marked it COW.
            memory
                .vmas
                .replace_area(
                    0x4100_0000,
                    0x4100_0000 + crate::mm::PAGE_SIZE as u64,
                    VmaFlags::READ | VmaFlags::WRITE | VmaFlags::COW | VmaFlags::OWNED,
                    0x4100_0000,
                )
                .expect("cow mark");
        }
        let code = (PageFaultCode::PRESENT | PageFaultCode::WRITE | PageFaultCode::USER).bits();
        assert_eq!(
            resolve_user_fault(&mut table, pid, 14, code, 0x4100_0008),
            Resolution::Resumed
        );
        let _ = table.reap(pid);
    }

    #[test]
    fn stack_touch_below_grows() {
        use crate::mm::vma::VmaFlags;
        test_support::ensure_boot();
        let mut table = PROCESS_TABLE.lock();
        let pid = table
            .create_process(None, "stack-fault", Security::user(1000, 1000), Compat::Native)
            .expect("process");
        let top = 0x7FFF_F000_0000u64;
        {
            let process = table.process_mut(pid).expect("pcb");
            let memory = &mut process.memory;
            let mut frames = crate::mm::FRAME_ALLOCATOR.lock();
            memory
                .vmas
                .map_anon(
                    &memory.space,
                    &mut frames,
                    top,
                    crate::mm::PAGE_SIZE as u64,
                    VmaFlags::READ | VmaFlags::WRITE | VmaFlags::STACK,
                )
                .expect("stack area");
            memory
                .vmas
                .replace_area(
                    top,
                    top + crate::mm::PAGE_SIZE as u64,
                    VmaFlags::READ | VmaFlags::WRITE | VmaFlags::STACK | VmaFlags::OWNED,
                    top - 64 * crate::mm::PAGE_SIZE as u64,
                )
                .expect("growth limit");
        }
        // Push just below the mapped page.
        let fault = top - 8;
        let code = (PageFaultCode::WRITE | PageFaultCode::USER).bits();
        assert_eq!(
            resolve_user_fault(&mut table, pid, 14, code, fault),
            Resolution::Resumed
        );
        // Way below the limit: signal.
        let too_far = top - 100 * crate::mm::PAGE_SIZE as u64;
        assert_eq!(
            resolve_user_fault(&mut table, pid, 14, code, too_far),
            Resolution::Signaled(Signal::SIGSEGV)
        );
        let _ = table.reap(pid);
    }
}
