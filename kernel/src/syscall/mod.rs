//! System call dispatch
//!
//! Two front-ends share one dispatch pipeline: the native table and the
//! Linux-compatible table, selected by the calling process's compat mode.
//! Dispatch steps: read the number from the frame, look the entry up
//! (missing or empty slot is ENOSYS), check the caller's effective uid
//! against the entry's privilege floor (EPERM), extract the six argument
//! registers, invoke, and store the result back into the frame — unless
//! the handler suspended the caller, in which case the frame now belongs
//! to another thread and must not be touched.

pub mod linux;
pub mod native;
pub mod shared;

use crate::{
    arch::TrapFrame,
    error::Errno,
    process::{Compat, PROCESS_TABLE},
    sched,
};

/// What a handler did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Finished; the value goes into the frame's result register.
    Done(i64),
    /// The caller was suspended (sleep, wait, block) or replaced (exit):
    /// the live frame belongs to the next thread now.
    Scheduled,
}

impl Outcome {
    pub fn err(errno: Errno) -> Self {
        Outcome::Done(errno.as_ret())
    }
}

/// Shorthand for fallible handlers.
pub fn done(result: crate::error::KernelResult<i64>) -> Outcome {
    match result {
        Ok(value) => Outcome::Done(value),
        Err(e) => Outcome::Done(crate::error::errno_ret(e)),
    }
}

/// Handler signature: the live frame plus the six extracted arguments.
pub type Handler = fn(&mut TrapFrame, [u64; 6]) -> Outcome;

/// Any caller may use the entry.
pub const PRIV_ANY: u32 = u32::MAX;
/// Root only.
pub const PRIV_ROOT: u32 = 0;

/// One slot of a syscall table.
#[derive(Clone, Copy)]
pub struct SyscallEntry {
    pub name: &'static str,
    pub handler: Option<Handler>,
    pub min_privilege: u32,
}

impl SyscallEntry {
    pub const fn new(name: &'static str, handler: Handler, min_privilege: u32) -> Self {
        Self {
            name,
            handler: Some(handler),
            min_privilege,
        }
    }

    pub const fn reserved(name: &'static str) -> Self {
        Self {
            name,
            handler: None,
            min_privilege: PRIV_ROOT,
        }
    }

    pub const fn empty() -> Self {
        Self {
            name: "",
            handler: None,
            min_privilege: PRIV_ANY,
        }
    }
}

/// Entry from the trap gateway.
pub fn dispatch(frame: &mut TrapFrame) {
    let nr = frame.syscall_number() as usize;

    let (compat, uid) = {
        let table = PROCESS_TABLE.lock();
        match sched::current() {
            Some((pid, _)) => table
                .process(pid)
                .map(|p| (p.compat, p.security.uid))
                .unwrap_or((Compat::Native, 0)),
            None => (Compat::Native, 0),
        }
    };

    let entry = match compat {
        Compat::Native => native::lookup(nr),
        Compat::Linux => linux::lookup(nr),
    };

    let Some(entry) = entry else {
        frame.set_return(Errno::ENOSYS.as_ret());
        return;
    };
    let Some(handler) = entry.handler else {
        frame.set_return(Errno::ENOSYS.as_ret());
        return;
    };
    if uid > entry.min_privilege {
        log::debug!(target: "syscall", "{}: uid {} below privilege floor", entry.name, uid);
        frame.set_return(Errno::EPERM.as_ret());
        return;
    }

    let args = frame.syscall_args();
    log::trace!(target: "syscall", "{}({:#x}, {:#x}, ...)", entry.name, args[0], args[1]);
    match handler(frame, args) {
        Outcome::Done(value) => frame.set_return(value),
        Outcome::Scheduled => {}
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn out_of_range_native_syscall_is_enosys() {
        let _guard = test_support::lock_scheduling();
        let (pid, _tid) = test_support::spawn_user_process("enosys");

        // Native syscall number MaxSyscall + 1: exactly -38, no other
        // effect on the frame's argument registers.
        let mut frame = TrapFrame::zeroed();
        frame.cs = 3; // ring 3 caller
        frame.rax = native::MAX_SYSCALL as u64 + 1;
        frame.rdi = 0xDEAD;
        dispatch(&mut frame);
        assert_eq!(frame.rax as i64, -38);
        assert_eq!(frame.rdi, 0xDEAD);

        test_support::destroy_process(pid);
    }

    #[test]
    fn reserved_entries_report_enosys() {
        let _guard = test_support::lock_scheduling();
        let (pid, _tid) = test_support::spawn_user_process("reserved");

        let mut frame = TrapFrame::zeroed();
        frame.rax = native::NR_RESERVED_CREATE_THREAD as u64;
        dispatch(&mut frame);
        assert_eq!(frame.rax as i64, -38);

        test_support::destroy_process(pid);
    }

    #[test]
    fn privileged_entry_rejects_plain_users() {
        let _guard = test_support::lock_scheduling();
        let (pid, _tid) = test_support::spawn_user_process("eperm");

        // memory_map is root-only; the test process runs as uid 1000.
        let mut frame = TrapFrame::zeroed();
        frame.rax = native::NR_MEMORY_MAP as u64;
        dispatch(&mut frame);
        assert_eq!(frame.rax as i64, -(Errno::EPERM as i32 as i64));

        test_support::destroy_process(pid);
    }
}
