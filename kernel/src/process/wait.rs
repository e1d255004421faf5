//! wait() / wait4()
//!
//! Blocks the caller until the named child (or any child) turns Zombie,
//! delivers the encoded exit status into the caller's address space,
//! transitions the child to Terminated and reclaims it. The blocking half
//! lives here; completion for the blocked case is driven by the exiting
//! child (`lifecycle::complete_parent_wait`).

use super::{
    lifecycle::encode_exit_status, table::ProcessTable, thread::WaitTarget, ProcessId, TaskState,
};
use crate::{
    error::{KernelResult, ProcessError},
    mm::{user, VirtualAddress},
    sched,
};

/// Outcome of a wait attempt: either a reaped child right away, or the
/// caller went to sleep and the syscall result will be written at wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Reaped(ProcessId),
    Blocked,
}

/// The core of wait(): `pid <= 0` waits for any child.
pub fn wait(
    table: &mut ProcessTable,
    pid_arg: i64,
    status_out: u64,
    _options: u64,
) -> KernelResult<WaitOutcome> {
    let (caller_pid, caller_tid) = sched::current().ok_or(crate::error::KernelError::Sched(
        crate::error::SchedError::NoCurrentThread,
    ))?;

    let target: Option<ProcessId> = if pid_arg > 0 {
        Some(ProcessId(pid_arg as u32))
    } else {
        None
    };

    // The named pid must actually be a child of the caller.
    let children = table
        .process(caller_pid)
        .ok_or(ProcessError::NotFound { pid: caller_pid.0 })?
        .children
        .clone();
    if children.is_empty() {
        return Err(ProcessError::NoChildren.into());
    }
    if let Some(t) = target {
        if !children.contains(&t) {
            return Err(ProcessError::NotAChild { pid: t.0 }.into());
        }
    }

    // Immediate path: a matching Zombie exists.
    let zombie = children.iter().copied().find(|&c| {
        (target.is_none() || target == Some(c))
            && table.process(c).map(|p| p.state == TaskState::Zombie) == Some(true)
    });
    if let Some(child_pid) = zombie {
        let exit_code = table.process(child_pid).map(|p| p.exit_code).unwrap_or(0);
        if status_out != 0 {
            let caller = table
                .process(caller_pid)
                .ok_or(ProcessError::NotFound { pid: caller_pid.0 })?;
            let status = encode_exit_status(exit_code);
            user::copy_to_user(
                &caller.memory.space,
                VirtualAddress::new(status_out),
                &status.to_le_bytes(),
            )?;
        }
        table.reap(child_pid)?;
        if let Some(caller) = table.process_mut(caller_pid) {
            caller.remove_child(child_pid);
        }
        return Ok(WaitOutcome::Reaped(child_pid));
    }

    // Blocking path: park the caller; the exiting child completes it.
    if let Some(thread) = table.thread_mut(caller_tid) {
        thread.state = TaskState::Waiting;
        thread.waiting_for = WaitTarget::Child {
            pid: target,
            status_out,
        };
    }
    Ok(WaitOutcome::Blocked)
}
