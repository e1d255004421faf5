//! Thread and process exit
//!
//! A thread exit marks the TCB Terminated and drops it from the queues.
//! When the last live thread goes, the process becomes a Zombie: children
//! are re-parented, waiting parents are completed, and the resources stay
//! allocated until a reap (see `wait`).

extern crate alloc;

use super::{table::ProcessTable, thread::WaitTarget, ProcessId, TaskState, ThreadId};
use crate::{
    error::{KernelResult, ProcessError},
    mm::{user, VirtualAddress},
    sched,
};

/// Exit status encoding shared by wait/wait4: exited-normally with the
/// low byte of the code in bits 8..16.
pub fn encode_exit_status(code: i32) -> i32 {
    (code & 0xFF) << 8
}

/// Terminate one thread. When it was the last live thread of its process,
/// the process transitions to Zombie.
pub fn exit_thread(table: &mut ProcessTable, tid: ThreadId, code: i32) -> KernelResult<()> {
    let pid = {
        let thread = table
            .thread_mut(tid)
            .ok_or(ProcessError::ThreadNotFound { tid: tid.0 })?;
        thread.state = TaskState::Terminated;
        thread.exit_code = code;

        // Linux set_tid_address contract: zero the registered word.
        let clear_addr = thread.clear_child_tid;
        let pid = thread.process;
        if clear_addr != 0 {
            if let Some(process) = table.process(pid) {
                let _ = user::copy_to_user(
                    &process.memory.space,
                    VirtualAddress::new(clear_addr),
                    &0u32.to_le_bytes(),
                );
            }
        }
        pid
    };
    sched::dequeue(tid);

    let all_done = table
        .process(pid)
        .map(|p| {
            p.threads
                .iter()
                .all(|&t| table.thread(t).map(|th| th.state == TaskState::Terminated) != Some(false))
        })
        .unwrap_or(false);
    if all_done {
        exit_process(table, pid, code)?;
    }
    Ok(())
}

/// Terminate a whole process: every thread, then the Zombie transition.
pub fn exit_process(table: &mut ProcessTable, pid: ProcessId, code: i32) -> KernelResult<()> {
    let tids: alloc::vec::Vec<ThreadId> = table
        .process(pid)
        .ok_or(ProcessError::NotFound { pid: pid.0 })?
        .threads
        .clone();
    for tid in tids {
        if let Some(thread) = table.thread_mut(tid) {
            thread.state = TaskState::Terminated;
        }
        sched::dequeue(tid);
    }

    let parent = {
        let process = table
            .process_mut(pid)
            .ok_or(ProcessError::NotFound { pid: pid.0 })?;
        if process.state == TaskState::Zombie || process.state == TaskState::Terminated {
            return Ok(());
        }
        process.state = TaskState::Zombie;
        process.exit_code = code;
        process.parent
    };

    reparent_children(table, pid);
    log::debug!(target: "proc", "process {} is a zombie (code {})", pid, code);

    if let Some(parent_pid) = parent {
        complete_parent_wait(table, parent_pid, pid);
    }
    Ok(())
}

/// Move the dying process's children under init (pid 1) when it exists,
/// otherwise under the kernel process.
fn reparent_children(table: &mut ProcessTable, pid: ProcessId) {
    let children: alloc::vec::Vec<ProcessId> = table
        .process(pid)
        .map(|p| p.children.clone())
        .unwrap_or_default();
    if children.is_empty() {
        return;
    }
    let foster = if table.process(ProcessId(1)).is_some() && pid != ProcessId(1) {
        ProcessId(1)
    } else {
        super::KERNEL_PID
    };
    for child in &children {
        if let Some(child_proc) = table.process_mut(*child) {
            child_proc.parent = Some(foster);
        }
        if let Some(foster_proc) = table.process_mut(foster) {
            foster_proc.children.push(*child);
        }
    }
    if let Some(process) = table.process_mut(pid) {
        process.children.clear();
    }
}

/// Wake a parent thread blocked in wait() on this child (or on any
/// child): deliver the status, the pid return value, and reap.
fn complete_parent_wait(table: &mut ProcessTable, parent_pid: ProcessId, child_pid: ProcessId) {
    let waiter: Option<ThreadId> = {
        let Some(parent) = table.process(parent_pid) else {
            return;
        };
        parent.threads.iter().copied().find(|&t| {
            table
                .thread(t)
                .map(|th| {
                    if th.state != TaskState::Waiting {
                        return false;
                    }
                    match th.waiting_for {
                        WaitTarget::Child { pid: None, .. } => true,
                        WaitTarget::Child { pid: Some(p), .. } => p == child_pid,
                        _ => false,
                    }
                })
                .unwrap_or(false)
        })
    };
    let Some(waiter_tid) = waiter else {
        return;
    };

    let status_out = match table.thread(waiter_tid).map(|t| t.waiting_for) {
        Some(WaitTarget::Child { status_out, .. }) => status_out,
        _ => return,
    };

    let exit_code = table.process(child_pid).map(|p| p.exit_code).unwrap_or(0);
    if status_out != 0 {
        if let Some(parent) = table.process(parent_pid) {
            let status = encode_exit_status(exit_code);
            let _ = user::copy_to_user(
                &parent.memory.space,
                VirtualAddress::new(status_out),
                &status.to_le_bytes(),
            );
        }
    }

    // The waiter's stored frame gets the child pid as its return value.
    if let Some(thread) = table.thread_mut(waiter_tid) {
        thread.frame.set_return(child_pid.0 as i64);
    }

    // Reap: child resources go away, the parent forgets the child.
    let _ = table.reap(child_pid);
    if let Some(parent) = table.process_mut(parent_pid) {
        parent.remove_child(child_pid);
    }
    sched::wake_locked(table, waiter_tid);
}
