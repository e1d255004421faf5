//! fork()
//!
//! The child gets a copy-on-write image of the caller's user memory, a
//! shared-description copy of the fd table, a deep copy of the IPC table
//! (fresh buffers), and one thread cloned from the caller. The child
//! thread's frame is the caller's syscall frame with the return register
//! forced to 0; its first schedule resumes straight through the trap
//! gateway, never through the parent's kernel-stack syscall epilogue.

extern crate alloc;

use super::{table::ProcessTable, thread::Thread, ProcessId, TaskState};
use crate::{
    arch::TrapFrame,
    error::{KernelError, KernelResult, ProcessError},
    mm::FRAME_ALLOCATOR,
    sched,
};

/// Fork the current process. Returns the child pid (the parent's view);
/// the child observes 0 in the same register.
pub fn fork(table: &mut ProcessTable, frame: &TrapFrame) -> KernelResult<ProcessId> {
    let (parent_pid, caller_tid) = sched::current().ok_or(KernelError::Sched(
        crate::error::SchedError::NoCurrentThread,
    ))?;

    let (security, compat, name) = {
        let parent = table
            .process(parent_pid)
            .ok_or(ProcessError::NotFound { pid: parent_pid.0 })?;
        (parent.security, parent.compat, parent.name.clone())
    };

    let child_pid = table.create_process(Some(parent_pid), &name, security, compat)?;

    // Work on parent and child at once: the child PCB leaves the arena for
    // the duration.
    let mut child = table
        .remove_process(child_pid)
        .ok_or(ProcessError::NotFound { pid: child_pid.0 })?;

    let clone_result = {
        let parent = table
            .process_mut(parent_pid)
            .ok_or(ProcessError::NotFound { pid: parent_pid.0 })?;
        let mut frames = FRAME_ALLOCATOR.lock();
        let result = parent.memory.vmas.clone_for_fork(
            &parent.memory.space,
            &child.memory.space,
            &mut frames,
        );
        match result {
            Ok(child_vmas) => {
                child.memory.vmas = child_vmas;
                child.memory.brk = parent.memory.brk;
                child.memory.brk_base = parent.memory.brk_base;
                child.memory.next_stack_top = parent.memory.next_stack_top;
                child.fds = parent.fds.clone_for_fork();
                child.ipc = parent.ipc.clone_for_fork();
                child.cwd = parent.cwd.clone();
                Ok(())
            }
            Err(e) => Err(e),
        }
    };
    if let Err(e) = clone_result {
        // Unwind the half-made child.
        if let Some(parent) = table.process_mut(parent_pid) {
            parent.remove_child(child_pid);
        }
        table.insert_process(child);
        let _ = table.reap(child_pid);
        return Err(e.into());
    }
    table.insert_process(child);

    // One thread: the caller's clone. The frame is the live syscall frame
    // with rax forced to 0 so the child wakes up seeing a 0 return.
    let (user_stack, tls, priority) = {
        let caller = table
            .thread(caller_tid)
            .ok_or(ProcessError::ThreadNotFound { tid: caller_tid.0 })?;
        (caller.user_stack, caller.tls, caller.priority)
    };

    let mut child_frame = *frame;
    child_frame.set_return(0);

    let tid = table.mint_tid();
    let mut thread = match user_stack {
        Some(stack) => Thread::new_user(tid, child_pid, child_frame, stack, priority),
        None => {
            let mut t = Thread::new_kernel(tid, child_pid, child_frame.rip, priority);
            t.frame = child_frame;
            t
        }
    };
    thread.tls = tls;
    thread.state = TaskState::Ready;
    let tid = table.adopt_thread(thread)?;
    sched::spawn_ready(table, tid)?;

    log::debug!(target: "proc", "fork: {} -> {}", parent_pid, child_pid);
    Ok(child_pid)
}
