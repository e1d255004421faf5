//! Process control block

extern crate alloc;

use alloc::{string::String, vec::Vec};

use super::{Compat, ProcessId, Security, TaskState, ThreadId};
use crate::{
    fs::FdTable,
    ipc::IpcTable,
    mm::{page_table::AddressSpace, vma::VmaSet},
};

/// A process's memory picture: its page-table root, VMA set, program break
/// and the cursor for placing new thread stacks.
pub struct ProcessMemory {
    pub space: AddressSpace,
    pub vmas: VmaSet,
    /// Program break for brk(2); 0 until first queried
    pub brk: u64,
    pub brk_base: u64,
    /// Top for the next thread stack, walks downward per thread
    pub next_stack_top: u64,
}

impl ProcessMemory {
    pub fn new(space: AddressSpace) -> Self {
        Self {
            space,
            vmas: VmaSet::new(),
            brk: super::thread::USER_STACK_TOP / 2,
            brk_base: super::thread::USER_STACK_TOP / 2,
            next_stack_top: super::thread::USER_STACK_TOP,
        }
    }
}

/// Process control block. Lives in the table arena, addressed by
/// `ProcessId`; children and threads are id lists, never pointers.
pub struct Process {
    pub pid: ProcessId,
    pub parent: Option<ProcessId>,
    pub name: String,
    pub state: TaskState,
    pub security: Security,
    pub compat: Compat,
    pub memory: ProcessMemory,
    pub fds: FdTable,
    pub ipc: IpcTable,
    pub children: Vec<ProcessId>,
    pub threads: Vec<ThreadId>,
    pub exit_code: i32,
    pub cwd: String,
}

impl Process {
    pub fn new(
        pid: ProcessId,
        parent: Option<ProcessId>,
        name: String,
        security: Security,
        compat: Compat,
        memory: ProcessMemory,
    ) -> Self {
        Self {
            pid,
            parent,
            name,
            state: TaskState::Ready,
            security,
            compat,
            memory,
            fds: FdTable::new(),
            ipc: IpcTable::new(),
            children: Vec::new(),
            threads: Vec::new(),
            exit_code: 0,
            cwd: String::from("/"),
        }
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.state, TaskState::Zombie | TaskState::Terminated)
    }

    pub fn remove_child(&mut self, pid: ProcessId) {
        self.children.retain(|&c| c != pid);
    }

    pub fn remove_thread(&mut self, tid: ThreadId) {
        self.threads.retain(|&t| t != tid);
    }
}
