//! Process/thread arenas
//!
//! One table owns every PCB and TCB. All lookups go through typed ids;
//! the table's lock is the "process-state" lock of the locking order
//! (frame < page-table < VMA < process-state < scheduler).

extern crate alloc;

use alloc::{string::String, sync::Arc, vec::Vec};
use alloc::collections::BTreeMap;

use spin::Mutex;

use super::{
    pcb::{Process, ProcessMemory},
    thread::{self, Thread, UserStack},
    Compat, Priority, ProcessId, Security, TaskState, ThreadId, KERNEL_PID, MAX_PROCESSES,
    MAX_THREADS,
};
use crate::{
    arch::TrapFrame,
    error::{KernelError, KernelResult, ProcessError},
    fs::{self, FileDescription, OpenFlags},
    mm::{
        layout, page_table::AddressSpace, user, vma::VmaFlags, VirtualAddress, FRAME_ALLOCATOR,
        PAGE_SIZE,
    },
};

/// Thread-count snapshot for the bookkeeping invariant: every allocated,
/// unreaped TCB is in exactly one state bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadCounts {
    pub ready: u64,
    pub running: u64,
    pub sleeping: u64,
    pub blocked: u64,
    pub stopped: u64,
    pub waiting: u64,
    pub zombie: u64,
    pub terminated: u64,
    pub allocated: u64,
    pub reaped: u64,
}

pub struct ProcessTable {
    procs: BTreeMap<ProcessId, Process>,
    threads: BTreeMap<ThreadId, Thread>,
    next_pid: u32,
    next_tid: u32,
    threads_allocated: u64,
    threads_reaped: u64,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            threads: BTreeMap::new(),
            next_pid: 0,
            next_tid: 1,
            threads_allocated: 0,
            threads_reaped: 0,
        }
    }

    fn alloc_pid(&mut self) -> ProcessId {
        let pid = ProcessId(self.next_pid);
        self.next_pid += 1;
        pid
    }

    fn alloc_tid(&mut self) -> ThreadId {
        let tid = ThreadId(self.next_tid);
        self.next_tid += 1;
        tid
    }

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        self.procs.get(&pid)
    }

    /// Pull a PCB out of the arena (fork borrows the child this way to
    /// work on parent and child simultaneously).
    pub fn remove_process(&mut self, pid: ProcessId) -> Option<Process> {
        self.procs.remove(&pid)
    }

    pub fn insert_process(&mut self, process: Process) {
        self.procs.insert(process.pid, process);
    }

    pub fn process_mut(&mut self, pid: ProcessId) -> Option<&mut Process> {
        self.procs.get_mut(&pid)
    }

    pub fn thread(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(&tid)
    }

    pub fn process_count(&self) -> usize {
        self.procs.len()
    }

    pub fn pids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.procs.keys().copied()
    }

    pub fn tids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.threads.keys().copied()
    }

    /// The kernel's own process, created once during bring-up. Its address
    /// space is the kernel space itself.
    pub fn init_kernel_process(&mut self) -> KernelResult<ProcessId> {
        if self.procs.contains_key(&KERNEL_PID) {
            return Ok(KERNEL_PID);
        }
        let kernel = layout::kernel_space().ok_or(KernelError::NotInitialized {
            subsystem: "kernel address space",
        })?;
        let pid = self.alloc_pid();
        debug_assert_eq!(pid, KERNEL_PID);
        let memory = ProcessMemory::new(AddressSpace::from_root(kernel.root()));
        let process = Process::new(
            pid,
            None,
            String::from("kernel"),
            Security::kernel(),
            Compat::Native,
            memory,
        );
        self.procs.insert(pid, process);
        Ok(pid)
    }

    /// Create a process: fresh page table aliasing the kernel half, empty
    /// VMA set, stdio wired from the parent (or the console), empty IPC
    /// table.
    pub fn create_process(
        &mut self,
        parent: Option<ProcessId>,
        name: &str,
        security: Security,
        compat: Compat,
    ) -> KernelResult<ProcessId> {
        if self.procs.len() >= MAX_PROCESSES {
            return Err(ProcessError::TooManyProcesses.into());
        }
        let kernel = layout::kernel_space().ok_or(KernelError::NotInitialized {
            subsystem: "kernel address space",
        })?;
        let space = {
            let mut frames = FRAME_ALLOCATOR.lock();
            AddressSpace::new_user(kernel, &mut frames)?
        };
        let pid = self.alloc_pid();
        let mut process = Process::new(
            pid,
            parent,
            String::from(name),
            security,
            compat,
            ProcessMemory::new(space),
        );

        // Standard streams: inherit the parent's, or open the console.
        match parent.and_then(|p| self.procs.get(&p)) {
            Some(parent_proc) => {
                for fd in 0..3 {
                    if let Ok(desc) = parent_proc.fds.get(fd) {
                        let _ = process.fds.install(fd, desc);
                    }
                }
            }
            None => {
                if let Ok(vfs) = fs::vfs() {
                    if let Ok(vnode) =
                        (vfs.open)("/dev/console", OpenFlags::READ | OpenFlags::WRITE, 0)
                    {
                        let console =
                            Arc::new(FileDescription::new(vnode, OpenFlags::READ | OpenFlags::WRITE, 0));
                        for fd in 0..3 {
                            let _ = process.fds.install(fd, console.clone());
                        }
                    }
                }
            }
        }

        if let Some(parent_pid) = parent {
            if let Some(parent_proc) = self.procs.get_mut(&parent_pid) {
                parent_proc.children.push(pid);
            }
        }
        self.procs.insert(pid, process);
        log::debug!(target: "proc", "created process {} ({})", pid, name);
        Ok(pid)
    }

    /// Register an already-built thread (fork uses this).
    pub fn adopt_thread(&mut self, thread: Thread) -> KernelResult<ThreadId> {
        if self.threads.len() >= MAX_THREADS {
            return Err(ProcessError::TooManyThreads.into());
        }
        let tid = thread.tid;
        let pid = thread.process;
        self.threads.insert(tid, thread);
        if let Some(process) = self.procs.get_mut(&pid) {
            process.threads.push(tid);
        }
        self.threads_allocated += 1;
        Ok(tid)
    }

    /// Mint a fresh tid for a thread under construction.
    pub fn mint_tid(&mut self) -> ThreadId {
        self.alloc_tid()
    }

    /// Kernel thread in an existing process.
    pub fn create_kernel_thread(
        &mut self,
        pid: ProcessId,
        entry: u64,
        priority: Priority,
    ) -> KernelResult<ThreadId> {
        if self.procs.get(&pid).is_none() {
            return Err(ProcessError::NotFound { pid: pid.0 }.into());
        }
        let tid = self.alloc_tid();
        let thread = Thread::new_kernel(tid, pid, entry, priority);
        self.adopt_thread(thread)
    }

    /// User thread: carve a stack area, lay out argv/envp/auxv, fabricate
    /// the entry frame, register Ready.
    pub fn create_user_thread(
        &mut self,
        pid: ProcessId,
        entry: u64,
        argv: &[&str],
        envp: &[&str],
        auxv: &[(u64, u64)],
        priority: Priority,
    ) -> KernelResult<ThreadId> {
        if self.threads.len() >= MAX_THREADS {
            return Err(ProcessError::TooManyThreads.into());
        }
        let process = self
            .procs
            .get_mut(&pid)
            .ok_or(ProcessError::NotFound { pid: pid.0 })?;

        let stack_top = process.memory.next_stack_top;
        process.memory.next_stack_top -= thread::USER_STACK_STRIDE;
        let limit = stack_top - thread::USER_STACK_LIMIT;

        // Eagerly map the top pages; deeper use faults and grows.
        const INITIAL_STACK_PAGES: u64 = 4;
        let mapped_base = stack_top - INITIAL_STACK_PAGES * PAGE_SIZE as u64;
        {
            let mut frames = FRAME_ALLOCATOR.lock();
            process.memory.vmas.map_anon(
                &process.memory.space,
                &mut frames,
                mapped_base,
                INITIAL_STACK_PAGES * PAGE_SIZE as u64,
                VmaFlags::READ | VmaFlags::WRITE | VmaFlags::STACK,
            )?;
            // The stack area's growth floor is the thread's limit.
            if let Some(vma) = process.memory.vmas.find(mapped_base) {
                debug_assert!(vma.flags.contains(VmaFlags::STACK));
            }
        }
        // Fix the growth limit on the freshly inserted area.
        set_stack_limit(&mut process.memory, mapped_base, limit);

        let rsp = build_initial_stack(&process.memory.space, stack_top, argv, envp, auxv)?;

        let frame = TrapFrame::new_user(entry, rsp);
        let user_stack = UserStack {
            top: stack_top,
            low_mark: mapped_base,
            limit,
        };
        let tid = self.alloc_tid();
        let thread = Thread::new_user(tid, pid, frame, user_stack, priority);
        self.adopt_thread(thread)
    }

    /// Kernel-authoritative critical marking (the only setter).
    pub fn set_critical(&mut self, pid: ProcessId, critical: bool) -> KernelResult<()> {
        let process = self
            .procs
            .get_mut(&pid)
            .ok_or(ProcessError::NotFound { pid: pid.0 })?;
        process.security.critical = critical;
        Ok(())
    }

    /// State census for the bookkeeping invariant.
    pub fn thread_counts(&self) -> ThreadCounts {
        let mut counts = ThreadCounts {
            allocated: self.threads_allocated,
            reaped: self.threads_reaped,
            ..Default::default()
        };
        for thread in self.threads.values() {
            match thread.state {
                TaskState::Ready => counts.ready += 1,
                TaskState::Running => counts.running += 1,
                TaskState::Sleeping => counts.sleeping += 1,
                TaskState::Blocked => counts.blocked += 1,
                TaskState::Stopped => counts.stopped += 1,
                TaskState::Waiting => counts.waiting += 1,
                TaskState::Zombie => counts.zombie += 1,
                TaskState::Terminated => counts.terminated += 1,
            }
        }
        counts
    }

    /// Tear a reaped process down. Order matters: threads, FDs, IPC, VMAs,
    /// page table, PCB slot.
    pub fn reap(&mut self, pid: ProcessId) -> KernelResult<i32> {
        let mut process = self
            .procs
            .remove(&pid)
            .ok_or(ProcessError::NotFound { pid: pid.0 })?;
        let exit_code = process.exit_code;

        // 1. Threads: kernel stacks and FPU blocks go with the TCBs.
        for tid in core::mem::take(&mut process.threads) {
            if self.threads.remove(&tid).is_some() {
                self.threads_reaped += 1;
            }
        }
        // 2. File descriptors (vnode references drop with the table).
        process.fds = crate::fs::FdTable::new();
        // 3. IPC channels.
        process.ipc = crate::ipc::IpcTable::new();
        // 4. VMAs release their frames, 5. the page table follows.
        {
            let mut frames = FRAME_ALLOCATOR.lock();
            let memory = &mut process.memory;
            memory.vmas.clear(&memory.space, &mut frames);
            if pid != KERNEL_PID {
                let space = core::mem::replace(
                    &mut memory.space,
                    AddressSpace::from_root(crate::mm::FrameNumber::new(0)),
                );
                space.free_tables(&mut frames);
            }
        }
        // 6. The PCB slot itself (dropped here).
        process.state = TaskState::Terminated;
        log::debug!(target: "proc", "reaped process {}", pid);
        Ok(exit_code)
    }
}

/// Adjust the growth floor of the stack area starting at `base`.
fn set_stack_limit(memory: &mut ProcessMemory, base: u64, limit: u64) {
    // VmaSet has no in-place mutator for growth_limit by design; rebuild
    // the area entry through split/insert instead. The area was inserted a
    // moment ago and spans exactly [base, top).
    let Some(vma) = memory.vmas.find(base).copied() else {
        return;
    };
    let mut flags = vma.flags;
    flags |= VmaFlags::STACK;
    let _ = memory.vmas.replace_area(vma.start, vma.end, flags, limit);
}

/// SysV-style initial stack: strings at the top, then the auxv, envp and
/// argv vectors, then argc at the final 16-byte-aligned stack pointer.
/// Shared with the exec path, which rebuilds a stack in-place.
pub(crate) fn build_initial_stack(
    space: &AddressSpace,
    stack_top: u64,
    argv: &[&str],
    envp: &[&str],
    auxv: &[(u64, u64)],
) -> KernelResult<u64> {
    let mut cursor = stack_top;
    let mut argv_ptrs: Vec<u64> = Vec::with_capacity(argv.len());
    let mut envp_ptrs: Vec<u64> = Vec::with_capacity(envp.len());

    for arg in argv {
        cursor -= arg.len() as u64 + 1;
        user::copy_to_user(space, VirtualAddress::new(cursor), arg.as_bytes())?;
        user::copy_to_user(
            space,
            VirtualAddress::new(cursor + arg.len() as u64),
            &[0],
        )?;
        argv_ptrs.push(cursor);
    }
    for env in envp {
        cursor -= env.len() as u64 + 1;
        user::copy_to_user(space, VirtualAddress::new(cursor), env.as_bytes())?;
        user::copy_to_user(
            space,
            VirtualAddress::new(cursor + env.len() as u64),
            &[0],
        )?;
        envp_ptrs.push(cursor);
    }

    // Vector block: argc, argv..., 0, envp..., 0, auxv pairs, AT_NULL pair.
    let mut words: Vec<u64> = Vec::new();
    words.push(argv.len() as u64);
    words.extend_from_slice(&argv_ptrs);
    words.push(0);
    words.extend_from_slice(&envp_ptrs);
    words.push(0);
    for &(key, value) in auxv {
        words.push(key);
        words.push(value);
    }
    words.push(0); // AT_NULL
    words.push(0);

    let block = words.len() as u64 * 8;
    cursor = (cursor - block) & !0xF;

    let mut bytes: Vec<u8> = Vec::with_capacity(block as usize);
    for word in &words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    user::copy_to_user(space, VirtualAddress::new(cursor), &bytes)?;

    Ok(cursor)
}

/// The one table instance.
pub static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
