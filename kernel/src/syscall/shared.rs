//! Shared syscall implementations
//!
//! The helpers both front-ends call through: file I/O, memory mapping,
//! fork/execve/exit/wait. The Linux table translates its flag constants
//! before landing here; the native table passes native values straight
//! through.

extern crate alloc;

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use super::Outcome;
use crate::{
    arch::TrapFrame,
    elf,
    error::{Errno, KernelError, KernelResult, MemoryError, SchedError, SyscallError},
    fs::{self, FileDescription, OpenFlags, Whence},
    mm::{
        user::{self, MAX_ARG, PATH_MAX},
        vma::VmaFlags,
        VirtualAddress, FRAME_ALLOCATOR, PAGE_SIZE,
    },
    process::{
        fork as fork_impl, lifecycle,
        table::{build_initial_stack, ProcessTable},
        thread::{UserStack, USER_STACK_LIMIT, USER_STACK_TOP},
        wait::{self, WaitOutcome},
        ProcessId, TaskState, ThreadId, PROCESS_TABLE,
    },
    sched,
};

/// Area search base for non-fixed mmap.
const MMAP_BASE: u64 = 0x6000_0000;
/// Bounce buffer for user<->vnode transfers.
const CHUNK: usize = 1024;
/// Cap on argv/envp vector lengths.
const MAX_ARGS: usize = 64;
/// Shebang recursion bound.
const MAX_SHEBANG_DEPTH: usize = 4;
/// Longest accepted `#!` line.
const SHEBANG_MAX: usize = 255;

fn current_ids() -> KernelResult<(ProcessId, ThreadId)> {
    sched::current().ok_or(KernelError::Sched(SchedError::NoCurrentThread))
}

/// Copy a user string (path, argument) out of the current process.
fn user_string(
    table: &ProcessTable,
    pid: ProcessId,
    ptr: u64,
    cap: usize,
) -> KernelResult<String> {
    let process = table
        .process(pid)
        .ok_or(KernelError::Process(crate::error::ProcessError::NotFound { pid: pid.0 }))?;
    let mut buf = vec![0u8; cap];
    let len = user::copy_string_from_user(
        &process.memory.space,
        VirtualAddress::new(ptr),
        &mut buf,
        cap,
    )?;
    core::str::from_utf8(&buf[..len])
        .map(String::from)
        .map_err(|_| KernelError::Syscall(SyscallError::InvalidArgument))
}

/// Read a NULL-terminated array of user pointers (argv/envp shape).
fn user_ptr_vec(table: &ProcessTable, pid: ProcessId, ptr: u64) -> KernelResult<Vec<u64>> {
    if ptr == 0 {
        return Ok(Vec::new());
    }
    let process = table
        .process(pid)
        .ok_or(KernelError::Process(crate::error::ProcessError::NotFound { pid: pid.0 }))?;
    let mut out = Vec::new();
    for i in 0..MAX_ARGS as u64 {
        let mut word = [0u8; 8];
        user::copy_from_user(
            &process.memory.space,
            VirtualAddress::new(ptr + i * 8),
            &mut word,
        )?;
        let value = u64::from_le_bytes(word);
        if value == 0 {
            return Ok(out);
        }
        out.push(value);
    }
    Err(KernelError::Syscall(SyscallError::StringTooLong { max: MAX_ARGS }))
}

// ---------------------------------------------------------------------------
// files
// ---------------------------------------------------------------------------

pub fn sys_open(path_ptr: u64, flags: OpenFlags, mode: u32) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let mut table = PROCESS_TABLE.lock();
    let path = user_string(&table, pid, path_ptr, PATH_MAX)?;
    let vfs = fs::vfs()?;

    let process = table
        .process_mut(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let abs = fs::resolve_path(&process.cwd, &path);
    let vnode = (vfs.open)(&abs, flags, mode)?;
    let desc = Arc::new(FileDescription::new(vnode, flags, mode));
    if flags.contains(OpenFlags::APPEND) {
        *desc.offset.lock() = (vfs.size)(vnode).unwrap_or(0);
    }
    let fd = process.fds.allocate(desc)?;
    Ok(fd as i64)
}

pub fn sys_close(fd: u64) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let mut table = PROCESS_TABLE.lock();
    let process = table
        .process_mut(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    process.fds.close(fd as usize)?;
    Ok(0)
}

pub fn sys_read(fd: u64, buf: u64, count: u64) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let table = PROCESS_TABLE.lock();
    let process = table
        .process(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let desc = process.fds.get(fd as usize)?;
    let vfs = fs::vfs()?;

    let mut chunk = [0u8; CHUNK];
    let mut done = 0u64;
    let mut offset = desc.offset.lock();
    while done < count {
        let want = ((count - done) as usize).min(CHUNK);
        let got = (vfs.read)(desc.vnode, *offset, &mut chunk[..want])?;
        if got == 0 {
            break;
        }
        user::copy_to_user(
            &process.memory.space,
            VirtualAddress::new(buf + done),
            &chunk[..got],
        )?;
        *offset += got as u64;
        done += got as u64;
        if got < want {
            break;
        }
    }
    Ok(done as i64)
}

pub fn sys_write(fd: u64, buf: u64, count: u64) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let table = PROCESS_TABLE.lock();
    let process = table
        .process(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let desc = process.fds.get(fd as usize)?;
    let vfs = fs::vfs()?;

    let mut chunk = [0u8; CHUNK];
    let mut done = 0u64;
    let mut offset = desc.offset.lock();
    while done < count {
        let want = ((count - done) as usize).min(CHUNK);
        user::copy_from_user(
            &process.memory.space,
            VirtualAddress::new(buf + done),
            &mut chunk[..want],
        )?;
        let put = (vfs.write)(desc.vnode, *offset, &chunk[..want])?;
        *offset += put as u64;
        done += put as u64;
        if put < want {
            break;
        }
    }
    Ok(done as i64)
}

pub fn sys_lseek(fd: u64, offset: i64, whence: Whence) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let table = PROCESS_TABLE.lock();
    let process = table
        .process(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let desc = process.fds.get(fd as usize)?;

    let mut cursor = desc.offset.lock();
    let base = match whence {
        Whence::Set => 0i64,
        Whence::Current => *cursor as i64,
        Whence::End => {
            let vfs = fs::vfs()?;
            (vfs.size)(desc.vnode)? as i64
        }
    };
    let target = base
        .checked_add(offset)
        .ok_or(KernelError::Syscall(SyscallError::InvalidArgument))?;
    if target < 0 {
        return Err(KernelError::Syscall(SyscallError::InvalidArgument));
    }
    *cursor = target as u64;
    Ok(target)
}

fn stat_bytes(stat: &fs::Stat) -> &[u8] {
    // SAFETY: Stat is repr(C) plain data; its bytes are the wire format.
    unsafe {
        core::slice::from_raw_parts(
            stat as *const fs::Stat as *const u8,
            core::mem::size_of::<fs::Stat>(),
        )
    }
}

pub fn sys_fstat(fd: u64, stat_out: u64) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let table = PROCESS_TABLE.lock();
    let process = table
        .process(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let desc = process.fds.get(fd as usize)?;
    let vfs = fs::vfs()?;
    let stat = (vfs.fstat)(desc.vnode)?;
    user::copy_to_user(
        &process.memory.space,
        VirtualAddress::new(stat_out),
        stat_bytes(&stat),
    )?;
    Ok(0)
}

pub fn sys_stat_path(path_ptr: u64, stat_out: u64, follow: bool) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let table = PROCESS_TABLE.lock();
    let path = user_string(&table, pid, path_ptr, PATH_MAX)?;
    let process = table
        .process(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let abs = fs::resolve_path(&process.cwd, &path);
    let vfs = fs::vfs()?;
    let stat = (vfs.stat)(&abs, follow)?;
    user::copy_to_user(
        &process.memory.space,
        VirtualAddress::new(stat_out),
        stat_bytes(&stat),
    )?;
    Ok(0)
}

pub fn sys_ioctl(fd: u64, request: u64, argp: u64) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let table = PROCESS_TABLE.lock();
    let process = table
        .process(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let desc = process.fds.get(fd as usize)?;
    let vfs = fs::vfs()?;
    Ok((vfs.ioctl)(desc.vnode, request, argp)?)
}

pub fn sys_dup(fd: u64) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let mut table = PROCESS_TABLE.lock();
    let process = table
        .process_mut(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    Ok(process.fds.dup(fd as usize)? as i64)
}

pub fn sys_dup2(old: u64, new: u64) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let mut table = PROCESS_TABLE.lock();
    let process = table
        .process_mut(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    Ok(process.fds.dup2(old as usize, new as usize)? as i64)
}

pub fn sys_readlink(path_ptr: u64, buf: u64, cap: u64) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let table = PROCESS_TABLE.lock();
    let path = user_string(&table, pid, path_ptr, PATH_MAX)?;
    let process = table
        .process(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let abs = fs::resolve_path(&process.cwd, &path);
    let vfs = fs::vfs()?;
    let mut target = [0u8; PATH_MAX];
    let cap = (cap as usize).min(PATH_MAX);
    let n = (vfs.readlink)(&abs, &mut target[..cap])?;
    user::copy_to_user(
        &process.memory.space,
        VirtualAddress::new(buf),
        &target[..n],
    )?;
    Ok(n as i64)
}

// ---------------------------------------------------------------------------
// memory
// ---------------------------------------------------------------------------

/// mmap core, flags already translated. Anonymous mappings are zero
/// frames; file mappings are filled from the vnode after mapping.
pub fn sys_mmap(
    addr: u64,
    len: u64,
    perms: VmaFlags,
    fixed: bool,
    anon: bool,
    fd: i64,
    file_offset: u64,
) -> KernelResult<i64> {
    if len == 0 {
        return Err(MemoryError::InvalidSize.into());
    }
    if fixed && addr % PAGE_SIZE as u64 != 0 {
        return Err(MemoryError::Unaligned { addr }.into());
    }
    let len = (len as usize).next_multiple_of(PAGE_SIZE) as u64;

    let (pid, _) = current_ids()?;
    let mut table = PROCESS_TABLE.lock();
    let process = table
        .process_mut(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;

    let base = if fixed {
        addr
    } else {
        let hint = if addr != 0 { addr } else { MMAP_BASE };
        process
            .memory
            .vmas
            .find_gap(hint, len)
            .ok_or(MemoryError::OutOfMemory)?
    };

    let mut flags = perms;
    if !anon {
        flags |= VmaFlags::FILE;
    }
    {
        let mut frames = FRAME_ALLOCATOR.lock();
        process
            .memory
            .vmas
            .map_anon(&process.memory.space, &mut frames, base, len, flags)?;
    }

    if !anon && fd >= 0 {
        let desc = process.fds.get(fd as usize)?;
        let vfs = fs::vfs()?;
        let mut chunk = [0u8; CHUNK];
        let mut done = 0u64;
        while done < len {
            let want = ((len - done) as usize).min(CHUNK);
            let got = (vfs.read)(desc.vnode, file_offset + done, &mut chunk[..want])?;
            if got == 0 {
                break;
            }
            user::copy_to_user(
                &process.memory.space,
                VirtualAddress::new(base + done),
                &chunk[..got],
            )?;
            done += got as u64;
            if got < want {
                break;
            }
        }
    }

    Ok(base as i64)
}

pub fn sys_munmap(addr: u64, len: u64) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let mut table = PROCESS_TABLE.lock();
    let process = table
        .process_mut(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let mut frames = FRAME_ALLOCATOR.lock();
    process
        .memory
        .vmas
        .remove(&process.memory.space, &mut frames, addr, len)?;
    Ok(0)
}

pub fn sys_mprotect(addr: u64, len: u64, perms: VmaFlags) -> KernelResult<i64> {
    let (pid, _) = current_ids()?;
    let mut table = PROCESS_TABLE.lock();
    let process = table
        .process_mut(pid)
        .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
    let mut frames = FRAME_ALLOCATOR.lock();
    process
        .memory
        .vmas
        .protect(&process.memory.space, &mut frames, addr, len, perms)
        .map_err(|e| match e {
            // POSIX: a hole in the range is ENOMEM, not EFAULT.
            MemoryError::NoVma { .. } => KernelError::Memory(MemoryError::KernelRange { addr }),
            other => KernelError::Memory(other),
        })?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// processes
// ---------------------------------------------------------------------------

pub fn sys_exit(frame: &mut TrapFrame, code: i64) -> Outcome {
    let Ok((_pid, tid)) = current_ids() else {
        return Outcome::err(Errno::ESRCH);
    };
    {
        let mut table = PROCESS_TABLE.lock();
        let _ = lifecycle::exit_thread(&mut table, tid, code as i32);
    }
    sched::reschedule(frame);
    Outcome::Scheduled
}

pub fn sys_exit_group(frame: &mut TrapFrame, code: i64) -> Outcome {
    let Ok((pid, _tid)) = current_ids() else {
        return Outcome::err(Errno::ESRCH);
    };
    {
        let mut table = PROCESS_TABLE.lock();
        let _ = lifecycle::exit_process(&mut table, pid, code as i32);
    }
    sched::reschedule(frame);
    Outcome::Scheduled
}

/// fork: the child's frame is the caller's syscall frame with the return
/// register forced to 0; its first schedule leaves the kernel through the
/// trap gateway, not through this syscall's epilogue.
pub fn sys_fork(frame: &mut TrapFrame) -> Outcome {
    let mut table = PROCESS_TABLE.lock();
    match fork_impl::fork(&mut table, frame) {
        Ok(child) => Outcome::Done(child.0 as i64),
        Err(e) => Outcome::Done(crate::error::errno_ret(e)),
    }
}

pub fn sys_wait(frame: &mut TrapFrame, pid_arg: i64, status_out: u64, options: u64) -> Outcome {
    let outcome = {
        let mut table = PROCESS_TABLE.lock();
        wait::wait(&mut table, pid_arg, status_out, options)
    };
    match outcome {
        Ok(WaitOutcome::Reaped(child)) => Outcome::Done(child.0 as i64),
        Ok(WaitOutcome::Blocked) => {
            sched::reschedule(frame);
            Outcome::Scheduled
        }
        Err(e) => Outcome::Done(crate::error::errno_ret(e)),
    }
}

// ---------------------------------------------------------------------------
// exec
// ---------------------------------------------------------------------------

/// Split a `#!` line into interpreter and optional arguments.
/// Returns None when the bytes do not start with a shebang.
pub fn shebang_split(head: &[u8]) -> Option<(String, Vec<String>)> {
    if head.len() < 2 || &head[..2] != b"#!" {
        return None;
    }
    let line_end = head
        .iter()
        .position(|&b| b == b'\n')
        .unwrap_or(head.len().min(SHEBANG_MAX));
    let line = core::str::from_utf8(&head[2..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let interpreter = String::from(parts.next()?);
    let args = parts.map(String::from).collect();
    Some((interpreter, args))
}

/// Resolve shebang chains: returns the final target path and the fully
/// rewritten argv (`[interp, interp-args.., original-path, argv[1..]..]`
/// per level).
pub fn resolve_shebang(
    path: &str,
    argv: Vec<String>,
    read_head: impl Fn(&str, &mut [u8]) -> KernelResult<usize>,
) -> KernelResult<(String, Vec<String>)> {
    let mut path = String::from(path);
    let mut argv = argv;
    for _ in 0..MAX_SHEBANG_DEPTH {
        let mut head = [0u8; SHEBANG_MAX + 2];
        let n = read_head(&path, &mut head)?;
        let Some((interpreter, args)) = shebang_split(&head[..n]) else {
            return Ok((path, argv));
        };
        let mut rewritten: Vec<String> = Vec::with_capacity(argv.len() + args.len() + 1);
        rewritten.push(interpreter.clone());
        rewritten.extend(args);
        rewritten.push(path.clone());
        rewritten.extend(argv.into_iter().skip(1));
        argv = rewritten;
        path = interpreter;
    }
    Err(KernelError::Syscall(SyscallError::InvalidArgument))
}

fn read_whole_file(path: &str) -> KernelResult<Vec<u8>> {
    let vfs = fs::vfs()?;
    let vnode = (vfs.open)(path, OpenFlags::READ, 0)?;
    let size = (vfs.size)(vnode)? as usize;
    let mut data = vec![0u8; size];
    let mut done = 0usize;
    while done < size {
        let got = (vfs.read)(vnode, done as u64, &mut data[done..])?;
        if got == 0 {
            break;
        }
        done += got;
    }
    (vfs.release)(vnode);
    data.truncate(done);
    Ok(data)
}

/// execve core, paths and vectors already pulled from user space.
pub fn exec_image(
    frame: &mut TrapFrame,
    path: String,
    argv: Vec<String>,
    envp: Vec<String>,
) -> KernelResult<()> {
    let (pid, tid) = current_ids()?;

    // Shebang chase against the VFS.
    let (final_path, argv) = resolve_shebang(&path, argv, |p, buf| {
        let vfs = fs::vfs()?;
        let vnode = (vfs.open)(p, OpenFlags::READ, 0)?;
        let n = (vfs.read)(vnode, 0, buf)?;
        (vfs.release)(vnode);
        Ok(n)
    })?;

    let data = read_whole_file(&final_path)?;
    let image = elf::parse(&data).map_err(|_| KernelError::ExecFormat)?;

    let mut table = PROCESS_TABLE.lock();

    // Exec kills every other thread of the process.
    let other_tids: Vec<ThreadId> = table
        .process(pid)
        .map(|p| p.threads.iter().copied().filter(|&t| t != tid).collect())
        .unwrap_or_default();
    for other in other_tids {
        if let Some(thread) = table.thread_mut(other) {
            thread.state = TaskState::Terminated;
        }
        sched::dequeue(other);
    }

    // Replace the image: tear down the old user mappings, load the new
    // segments, rebuild the stack.
    const STACK_PAGES: u64 = 4;
    let (entry, rsp, stack_top, mapped_base) = {
        let process = table
            .process_mut(pid)
            .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
        let memory = &mut process.memory;
        let mut frames = FRAME_ALLOCATOR.lock();
        memory.vmas.clear(&memory.space, &mut frames);
        memory.brk = USER_STACK_TOP / 2;
        memory.brk_base = memory.brk;
        memory.next_stack_top = USER_STACK_TOP;

        let entry = elf::load(&image, &data, &memory.space, &mut memory.vmas, &mut frames)?;

        let stack_top = memory.next_stack_top;
        memory.next_stack_top -= crate::process::thread::USER_STACK_STRIDE;
        let mapped_base = stack_top - STACK_PAGES * PAGE_SIZE as u64;
        memory.vmas.map_anon(
            &memory.space,
            &mut frames,
            mapped_base,
            STACK_PAGES * PAGE_SIZE as u64,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::STACK,
        )?;
        let _ = memory.vmas.replace_area(
            mapped_base,
            stack_top,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::STACK | VmaFlags::OWNED,
            stack_top - USER_STACK_LIMIT,
        );

        let argv_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        let envp_refs: Vec<&str> = envp.iter().map(String::as_str).collect();
        let auxv = [(6u64, PAGE_SIZE as u64)]; // AT_PAGESZ
        let rsp = build_initial_stack(&memory.space, stack_top, &argv_refs, &envp_refs, &auxv)?;
        (entry, rsp, stack_top, mapped_base)
    };

    if let Some(thread) = table.thread_mut(tid) {
        thread.user_stack = Some(UserStack {
            top: stack_top,
            low_mark: mapped_base,
            limit: stack_top - USER_STACK_LIMIT,
        });
        thread.clear_child_tid = 0;
    }
    if let Some(process) = table.process_mut(pid) {
        process.name = final_path;
    }

    // The caller resumes as the fresh program: new frame in place.
    *frame = TrapFrame::new_user(entry, rsp);
    Ok(())
}

/// execve front: pulls path/argv/envp from user space, then replaces the
/// image. On success the syscall "returns" into the new program.
pub fn sys_execve(frame: &mut TrapFrame, path_ptr: u64, argv_ptr: u64, envp_ptr: u64) -> Outcome {
    let pulled = (|| -> KernelResult<(String, Vec<String>, Vec<String>)> {
        let (pid, _) = current_ids()?;
        let table = PROCESS_TABLE.lock();
        let raw_path = user_string(&table, pid, path_ptr, PATH_MAX)?;
        let process = table
            .process(pid)
            .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
        let path = fs::resolve_path(&process.cwd, &raw_path);

        let mut argv = Vec::new();
        for ptr in user_ptr_vec(&table, pid, argv_ptr)? {
            argv.push(user_string(&table, pid, ptr, MAX_ARG)?);
        }
        if argv.is_empty() {
            argv.push(path.clone());
        }
        let mut envp = Vec::new();
        for ptr in user_ptr_vec(&table, pid, envp_ptr)? {
            envp.push(user_string(&table, pid, ptr, MAX_ARG)?);
        }
        Ok((path, argv, envp))
    })();

    match pulled {
        Ok((path, argv, envp)) => match exec_image(frame, path, argv, envp) {
            Ok(()) => Outcome::Done(0),
            Err(e) => Outcome::Done(crate::error::errno_ret(e)),
        },
        Err(e) => Outcome::Done(crate::error::errno_ret(e)),
    }
}

/// spawn: new process running `path` with the given argv. Used by the
/// native table; built from create_process + the exec loader.
pub fn spawn_process(path: &str, argv: &[&str]) -> KernelResult<ProcessId> {
    let (parent_pid, _) = current_ids()?;
    let mut table = PROCESS_TABLE.lock();
    let (security, compat) = {
        let parent = table
            .process(parent_pid)
            .ok_or(crate::error::ProcessError::NotFound { pid: parent_pid.0 })?;
        (parent.security, parent.compat)
    };
    let pid = table.create_process(Some(parent_pid), path, security, compat)?;

    let data = read_whole_file(path)?;
    let image = elf::parse(&data)?;

    let entry = {
        let process = table
            .process_mut(pid)
            .ok_or(crate::error::ProcessError::NotFound { pid: pid.0 })?;
        let memory = &mut process.memory;
        let mut frames = FRAME_ALLOCATOR.lock();
        elf::load(&image, &data, &memory.space, &mut memory.vmas, &mut frames)?
    };

    let mut argv_full: Vec<&str> = Vec::with_capacity(argv.len() + 1);
    if argv.first().copied() != Some(path) {
        argv_full.push(path);
    }
    argv_full.extend_from_slice(argv);

    let auxv = [(6u64, PAGE_SIZE as u64)];
    let tid = table.create_user_thread(
        pid,
        entry,
        &argv_full,
        &[],
        &auxv,
        crate::process::Priority::Normal,
    )?;
    sched::spawn_ready(&mut table, tid)?;
    Ok(pid)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::error::FsError;

    #[test]
    fn shebang_parsing() {
        let (interp, args) = shebang_split(b"#!/bin/sh -x\nbody").expect("shebang");
        assert_eq!(interp, "/bin/sh");
        assert_eq!(args, alloc::vec![String::from("-x")]);

        assert!(shebang_split(b"\x7fELF...").is_none());
        assert!(shebang_split(b"#").is_none());

        let (interp, args) = shebang_split(b"#!/usr/bin/env python3\n").expect("env shebang");
        assert_eq!(interp, "/usr/bin/env");
        assert_eq!(args, alloc::vec![String::from("python3")]);
    }

    #[test]
    fn shebang_argv_rewrite_matches_convention() {
        // /bin/foo starts with "#!/bin/sh -x"; exec with [foo, bar] must
        // produce [/bin/sh, -x, /bin/foo, bar].
        let read_head = |path: &str, buf: &mut [u8]| -> KernelResult<usize> {
            let content: &[u8] = match path {
                "/bin/foo" => b"#!/bin/sh -x\necho hi\n",
                "/bin/sh" => b"\x7fELF fake",
                _ => return Err(KernelError::Fs(FsError::NotFound)),
            };
            let n = content.len().min(buf.len());
            buf[..n].copy_from_slice(&content[..n]);
            Ok(n)
        };

        let argv = alloc::vec![String::from("foo"), String::from("bar")];
        let (path, argv) = resolve_shebang("/bin/foo", argv, read_head).expect("resolve");
        assert_eq!(path, "/bin/sh");
        assert_eq!(
            argv,
            alloc::vec![
                String::from("/bin/sh"),
                String::from("-x"),
                String::from("/bin/foo"),
                String::from("bar"),
            ]
        );
    }

    #[test]
    fn shebang_chain_depth_is_bounded() {
        // A -> B -> A ... never resolves; the chase must stop.
        let read_head = |path: &str, buf: &mut [u8]| -> KernelResult<usize> {
            let content: &[u8] = match path {
                "/a" => b"#!/b\n",
                "/b" => b"#!/a\n",
                _ => return Err(KernelError::Fs(FsError::NotFound)),
            };
            buf[..content.len()].copy_from_slice(content);
            Ok(content.len())
        };
        let argv = alloc::vec![String::from("a")];
        assert!(resolve_shebang("/a", argv, read_head).is_err());
    }
}
