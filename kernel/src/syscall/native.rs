//! Native syscall table
//!
//! Numbers follow the native ABI enumeration: exit is 0, the memory calls
//! follow, then files, IPC, thread state, and process management, ending
//! with the two reserved process-creation slots. Arguments arrive in the
//! architecture's syscall registers; errors return as negative errno.

extern crate alloc;

use alloc::vec::Vec;

use super::{done, shared, Outcome, SyscallEntry, PRIV_ANY, PRIV_ROOT};
use crate::{
    arch::TrapFrame,
    error::{Errno, KernelResult, MemoryError, ProcessError},
    fs::{OpenFlags, Whence},
    ipc::{ChannelId, ChannelType},
    mm::{
        user::{self, PATH_MAX},
        vma::VmaFlags,
        PageFlags, PageSize, PhysicalAddress, VirtualAddress, FRAME_ALLOCATOR, PAGE_SIZE,
    },
    process::{lifecycle, ProcessId, Signal, ThreadId, PROCESS_TABLE},
    sched,
};

pub const NR_EXIT: usize = 0;
pub const NR_REQUEST_PAGES: usize = 1;
pub const NR_FREE_PAGES: usize = 2;
pub const NR_DETACH_ADDRESS: usize = 3;
pub const NR_MEMORY_MAP: usize = 4;
pub const NR_MEMORY_UNMAP: usize = 5;
pub const NR_KERNEL_CTL: usize = 6;
pub const NR_FILE_OPEN: usize = 7;
pub const NR_FILE_CLOSE: usize = 8;
pub const NR_FILE_READ: usize = 9;
pub const NR_FILE_WRITE: usize = 10;
pub const NR_FILE_SEEK: usize = 11;
pub const NR_FILE_STAT: usize = 12;
pub const NR_IPC: usize = 13;
pub const NR_LOCAL_THREAD_STATE: usize = 14;
pub const NR_SLEEP: usize = 15;
pub const NR_FORK: usize = 16;
pub const NR_WAIT: usize = 17;
pub const NR_KILL: usize = 18;
pub const NR_SPAWN: usize = 19;
pub const NR_SPAWN_THREAD: usize = 20;
pub const NR_GET_THREAD_LIST: usize = 21;
pub const NR_GET_CURRENT_PROCESS: usize = 22;
pub const NR_GET_CURRENT_THREAD: usize = 23;
pub const NR_GET_CURRENT_PROCESS_ID: usize = 24;
pub const NR_GET_CURRENT_THREAD_ID: usize = 25;
pub const NR_GET_PROCESS_BY_PID: usize = 26;
pub const NR_GET_THREAD_BY_TID: usize = 27;
pub const NR_KILL_PROCESS: usize = 28;
pub const NR_KILL_THREAD: usize = 29;
pub const NR_RESERVED_CREATE_PROCESS: usize = 30;
pub const NR_RESERVED_CREATE_THREAD: usize = 31;

/// One past the last valid number.
pub const MAX_SYSCALL: usize = 32;

/// kernel_ctl command codes.
pub const KCTL_PRINT: u64 = 0;
pub const KCTL_GET_PAGE_SIZE: u64 = 1;
pub const KCTL_IS_CRITICAL: u64 = 2;

/// local_thread_state command codes.
pub const LTS_SET_GS: u64 = 1;
pub const LTS_SET_FS: u64 = 2;
pub const LTS_GET_FS: u64 = 3;
pub const LTS_GET_GS: u64 = 4;

/// ipc() multiplexer command codes.
pub const IPC_CREATE: u64 = 0;
pub const IPC_DESTROY: u64 = 1;
pub const IPC_ALLOCATE: u64 = 2;
pub const IPC_LISTEN: u64 = 3;
pub const IPC_WRITE: u64 = 4;
pub const IPC_READ: u64 = 5;
pub const IPC_WAIT: u64 = 6;

static TABLE: [SyscallEntry; MAX_SYSCALL] = [
    SyscallEntry::new("exit", sys_exit, PRIV_ANY),
    SyscallEntry::new("request_pages", sys_request_pages, PRIV_ANY),
    SyscallEntry::new("free_pages", sys_free_pages, PRIV_ANY),
    SyscallEntry::new("detach_address", sys_detach_address, PRIV_ANY),
    SyscallEntry::new("memory_map", sys_memory_map, PRIV_ROOT),
    SyscallEntry::new("memory_unmap", sys_memory_unmap, PRIV_ROOT),
    SyscallEntry::new("kernel_ctl", sys_kernel_ctl, PRIV_ANY),
    SyscallEntry::new("file_open", sys_file_open, PRIV_ANY),
    SyscallEntry::new("file_close", sys_file_close, PRIV_ANY),
    SyscallEntry::new("file_read", sys_file_read, PRIV_ANY),
    SyscallEntry::new("file_write", sys_file_write, PRIV_ANY),
    SyscallEntry::new("file_seek", sys_file_seek, PRIV_ANY),
    SyscallEntry::new("file_stat", sys_file_stat, PRIV_ANY),
    SyscallEntry::new("ipc", sys_ipc, PRIV_ANY),
    SyscallEntry::new("local_thread_state", sys_local_thread_state, PRIV_ANY),
    SyscallEntry::new("sleep", sys_sleep, PRIV_ANY),
    SyscallEntry::new("fork", sys_fork, PRIV_ANY),
    SyscallEntry::new("wait", sys_wait, PRIV_ANY),
    SyscallEntry::new("kill", sys_kill, PRIV_ANY),
    SyscallEntry::new("spawn", sys_spawn, PRIV_ANY),
    SyscallEntry::new("spawn_thread", sys_spawn_thread, PRIV_ANY),
    SyscallEntry::new("get_thread_list_of_process", sys_get_thread_list, PRIV_ANY),
    SyscallEntry::new("get_current_process", sys_get_current_process, PRIV_ANY),
    SyscallEntry::new("get_current_thread", sys_get_current_thread, PRIV_ANY),
    SyscallEntry::new("get_current_process_id", sys_get_current_process, PRIV_ANY),
    SyscallEntry::new("get_current_thread_id", sys_get_current_thread, PRIV_ANY),
    SyscallEntry::new("get_process_by_pid", sys_get_process_by_pid, PRIV_ANY),
    SyscallEntry::new("get_thread_by_tid", sys_get_thread_by_tid, PRIV_ANY),
    SyscallEntry::new("kill_process", sys_kill_process, PRIV_ANY),
    SyscallEntry::new("kill_thread", sys_kill_thread, PRIV_ANY),
    SyscallEntry::reserved("reserved_create_process"),
    SyscallEntry::reserved("reserved_create_thread"),
];

pub fn lookup(nr: usize) -> Option<&'static SyscallEntry> {
    TABLE.get(nr)
}

// ---------------------------------------------------------------------------
// handlers
// ---------------------------------------------------------------------------

fn sys_exit(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    shared::sys_exit(frame, args[0] as i64)
}

fn sys_request_pages(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let count = args[0];
    done(shared::sys_mmap(
        0,
        count * PAGE_SIZE as u64,
        VmaFlags::READ | VmaFlags::WRITE,
        false,
        true,
        -1,
        0,
    ))
}

fn sys_free_pages(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_munmap(args[0], args[1] * PAGE_SIZE as u64))
}

fn sys_detach_address(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let pid = sched::current_process_id()?;
        let mut table = PROCESS_TABLE.lock();
        let process = table
            .process_mut(pid)
            .ok_or(ProcessError::NotFound { pid: pid.0 })?;
        process.memory.vmas.detach(args[0])?;
        Ok(0)
    })())
}

/// Map a physical window into the caller (root only): va, pa, size, flags
/// with {1 present, 2 writable, 4 user} like the native ABI defines.
fn sys_memory_map(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let (va, pa, size, map_flags) = (args[0], args[1], args[2], args[3]);
        if size == 0 {
            return Err(MemoryError::InvalidSize.into());
        }
        if va % PAGE_SIZE as u64 != 0 || pa % PAGE_SIZE as u64 != 0 {
            return Err(MemoryError::Unaligned { addr: va | pa }.into());
        }
        let pid = sched::current_process_id()?;
        let mut table = PROCESS_TABLE.lock();
        let process = table
            .process_mut(pid)
            .ok_or(ProcessError::NotFound { pid: pid.0 })?;

        let mut pte = PageFlags::empty();
        if map_flags & 0x2 != 0 {
            pte |= PageFlags::WRITABLE;
        }
        if map_flags & 0x4 != 0 {
            pte |= PageFlags::USER;
        }

        let pages = size.div_ceil(PAGE_SIZE as u64);
        let mut vma_flags = VmaFlags::READ | VmaFlags::SHARED;
        if pte.contains(PageFlags::WRITABLE) {
            vma_flags |= VmaFlags::WRITE;
        }
        process
            .memory
            .vmas
            .insert(va, pages * PAGE_SIZE as u64, vma_flags, va)?;
        let mut frames = FRAME_ALLOCATOR.lock();
        for i in 0..pages {
            process.memory.space.map(
                VirtualAddress::new(va + i * PAGE_SIZE as u64),
                PhysicalAddress::new(pa + i * PAGE_SIZE as u64),
                pte,
                PageSize::Small,
                &mut frames,
            )?;
        }
        Ok(va as i64)
    })())
}

fn sys_memory_unmap(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_munmap(args[0], args[1]))
}

fn sys_kernel_ctl(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        match args[0] {
            KCTL_PRINT => {
                let (ptr, len) = (args[1], (args[2] as usize).min(1024));
                let pid = sched::current_process_id()?;
                let table = PROCESS_TABLE.lock();
                let process = table
                    .process(pid)
                    .ok_or(ProcessError::NotFound { pid: pid.0 })?;
                let mut buf = [0u8; 1024];
                user::copy_from_user(
                    &process.memory.space,
                    VirtualAddress::new(ptr),
                    &mut buf[..len],
                )?;
                drop(table);
                log::info!(
                    target: "kctl",
                    "[{}] {}",
                    crate::arch::ticks(),
                    core::str::from_utf8(&buf[..len]).unwrap_or("<non-utf8>")
                );
                Ok(0)
            }
            KCTL_GET_PAGE_SIZE => Ok(PAGE_SIZE as i64),
            KCTL_IS_CRITICAL => {
                let pid = sched::current_process_id()?;
                let table = PROCESS_TABLE.lock();
                let critical = table
                    .process(pid)
                    .map(|p| p.security.critical)
                    .unwrap_or(false);
                Ok(critical as i64)
            }
            _ => Err(crate::error::SyscallError::InvalidArgument.into()),
        }
    })())
}

fn sys_file_open(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let flags = OpenFlags::from_bits_truncate(args[1] as u32);
    done(shared::sys_open(args[0], flags, args[2] as u32))
}

fn sys_file_close(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_close(args[0]))
}

fn sys_file_read(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_read(args[0], args[1], args[2]))
}

fn sys_file_write(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_write(args[0], args[1], args[2]))
}

fn sys_file_seek(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let Some(whence) = Whence::from_native(args[2]) else {
        return Outcome::err(Errno::EINVAL);
    };
    done(shared::sys_lseek(args[0], args[1] as i64, whence))
}

fn sys_file_stat(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_fstat(args[0], args[1]))
}

/// The IPC multiplexer: (command, id/type, buf, n, flags).
fn sys_ipc(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let command = args[0];
    match command {
        IPC_WAIT => sys_ipc_wait(frame, args[1] as ChannelId),
        _ => done(sys_ipc_plain(command, args)),
    }
}

fn sys_ipc_plain(command: u64, args: [u64; 6]) -> KernelResult<i64> {
    let pid = sched::current_process_id()?;
    let mut table = PROCESS_TABLE.lock();

    match command {
        IPC_CREATE => {
            let (kind_raw, token_ptr) = (args[1], args[2]);
            let mut token = [0u8; 16];
            {
                let process = table
                    .process(pid)
                    .ok_or(ProcessError::NotFound { pid: pid.0 })?;
                if token_ptr != 0 {
                    user::copy_from_user(
                        &process.memory.space,
                        VirtualAddress::new(token_ptr),
                        &mut token,
                    )?;
                }
            }
            let process = table
                .process_mut(pid)
                .ok_or(ProcessError::NotFound { pid: pid.0 })?;
            let id = process.ipc.create(ChannelType::from_raw(kind_raw), token)?;
            Ok(id as i64)
        }
        IPC_DESTROY => {
            let process = table
                .process_mut(pid)
                .ok_or(ProcessError::NotFound { pid: pid.0 })?;
            process.ipc.destroy(args[1] as ChannelId)?;
            Ok(0)
        }
        IPC_ALLOCATE => {
            let process = table
                .process_mut(pid)
                .ok_or(ProcessError::NotFound { pid: pid.0 })?;
            process.ipc.allocate(args[1] as ChannelId, args[2] as usize)?;
            Ok(0)
        }
        IPC_LISTEN => {
            let process = table
                .process_mut(pid)
                .ok_or(ProcessError::NotFound { pid: pid.0 })?;
            process.ipc.listen(args[1] as ChannelId, args[2] != 0)?;
            Ok(0)
        }
        IPC_WRITE => {
            let (id, buf, n) = (args[1] as ChannelId, args[2], (args[3] as usize).min(64 * 1024));
            let mut data = alloc::vec![0u8; n];
            {
                let process = table
                    .process(pid)
                    .ok_or(ProcessError::NotFound { pid: pid.0 })?;
                user::copy_from_user(
                    &process.memory.space,
                    VirtualAddress::new(buf),
                    &mut data,
                )?;
            }
            let written = {
                let process = table
                    .process_mut(pid)
                    .ok_or(ProcessError::NotFound { pid: pid.0 })?;
                process.ipc.write(id, &data)?
            };
            // A completed write releases channel waiters.
            sched::wake_channel_waiters(&mut table, pid, id);
            Ok(written as i64)
        }
        IPC_READ => {
            let (id, buf, n) = (args[1] as ChannelId, args[2], (args[3] as usize).min(64 * 1024));
            let mut data = alloc::vec![0u8; n];
            let read = {
                let process = table
                    .process(pid)
                    .ok_or(ProcessError::NotFound { pid: pid.0 })?;
                process.ipc.read(id, &mut data)?
            };
            let process = table
                .process(pid)
                .ok_or(ProcessError::NotFound { pid: pid.0 })?;
            user::copy_to_user(
                &process.memory.space,
                VirtualAddress::new(buf),
                &data[..read],
            )?;
            Ok(read as i64)
        }
        _ => Err(crate::error::SyscallError::InvalidArgument.into()),
    }
}

/// ipc wait: yields until a writer clears the channel's listen latch.
fn sys_ipc_wait(frame: &mut TrapFrame, id: ChannelId) -> Outcome {
    let listening = {
        let Ok(pid) = sched::current_process_id() else {
            return Outcome::err(Errno::ESRCH);
        };
        let table = PROCESS_TABLE.lock();
        match table.process(pid).map(|p| p.ipc.is_listening(id)) {
            Some(Ok(listening)) => listening,
            Some(Err(e)) => return Outcome::Done(crate::error::errno_ret(e.into())),
            None => return Outcome::err(Errno::ESRCH),
        }
    };
    if !listening {
        return Outcome::Done(0);
    }
    sched::block_on_channel(frame, id);
    Outcome::Scheduled
}

fn sys_local_thread_state(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let tid = sched::current_thread_id()?;
        let mut table = PROCESS_TABLE.lock();
        let thread = table
            .thread_mut(tid)
            .ok_or(ProcessError::ThreadNotFound { tid: tid.0 })?;
        match args[0] {
            LTS_SET_GS => {
                thread.tls.gs_base = args[1];
                let tls = thread.tls;
                crate::arch::set_tls(tls);
                Ok(0)
            }
            LTS_SET_FS => {
                thread.tls.fs_base = args[1];
                let tls = thread.tls;
                crate::arch::set_tls(tls);
                Ok(0)
            }
            LTS_GET_FS => Ok(thread.tls.fs_base as i64),
            LTS_GET_GS => Ok(thread.tls.gs_base as i64),
            _ => Err(crate::error::SyscallError::InvalidArgument.into()),
        }
    })())
}

fn sys_sleep(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    sched::sleep(frame, args[0]);
    Outcome::Scheduled
}

fn sys_fork(frame: &mut TrapFrame, _args: [u64; 6]) -> Outcome {
    shared::sys_fork(frame)
}

fn sys_wait(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    shared::sys_wait(frame, args[0] as i64, args[1], args[2])
}

/// Terminate `pid` as if it received `sig`.
fn sys_kill(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let target = ProcessId(args[0] as u32);
    let sig = args[1] as i32;
    let own = sched::current_process_id().ok();
    let result = {
        let mut table = PROCESS_TABLE.lock();
        if table.process(target).is_none() {
            Err(ProcessError::NotFound { pid: target.0 }.into())
        } else {
            lifecycle::exit_process(&mut table, target, 128 + sig)
        }
    };
    match result {
        Ok(()) if own == Some(target) => {
            sched::reschedule(frame);
            Outcome::Scheduled
        }
        Ok(()) => Outcome::Done(0),
        Err(e) => Outcome::Done(crate::error::errno_ret(e)),
    }
}

fn sys_spawn(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let (path_ptr, argv_ptr) = (args[0], args[1]);
        let pid = sched::current_process_id()?;
        let (path, argv) = {
            let table = PROCESS_TABLE.lock();
            let process = table
                .process(pid)
                .ok_or(ProcessError::NotFound { pid: pid.0 })?;
            let mut buf = alloc::vec![0u8; PATH_MAX];
            let len = user::copy_string_from_user(
                &process.memory.space,
                VirtualAddress::new(path_ptr),
                &mut buf,
                PATH_MAX,
            )?;
            let path = core::str::from_utf8(&buf[..len])
                .map(alloc::string::String::from)
                .map_err(|_| crate::error::SyscallError::InvalidArgument)?;

            let mut argv: Vec<alloc::string::String> = Vec::new();
            if argv_ptr != 0 {
                for i in 0..16u64 {
                    let mut word = [0u8; 8];
                    user::copy_from_user(
                        &process.memory.space,
                        VirtualAddress::new(argv_ptr + i * 8),
                        &mut word,
                    )?;
                    let ptr = u64::from_le_bytes(word);
                    if ptr == 0 {
                        break;
                    }
                    let mut arg_buf = alloc::vec![0u8; PATH_MAX];
                    let arg_len = user::copy_string_from_user(
                        &process.memory.space,
                        VirtualAddress::new(ptr),
                        &mut arg_buf,
                        PATH_MAX,
                    )?;
                    argv.push(
                        core::str::from_utf8(&arg_buf[..arg_len])
                            .map(alloc::string::String::from)
                            .map_err(|_| crate::error::SyscallError::InvalidArgument)?,
                    );
                }
            }
            (path, argv)
        };
        let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
        let child = shared::spawn_process(&path, &argv_refs)?;
        Ok(child.0 as i64)
    })())
}

fn sys_spawn_thread(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let (entry, arg) = (args[0], args[1]);
        let pid = sched::current_process_id()?;
        let mut table = PROCESS_TABLE.lock();
        let tid = table.create_user_thread(
            pid,
            entry,
            &[],
            &[],
            &[],
            crate::process::Priority::Normal,
        )?;
        if let Some(thread) = table.thread_mut(tid) {
            thread.frame.rdi = arg;
        }
        sched::spawn_ready(&mut table, tid)?;
        Ok(tid.0 as i64)
    })())
}

fn sys_get_thread_list(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let (target, buf, cap) = (ProcessId(args[0] as u32), args[1], args[2] as usize);
        let own = sched::current_process_id()?;
        let table = PROCESS_TABLE.lock();
        let tids: Vec<u32> = table
            .process(target)
            .ok_or(ProcessError::NotFound { pid: target.0 })?
            .threads
            .iter()
            .map(|t| t.0)
            .collect();
        let n = tids.len().min(cap);
        if buf != 0 && n > 0 {
            let caller = table
                .process(own)
                .ok_or(ProcessError::NotFound { pid: own.0 })?;
            let mut bytes: Vec<u8> = Vec::with_capacity(n * 4);
            for tid in &tids[..n] {
                bytes.extend_from_slice(&tid.to_le_bytes());
            }
            user::copy_to_user(&caller.memory.space, VirtualAddress::new(buf), &bytes)?;
        }
        Ok(tids.len() as i64)
    })())
}

fn sys_get_current_process(_frame: &mut TrapFrame, _args: [u64; 6]) -> Outcome {
    done(sched::current_process_id().map(|pid| pid.0 as i64))
}

fn sys_get_current_thread(_frame: &mut TrapFrame, _args: [u64; 6]) -> Outcome {
    done(sched::current_thread_id().map(|tid| tid.0 as i64))
}

fn sys_get_process_by_pid(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let pid = ProcessId(args[0] as u32);
        let table = PROCESS_TABLE.lock();
        table
            .process(pid)
            .map(|p| p.pid.0 as i64)
            .ok_or(ProcessError::NotFound { pid: pid.0 }.into())
    })())
}

fn sys_get_thread_by_tid(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let tid = ThreadId(args[0] as u32);
        let table = PROCESS_TABLE.lock();
        table
            .thread(tid)
            .map(|t| t.tid.0 as i64)
            .ok_or(ProcessError::ThreadNotFound { tid: tid.0 }.into())
    })())
}

fn sys_kill_process(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    sys_kill(frame, [args[0], Signal::SIGKILL as i32 as u64, 0, 0, 0, 0])
}

fn sys_kill_thread(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let target = ThreadId(args[0] as u32);
    let own = sched::current_thread_id().ok();
    let result = {
        let mut table = PROCESS_TABLE.lock();
        if table.thread(target).is_none() {
            Err(crate::error::KernelError::Process(
                ProcessError::ThreadNotFound { tid: target.0 },
            ))
        } else {
            lifecycle::exit_thread(&mut table, target, Signal::SIGKILL.exit_code())
        }
    };
    match result {
        Ok(()) if own == Some(target) => {
            sched::reschedule(frame);
            Outcome::Scheduled
        }
        Ok(()) => Outcome::Done(0),
        Err(e) => Outcome::Done(crate::error::errno_ret(e)),
    }
}
