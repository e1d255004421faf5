//! Linux-compatible syscall table (x86_64 numbers)
//!
//! A thin shim over the shared helpers: `O_*`, `PROT_*`, `MAP_*` and
//! `SEEK_*` constants are translated to native values at entry, then the
//! call lands in the same implementation the native table uses.

extern crate alloc;

use super::{done, shared, Outcome, SyscallEntry, PRIV_ANY};
use crate::{
    arch::TrapFrame,
    error::{Errno, KernelResult, ProcessError},
    fs::{OpenFlags, Whence},
    mm::{user, vma::VmaFlags, VirtualAddress, FRAME_ALLOCATOR, PAGE_SIZE},
    process::PROCESS_TABLE,
    sched,
};

/// Table size; everything at or above is ENOSYS.
pub const LINUX_MAX: usize = 335;

// Linux x86_64 syscall numbers (the implemented subset).
pub const NR_READ: usize = 0;
pub const NR_WRITE: usize = 1;
pub const NR_OPEN: usize = 2;
pub const NR_CLOSE: usize = 3;
pub const NR_STAT: usize = 4;
pub const NR_FSTAT: usize = 5;
pub const NR_LSTAT: usize = 6;
pub const NR_LSEEK: usize = 8;
pub const NR_MMAP: usize = 9;
pub const NR_MPROTECT: usize = 10;
pub const NR_MUNMAP: usize = 11;
pub const NR_BRK: usize = 12;
pub const NR_IOCTL: usize = 16;
pub const NR_READV: usize = 19;
pub const NR_WRITEV: usize = 20;
pub const NR_DUP: usize = 32;
pub const NR_DUP2: usize = 33;
pub const NR_FORK: usize = 57;
pub const NR_EXECVE: usize = 59;
pub const NR_EXIT: usize = 60;
pub const NR_WAIT4: usize = 61;
pub const NR_UNAME: usize = 63;
pub const NR_CREAT: usize = 85;
pub const NR_READLINK: usize = 89;
pub const NR_ARCH_PRCTL: usize = 158;
pub const NR_GETTID: usize = 186;
pub const NR_SET_TID_ADDRESS: usize = 218;
pub const NR_EXIT_GROUP: usize = 231;

// Linux flag constants, translated at entry.
const O_WRONLY: u32 = 0o1;
const O_RDWR: u32 = 0o2;
const O_CREAT: u32 = 0o100;
const O_EXCL: u32 = 0o200;
const O_TRUNC: u32 = 0o1000;
const O_APPEND: u32 = 0o2000;

const PROT_READ: u64 = 1;
const PROT_WRITE: u64 = 2;
const PROT_EXEC: u64 = 4;

const MAP_FIXED: u64 = 0x10;
const MAP_ANONYMOUS: u64 = 0x20;

const ARCH_SET_GS: u64 = 0x1001;
const ARCH_SET_FS: u64 = 0x1002;
const ARCH_GET_FS: u64 = 0x1003;
const ARCH_GET_GS: u64 = 0x1004;

/// Translate Linux open flags to native ones.
fn open_flags_from_linux(oflag: u32) -> OpenFlags {
    let mut flags = OpenFlags::empty();
    match oflag & 0o3 {
        O_WRONLY => flags |= OpenFlags::WRITE,
        O_RDWR => flags |= OpenFlags::READ | OpenFlags::WRITE,
        _ => flags |= OpenFlags::READ,
    }
    if oflag & O_CREAT != 0 {
        flags |= OpenFlags::CREATE;
    }
    if oflag & O_EXCL != 0 {
        flags |= OpenFlags::EXCL;
    }
    if oflag & O_TRUNC != 0 {
        flags |= OpenFlags::TRUNCATE;
    }
    if oflag & O_APPEND != 0 {
        flags |= OpenFlags::APPEND;
    }
    flags
}

/// Translate PROT_* bits to area permissions.
fn prot_from_linux(prot: u64) -> VmaFlags {
    let mut flags = VmaFlags::empty();
    if prot & PROT_READ != 0 {
        flags |= VmaFlags::READ;
    }
    if prot & PROT_WRITE != 0 {
        flags |= VmaFlags::WRITE;
    }
    if prot & PROT_EXEC != 0 {
        flags |= VmaFlags::EXEC;
    }
    flags
}

const fn build_table() -> [SyscallEntry; LINUX_MAX] {
    let mut table = [SyscallEntry::empty(); LINUX_MAX];
    table[NR_READ] = SyscallEntry::new("read", lx_read, PRIV_ANY);
    table[NR_WRITE] = SyscallEntry::new("write", lx_write, PRIV_ANY);
    table[NR_OPEN] = SyscallEntry::new("open", lx_open, PRIV_ANY);
    table[NR_CLOSE] = SyscallEntry::new("close", lx_close, PRIV_ANY);
    table[NR_STAT] = SyscallEntry::new("stat", lx_stat, PRIV_ANY);
    table[NR_FSTAT] = SyscallEntry::new("fstat", lx_fstat, PRIV_ANY);
    table[NR_LSTAT] = SyscallEntry::new("lstat", lx_lstat, PRIV_ANY);
    table[NR_LSEEK] = SyscallEntry::new("lseek", lx_lseek, PRIV_ANY);
    table[NR_MMAP] = SyscallEntry::new("mmap", lx_mmap, PRIV_ANY);
    table[NR_MPROTECT] = SyscallEntry::new("mprotect", lx_mprotect, PRIV_ANY);
    table[NR_MUNMAP] = SyscallEntry::new("munmap", lx_munmap, PRIV_ANY);
    table[NR_BRK] = SyscallEntry::new("brk", lx_brk, PRIV_ANY);
    table[NR_IOCTL] = SyscallEntry::new("ioctl", lx_ioctl, PRIV_ANY);
    table[NR_READV] = SyscallEntry::new("readv", lx_readv, PRIV_ANY);
    table[NR_WRITEV] = SyscallEntry::new("writev", lx_writev, PRIV_ANY);
    table[NR_DUP] = SyscallEntry::new("dup", lx_dup, PRIV_ANY);
    table[NR_DUP2] = SyscallEntry::new("dup2", lx_dup2, PRIV_ANY);
    table[NR_FORK] = SyscallEntry::new("fork", lx_fork, PRIV_ANY);
    table[NR_EXECVE] = SyscallEntry::new("execve", lx_execve, PRIV_ANY);
    table[NR_EXIT] = SyscallEntry::new("exit", lx_exit, PRIV_ANY);
    table[NR_WAIT4] = SyscallEntry::new("wait4", lx_wait4, PRIV_ANY);
    table[NR_UNAME] = SyscallEntry::new("uname", lx_uname, PRIV_ANY);
    table[NR_CREAT] = SyscallEntry::new("creat", lx_creat, PRIV_ANY);
    table[NR_READLINK] = SyscallEntry::new("readlink", lx_readlink, PRIV_ANY);
    table[NR_ARCH_PRCTL] = SyscallEntry::new("arch_prctl", lx_arch_prctl, PRIV_ANY);
    table[NR_GETTID] = SyscallEntry::new("gettid", lx_gettid, PRIV_ANY);
    table[NR_SET_TID_ADDRESS] = SyscallEntry::new("set_tid_address", lx_set_tid_address, PRIV_ANY);
    table[NR_EXIT_GROUP] = SyscallEntry::new("exit_group", lx_exit_group, PRIV_ANY);
    table
}

static TABLE: [SyscallEntry; LINUX_MAX] = build_table();

pub fn lookup(nr: usize) -> Option<&'static SyscallEntry> {
    TABLE.get(nr)
}

// ---------------------------------------------------------------------------
// handlers
// ---------------------------------------------------------------------------

fn lx_read(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_read(args[0], args[1], args[2]))
}

fn lx_write(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_write(args[0], args[1], args[2]))
}

fn lx_open(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let flags = open_flags_from_linux(args[1] as u32);
    done(shared::sys_open(args[0], flags, args[2] as u32))
}

fn lx_creat(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_open(
        args[0],
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        args[1] as u32,
    ))
}

fn lx_close(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_close(args[0]))
}

fn lx_stat(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_stat_path(args[0], args[1], true))
}

fn lx_lstat(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_stat_path(args[0], args[1], false))
}

fn lx_fstat(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_fstat(args[0], args[1]))
}

fn lx_lseek(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let Some(whence) = Whence::from_native(args[2]) else {
        return Outcome::err(Errno::EINVAL);
    };
    done(shared::sys_lseek(args[0], args[1] as i64, whence))
}

fn lx_mmap(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let (addr, len, prot, flags, fd, off) = (
        args[0],
        args[1],
        args[2],
        args[3],
        args[4] as i64,
        args[5],
    );
    done(shared::sys_mmap(
        addr,
        len,
        prot_from_linux(prot),
        flags & MAP_FIXED != 0,
        flags & MAP_ANONYMOUS != 0,
        fd as i32 as i64,
        off,
    ))
}

fn lx_mprotect(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_mprotect(
        args[0],
        args[1],
        prot_from_linux(args[2]),
    ))
}

fn lx_munmap(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_munmap(args[0], args[1]))
}

/// brk: grow or shrink the program break; returns the (possibly
/// unchanged) break. Failure reports the old break, as Linux does.
fn lx_brk(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    let request = args[0];
    let result = (|| -> KernelResult<i64> {
        let pid = sched::current_process_id()?;
        let mut table = PROCESS_TABLE.lock();
        let process = table
            .process_mut(pid)
            .ok_or(ProcessError::NotFound { pid: pid.0 })?;
        let memory = &mut process.memory;

        if request == 0 || request < memory.brk_base {
            return Ok(memory.brk as i64);
        }

        let old_end = (memory.brk as usize).next_multiple_of(PAGE_SIZE) as u64;
        let new_end = (request as usize).next_multiple_of(PAGE_SIZE) as u64;
        let mut frames = FRAME_ALLOCATOR.lock();
        if new_end > old_end {
            memory.vmas.map_anon(
                &memory.space,
                &mut frames,
                old_end,
                new_end - old_end,
                VmaFlags::READ | VmaFlags::WRITE,
            )?;
        } else if new_end < old_end {
            memory
                .vmas
                .remove(&memory.space, &mut frames, new_end, old_end - new_end)?;
        }
        memory.brk = request;
        Ok(request as i64)
    })();
    match result {
        Ok(value) => Outcome::Done(value),
        // brk never returns an errno; the caller sees the old break.
        Err(_) => {
            let old = sched::current_process_id()
                .ok()
                .and_then(|pid| PROCESS_TABLE.lock().process(pid).map(|p| p.memory.brk))
                .unwrap_or(0);
            Outcome::Done(old as i64)
        }
    }
}

fn lx_ioctl(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_ioctl(args[0], args[1], args[2]))
}

/// iovec as the Linux ABI lays it out.
#[repr(C)]
#[derive(Clone, Copy)]
struct IoVec {
    base: u64,
    len: u64,
}

const MAX_IOV: usize = 16;

fn read_iovec(pid: crate::process::ProcessId, iov: u64, cnt: usize) -> KernelResult<alloc::vec::Vec<IoVec>> {
    let table = PROCESS_TABLE.lock();
    let process = table
        .process(pid)
        .ok_or(ProcessError::NotFound { pid: pid.0 })?;
    let mut out = alloc::vec::Vec::with_capacity(cnt);
    for i in 0..cnt as u64 {
        let mut raw = [0u8; 16];
        user::copy_from_user(
            &process.memory.space,
            VirtualAddress::new(iov + i * 16),
            &mut raw,
        )?;
        out.push(IoVec {
            base: u64::from_le_bytes(raw[..8].try_into().unwrap_or([0; 8])),
            len: u64::from_le_bytes(raw[8..].try_into().unwrap_or([0; 8])),
        });
    }
    Ok(out)
}

fn lx_readv(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let (fd, iov, cnt) = (args[0], args[1], (args[2] as usize).min(MAX_IOV));
        let pid = sched::current_process_id()?;
        let vecs = read_iovec(pid, iov, cnt)?;
        let mut total = 0i64;
        for vec in vecs {
            let n = shared::sys_read(fd, vec.base, vec.len)?;
            total += n;
            if (n as u64) < vec.len {
                break;
            }
        }
        Ok(total)
    })())
}

fn lx_writev(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let (fd, iov, cnt) = (args[0], args[1], (args[2] as usize).min(MAX_IOV));
        let pid = sched::current_process_id()?;
        let vecs = read_iovec(pid, iov, cnt)?;
        let mut total = 0i64;
        for vec in vecs {
            let n = shared::sys_write(fd, vec.base, vec.len)?;
            total += n;
            if (n as u64) < vec.len {
                break;
            }
        }
        Ok(total)
    })())
}

fn lx_dup(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_dup(args[0]))
}

fn lx_dup2(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_dup2(args[0], args[1]))
}

fn lx_fork(frame: &mut TrapFrame, _args: [u64; 6]) -> Outcome {
    shared::sys_fork(frame)
}

fn lx_execve(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    shared::sys_execve(frame, args[0], args[1], args[2])
}

fn lx_exit(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    shared::sys_exit(frame, args[0] as i64)
}

fn lx_exit_group(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    shared::sys_exit_group(frame, args[0] as i64)
}

fn lx_wait4(frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    // rusage (arg 3) is accepted and ignored.
    shared::sys_wait(frame, args[0] as i64, args[1], args[2])
}

/// utsname: six fixed 65-byte fields.
fn lx_uname(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        const FIELD: usize = 65;
        let mut uts = [0u8; FIELD * 6];
        let fields: [&[u8]; 6] = [
            b"FerriteOS",
            b"ferrite",
            env!("CARGO_PKG_VERSION").as_bytes(),
            env!("GIT_HASH").as_bytes(),
            b"x86_64",
            b"",
        ];
        for (i, field) in fields.iter().enumerate() {
            let n = field.len().min(FIELD - 1);
            uts[i * FIELD..i * FIELD + n].copy_from_slice(&field[..n]);
        }

        let pid = sched::current_process_id()?;
        let table = PROCESS_TABLE.lock();
        let process = table
            .process(pid)
            .ok_or(ProcessError::NotFound { pid: pid.0 })?;
        user::copy_to_user(&process.memory.space, VirtualAddress::new(args[0]), &uts)?;
        Ok(0)
    })())
}

fn lx_arch_prctl(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let (code, addr) = (args[0], args[1]);
        let tid = sched::current_thread_id()?;
        let mut table = PROCESS_TABLE.lock();
        match code {
            ARCH_SET_FS | ARCH_SET_GS => {
                let thread = table
                    .thread_mut(tid)
                    .ok_or(ProcessError::ThreadNotFound { tid: tid.0 })?;
                if code == ARCH_SET_FS {
                    thread.tls.fs_base = addr;
                } else {
                    thread.tls.gs_base = addr;
                }
                let tls = thread.tls;
                crate::arch::set_tls(tls);
                Ok(0)
            }
            ARCH_GET_FS | ARCH_GET_GS => {
                let (pid, value) = {
                    let thread = table
                        .thread(tid)
                        .ok_or(ProcessError::ThreadNotFound { tid: tid.0 })?;
                    let value = if code == ARCH_GET_FS {
                        thread.tls.fs_base
                    } else {
                        thread.tls.gs_base
                    };
                    (thread.process, value)
                };
                let process = table
                    .process(pid)
                    .ok_or(ProcessError::NotFound { pid: pid.0 })?;
                user::copy_to_user(
                    &process.memory.space,
                    VirtualAddress::new(addr),
                    &value.to_le_bytes(),
                )?;
                Ok(0)
            }
            _ => Err(crate::error::SyscallError::InvalidArgument.into()),
        }
    })())
}

fn lx_gettid(_frame: &mut TrapFrame, _args: [u64; 6]) -> Outcome {
    done(sched::current_thread_id().map(|tid| tid.0 as i64))
}

fn lx_set_tid_address(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done((|| -> KernelResult<i64> {
        let tid = sched::current_thread_id()?;
        let mut table = PROCESS_TABLE.lock();
        let thread = table
            .thread_mut(tid)
            .ok_or(ProcessError::ThreadNotFound { tid: tid.0 })?;
        thread.clear_child_tid = args[0];
        Ok(tid.0 as i64)
    })())
}

fn lx_readlink(_frame: &mut TrapFrame, args: [u64; 6]) -> Outcome {
    done(shared::sys_readlink(args[0], args[1], args[2]))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn flag_translation() {
        let flags = open_flags_from_linux(O_RDWR | O_CREAT | O_TRUNC);
        assert!(flags.contains(OpenFlags::READ | OpenFlags::WRITE));
        assert!(flags.contains(OpenFlags::CREATE | OpenFlags::TRUNCATE));
        assert!(!flags.contains(OpenFlags::APPEND));

        // O_RDONLY is zero; reads still land.
        assert!(open_flags_from_linux(0).contains(OpenFlags::READ));

        let prot = prot_from_linux(PROT_READ | PROT_EXEC);
        assert!(prot.contains(VmaFlags::READ | VmaFlags::EXEC));
        assert!(!prot.contains(VmaFlags::WRITE));
    }

    #[test]
    fn table_holds_the_subset() {
        assert_eq!(lookup(NR_READ).map(|e| e.name), Some("read"));
        assert_eq!(lookup(NR_MMAP).map(|e| e.name), Some("mmap"));
        assert_eq!(lookup(NR_EXECVE).map(|e| e.name), Some("execve"));
        assert_eq!(lookup(NR_EXIT_GROUP).map(|e| e.name), Some("exit_group"));
        // Unimplemented slot inside the range: present, empty.
        assert!(lookup(7).map(|e| e.handler.is_none()).unwrap_or(false));
        // Past the end.
        assert!(lookup(LINUX_MAX).is_none());
    }
}
