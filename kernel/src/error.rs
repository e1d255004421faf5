//! Kernel error taxonomy
//!
//! Every internal component returns a typed error from this module; errors
//! bubble up unchanged until the syscall layer converts them to `-errno`.
//! The crash handler is the only terminal consumer.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    Memory(MemoryError),
    /// Process/thread lifecycle errors
    Process(ProcessError),
    /// Scheduler errors
    Sched(SchedError),
    /// IPC channel errors
    Ipc(IpcError),
    /// Filesystem adapter errors
    Fs(FsError),
    /// System call surface errors
    Syscall(SyscallError),
    /// Subsystem used before its one-shot init
    NotInitialized { subsystem: &'static str },
    /// Optional feature not built into this kernel
    NotSupported { operation: &'static str },
    /// exec target is not a runnable image
    ExecFormat,
}

/// Physical and virtual memory errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No run of free frames satisfies the request
    OutOfMemory,
    /// Frame released twice, or released while Free
    DoubleFree { frame: u64 },
    /// Frame index outside the managed range
    InvalidFrame { frame: u64 },
    /// Address not aligned for the requested page size
    Unaligned { addr: u64 },
    /// Mapping would shadow an existing present leaf
    AlreadyMapped { addr: u64 },
    /// No mapping exists at the address
    NotMapped { addr: u64 },
    /// Range overlaps an existing VMA
    VmaOverlap { addr: u64 },
    /// Address does not fall inside any VMA of the process
    NoVma { addr: u64 },
    /// Attempt to touch a kernel-global mapping from a user operation
    KernelRange { addr: u64 },
    /// Zero-length or otherwise impossible request
    InvalidSize,
}

/// Process and thread lifecycle errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    NotFound { pid: u32 },
    ThreadNotFound { tid: u32 },
    NotAChild { pid: u32 },
    NoChildren,
    TooManyProcesses,
    TooManyThreads,
    /// Operation requires a live process but the target is Zombie/Terminated
    Dead { pid: u32 },
}

/// Scheduler errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    QueueEmpty,
    InvalidPriority { priority: u8 },
    NoCurrentThread,
}

/// IPC channel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    IdNotFound { id: u32 },
    NameInUse,
    AlreadyAllocated { id: u32 },
    NotAllocated { id: u32 },
    /// Write attempted while the channel is not listening
    NotListening { id: u32 },
    /// Read attempted while a write is still pending
    StillListening { id: u32 },
    BufferTooSmall { have: usize, want: usize },
    TableFull,
}

/// Filesystem adapter errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    NotADirectory,
    IsADirectory,
    BadFileDescriptor,
    TooManyOpenFiles,
    InvalidPath,
    NotASymlink,
    NotSupported,
    IoError,
}

/// System call surface errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Number out of range or table slot empty
    NoSuchSyscall { nr: usize },
    /// Caller's effective uid exceeds the entry's minimum privilege
    PrivilegeTooLow { nr: usize },
    /// Pointer argument fails user-space validation
    BadUserPointer { addr: usize },
    /// Flag or argument value the surface does not understand
    InvalidArgument,
    /// String argument exceeds its per-call bound
    StringTooLong { max: usize },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl From<MemoryError> for KernelError {
    fn from(err: MemoryError) -> Self {
        Self::Memory(err)
    }
}

impl From<ProcessError> for KernelError {
    fn from(err: ProcessError) -> Self {
        Self::Process(err)
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::Sched(err)
    }
}

impl From<IpcError> for KernelError {
    fn from(err: IpcError) -> Self {
        Self::Ipc(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::Syscall(err)
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(e) => write!(f, "memory error: {:?}", e),
            Self::Process(e) => write!(f, "process error: {:?}", e),
            Self::Sched(e) => write!(f, "scheduler error: {:?}", e),
            Self::Ipc(e) => write!(f, "ipc error: {:?}", e),
            Self::Fs(e) => write!(f, "fs error: {:?}", e),
            Self::Syscall(e) => write!(f, "syscall error: {:?}", e),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
            Self::NotSupported { operation } => write!(f, "not supported: {}", operation),
            Self::ExecFormat => write!(f, "exec format error"),
        }
    }
}

/// POSIX errno values, as returned (negated) by the syscall surface.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    E2BIG = 7,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    EBUSY = 16,
    EEXIST = 17,
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    ENOTTY = 25,
    ESPIPE = 29,
    EROFS = 30,
    EPIPE = 32,
    ERANGE = 34,
    ENAMETOOLONG = 36,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    ELOOP = 40,
}

impl Errno {
    /// The negative value stored in the frame's result register.
    pub const fn as_ret(self) -> i64 {
        -(self as i32 as i64)
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::Memory(e) => match e {
                MemoryError::OutOfMemory => Errno::ENOMEM,
                MemoryError::Unaligned { .. }
                | MemoryError::InvalidSize
                | MemoryError::VmaOverlap { .. }
                | MemoryError::AlreadyMapped { .. } => Errno::EINVAL,
                MemoryError::KernelRange { .. } => Errno::ENOMEM,
                MemoryError::NotMapped { .. } | MemoryError::NoVma { .. } => Errno::EFAULT,
                MemoryError::DoubleFree { .. } | MemoryError::InvalidFrame { .. } => Errno::EINVAL,
            },
            KernelError::Process(e) => match e {
                ProcessError::NotFound { .. } | ProcessError::ThreadNotFound { .. } => Errno::ESRCH,
                ProcessError::NotAChild { .. } | ProcessError::NoChildren => Errno::ECHILD,
                ProcessError::TooManyProcesses | ProcessError::TooManyThreads => Errno::EAGAIN,
                ProcessError::Dead { .. } => Errno::ESRCH,
            },
            KernelError::Sched(_) => Errno::EAGAIN,
            KernelError::Ipc(e) => match e {
                IpcError::IdNotFound { .. } => Errno::ENOENT,
                IpcError::NameInUse | IpcError::AlreadyAllocated { .. } => Errno::EEXIST,
                IpcError::NotAllocated { .. }
                | IpcError::NotListening { .. }
                | IpcError::StillListening { .. } => Errno::EBUSY,
                IpcError::BufferTooSmall { .. } => Errno::ERANGE,
                IpcError::TableFull => Errno::EMFILE,
            },
            KernelError::Fs(e) => match e {
                FsError::NotFound => Errno::ENOENT,
                FsError::AlreadyExists => Errno::EEXIST,
                FsError::PermissionDenied => Errno::EACCES,
                FsError::NotADirectory => Errno::ENOTDIR,
                FsError::IsADirectory => Errno::EISDIR,
                FsError::BadFileDescriptor => Errno::EBADF,
                FsError::TooManyOpenFiles => Errno::EMFILE,
                FsError::InvalidPath => Errno::EINVAL,
                FsError::NotASymlink => Errno::EINVAL,
                FsError::NotSupported => Errno::ENOTTY,
                FsError::IoError => Errno::EIO,
            },
            KernelError::Syscall(e) => match e {
                SyscallError::NoSuchSyscall { .. } => Errno::ENOSYS,
                SyscallError::PrivilegeTooLow { .. } => Errno::EPERM,
                SyscallError::BadUserPointer { .. } => Errno::EFAULT,
                SyscallError::InvalidArgument => Errno::EINVAL,
                SyscallError::StringTooLong { .. } => Errno::ENAMETOOLONG,
            },
            KernelError::NotInitialized { .. } => Errno::EAGAIN,
            KernelError::NotSupported { .. } => Errno::ENOSYS,
            KernelError::ExecFormat => Errno::ENOEXEC,
        }
    }
}

/// Convenience: the `-errno` value for a kernel error.
pub fn errno_ret(err: KernelError) -> i64 {
    Errno::from(err).as_ret()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn enosys_is_38() {
        assert_eq!(Errno::ENOSYS as i32, 38);
        assert_eq!(Errno::ENOSYS.as_ret(), -38);
    }

    #[test]
    fn memory_errors_map_to_posix() {
        assert_eq!(
            Errno::from(KernelError::from(MemoryError::OutOfMemory)),
            Errno::ENOMEM
        );
        assert_eq!(
            Errno::from(KernelError::from(MemoryError::NotMapped { addr: 0x1000 })),
            Errno::EFAULT
        );
        assert_eq!(
            Errno::from(KernelError::from(ProcessError::NotAChild { pid: 7 })),
            Errno::ECHILD
        );
    }
}
