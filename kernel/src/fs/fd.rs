//! Per-process file descriptor tables
//!
//! Descriptors index into a fixed-size per-process table of shared file
//! descriptions. `dup`/`dup2` and fork share the description (and thus the
//! offset), matching POSIX; the vnode reference drops when the last
//! description holding it goes away.

extern crate alloc;

use alloc::sync::Arc;

use spin::Mutex;

use super::{vfs, OpenFlags, VnodeId};
use crate::error::FsError;

/// Size of every per-process descriptor table.
pub const MAX_FDS: usize = 256;

/// One open file: vnode handle, cursor, flags and mode.
pub struct FileDescription {
    pub vnode: VnodeId,
    pub offset: Mutex<u64>,
    pub flags: OpenFlags,
    pub mode: u32,
}

impl FileDescription {
    pub fn new(vnode: VnodeId, flags: OpenFlags, mode: u32) -> Self {
        Self {
            vnode,
            offset: Mutex::new(0),
            flags,
            mode,
        }
    }
}

impl Drop for FileDescription {
    fn drop(&mut self) {
        // Last reference to this description: hand the vnode back.
        if let Ok(vfs) = vfs() {
            (vfs.release)(self.vnode);
        }
    }
}

/// The table. A spinlock-free design is unnecessary: the owning process
/// serializes syscalls per thread and the slots are Arcs.
pub struct FdTable {
    slots: [Option<Arc<FileDescription>>; MAX_FDS],
}

impl FdTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { None }; MAX_FDS],
        }
    }

    /// Install a description at the lowest free slot.
    pub fn allocate(&mut self, desc: Arc<FileDescription>) -> Result<usize, FsError> {
        for (fd, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(desc);
                return Ok(fd);
            }
        }
        Err(FsError::TooManyOpenFiles)
    }

    /// Install a description at a specific slot (dup2, stdio wiring).
    pub fn install(&mut self, fd: usize, desc: Arc<FileDescription>) -> Result<(), FsError> {
        if fd >= MAX_FDS {
            return Err(FsError::BadFileDescriptor);
        }
        self.slots[fd] = Some(desc);
        Ok(())
    }

    pub fn get(&self, fd: usize) -> Result<Arc<FileDescription>, FsError> {
        self.slots
            .get(fd)
            .and_then(|slot| slot.clone())
            .ok_or(FsError::BadFileDescriptor)
    }

    pub fn close(&mut self, fd: usize) -> Result<(), FsError> {
        if fd >= MAX_FDS || self.slots[fd].is_none() {
            return Err(FsError::BadFileDescriptor);
        }
        self.slots[fd] = None;
        Ok(())
    }

    /// dup: new lowest descriptor sharing the description.
    pub fn dup(&mut self, fd: usize) -> Result<usize, FsError> {
        let desc = self.get(fd)?;
        self.allocate(desc)
    }

    /// dup2: place `old`'s description at `new`, closing whatever was
    /// there. dup2(fd, fd) is a no-op returning fd.
    pub fn dup2(&mut self, old: usize, new: usize) -> Result<usize, FsError> {
        let desc = self.get(old)?;
        if new >= MAX_FDS {
            return Err(FsError::BadFileDescriptor);
        }
        if old != new {
            self.slots[new] = Some(desc);
        }
        Ok(new)
    }

    /// Fork: the child shares every description.
    pub fn clone_for_fork(&self) -> Self {
        let mut table = Self::new();
        for (fd, slot) in self.slots.iter().enumerate() {
            table.slots[fd] = slot.clone();
        }
        table
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn desc(vnode: VnodeId) -> Arc<FileDescription> {
        Arc::new(FileDescription::new(vnode, OpenFlags::READ, 0))
    }

    #[test]
    fn lowest_free_slot_allocation() {
        let mut table = FdTable::new();
        assert_eq!(table.allocate(desc(1)).expect("fd 0"), 0);
        assert_eq!(table.allocate(desc(2)).expect("fd 1"), 1);
        assert_eq!(table.allocate(desc(3)).expect("fd 2"), 2);
        table.close(1).expect("close fd 1");
        assert_eq!(table.allocate(desc(4)).expect("reuses fd 1"), 1);
    }

    #[test]
    fn dup_shares_offset() {
        let mut table = FdTable::new();
        let fd = table.allocate(desc(9)).expect("fd");
        let dup = table.dup(fd).expect("dup");
        *table.get(fd).expect("fd").offset.lock() = 42;
        assert_eq!(*table.get(dup).expect("dup").offset.lock(), 42);
    }

    #[test]
    fn dup2_replaces_target() {
        let mut table = FdTable::new();
        let a = table.allocate(desc(1)).expect("a");
        let b = table.allocate(desc(2)).expect("b");
        table.dup2(a, b).expect("dup2");
        assert_eq!(table.get(b).expect("b").vnode, 1);
        // Self-dup is a no-op.
        assert_eq!(table.dup2(a, a).expect("self"), a);
    }

    #[test]
    fn bad_fd_errors() {
        let mut table = FdTable::new();
        assert_eq!(table.get(7).err(), Some(FsError::BadFileDescriptor));
        assert_eq!(table.close(7).err(), Some(FsError::BadFileDescriptor));
        assert_eq!(table.dup(999).err(), Some(FsError::BadFileDescriptor));
    }

    #[test]
    fn fork_shares_descriptions() {
        let mut table = FdTable::new();
        let fd = table.allocate(desc(5)).expect("fd");
        let child = table.clone_for_fork();
        *child.get(fd).expect("shared").offset.lock() = 7;
        assert_eq!(*table.get(fd).expect("parent view").offset.lock(), 7);
        assert_eq!(child.open_count(), 1);
    }
}
