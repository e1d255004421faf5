//! VFS adapter
//!
//! The core does not implement filesystems; it consumes a narrow [`Vfs`]
//! capability installed at bring-up. The capability is a plain struct of
//! operation functions (no trait objects, no inheritance): the filesystem
//! collaborator fills it in, the syscall layer calls through it, and the
//! per-process fd tables live on this side of the boundary.

extern crate alloc;

use alloc::string::String;

use spin::Once;

use crate::error::FsError;

pub mod fd;
pub mod ram;

pub use fd::{FdTable, FileDescription, MAX_FDS};

/// Opaque vnode handle minted by the provider.
pub type VnodeId = u64;

bitflags::bitflags! {
    /// Native open flags. The Linux table translates `O_*` into these at
    /// entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const CREATE   = 1 << 2;
        const TRUNCATE = 1 << 3;
        const APPEND   = 1 << 4;
        const EXCL     = 1 << 5;
    }
}

/// Seek anchors, native values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Current = 1,
    End = 2,
}

impl Whence {
    pub fn from_native(value: u64) -> Option<Self> {
        match value {
            0 => Some(Whence::Set),
            1 => Some(Whence::Current),
            2 => Some(Whence::End),
            _ => None,
        }
    }
}

/// File metadata, laid out for copy-out to user space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub _pad0: u32,
    pub rdev: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

/// The capability object. Every operation the core needs from a
/// filesystem, and nothing more.
#[derive(Clone, Copy)]
pub struct Vfs {
    pub open: fn(path: &str, flags: OpenFlags, mode: u32) -> Result<VnodeId, FsError>,
    /// Drop one reference to a vnode; the provider reclaims it at zero.
    pub release: fn(vnode: VnodeId),
    pub read: fn(vnode: VnodeId, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>,
    pub write: fn(vnode: VnodeId, offset: u64, buf: &[u8]) -> Result<usize, FsError>,
    pub size: fn(vnode: VnodeId) -> Result<u64, FsError>,
    pub fstat: fn(vnode: VnodeId) -> Result<Stat, FsError>,
    /// `follow` distinguishes stat from lstat.
    pub stat: fn(path: &str, follow: bool) -> Result<Stat, FsError>,
    pub ioctl: fn(vnode: VnodeId, request: u64, argp: u64) -> Result<i64, FsError>,
    pub readlink: fn(path: &str, buf: &mut [u8]) -> Result<usize, FsError>,
}

static VFS: Once<Vfs> = Once::new();

/// Install the filesystem capability. First caller wins; bring-up installs
/// the ram provider unless a real filesystem got there first.
pub fn install(vfs: Vfs) {
    VFS.call_once(|| vfs);
}

pub fn vfs() -> Result<&'static Vfs, FsError> {
    VFS.get().ok_or(FsError::NotSupported)
}

/// Resolve `path` against `cwd`, normalizing `.` and `..`. The result is
/// always absolute.
pub fn resolve_path(cwd: &str, path: &str) -> String {
    let mut out: alloc::vec::Vec<&str> = alloc::vec::Vec::new();
    let joined = if path.starts_with('/') {
        String::from(path)
    } else {
        alloc::format!("{}/{}", cwd, path)
    };
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    let mut result = String::from("/");
    result.push_str(&out.join("/"));
    result
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn path_resolution() {
        assert_eq!(resolve_path("/home", "file"), "/home/file");
        assert_eq!(resolve_path("/home", "/etc/passwd"), "/etc/passwd");
        assert_eq!(resolve_path("/a/b", "../c"), "/a/c");
        assert_eq!(resolve_path("/", "./x/./y"), "/x/y");
        assert_eq!(resolve_path("/a", "../../../z"), "/z");
    }

    #[test]
    fn whence_values() {
        assert_eq!(Whence::from_native(0), Some(Whence::Set));
        assert_eq!(Whence::from_native(1), Some(Whence::Current));
        assert_eq!(Whence::from_native(2), Some(Whence::End));
        assert_eq!(Whence::from_native(7), None);
    }
}
