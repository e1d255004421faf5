//! In-memory filesystem provider
//!
//! A deliberately small provider backing the VFS capability for bring-up
//! and tests: flat path table, byte-vector files, symlinks, and a console
//! node wired to the kernel log sink. Real filesystems live outside the
//! core and install their own capability.

extern crate alloc;

use alloc::{
    collections::BTreeMap,
    string::{String, ToString},
    vec::Vec,
};

use spin::Mutex;

use super::{OpenFlags, Stat, Vfs, VnodeId};
use crate::error::FsError;

const MODE_FILE: u32 = 0o100000;
const MODE_SYMLINK: u32 = 0o120000;
const MODE_CHAR: u32 = 0o020000;

struct RamNode {
    data: Vec<u8>,
    mode: u32,
    /// Symlink target when mode says so
    target: Option<String>,
    /// Open references; node garbage-collects at zero once unlinked
    refs: u32,
    console: bool,
}

struct RamFs {
    nodes: BTreeMap<VnodeId, RamNode>,
    paths: BTreeMap<String, VnodeId>,
    next_id: VnodeId,
}

impl RamFs {
    const fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            paths: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, path: &str, data: Vec<u8>, mode: u32, target: Option<String>) -> VnodeId {
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.insert(
            id,
            RamNode {
                data,
                mode,
                target,
                refs: 0,
                console: false,
            },
        );
        self.paths.insert(path.to_string(), id);
        id
    }

    fn lookup(&self, path: &str, follow: bool) -> Result<VnodeId, FsError> {
        let mut current = path.to_string();
        // Bounded symlink chase.
        for _ in 0..8 {
            let id = *self.paths.get(&current).ok_or(FsError::NotFound)?;
            let node = self.nodes.get(&id).ok_or(FsError::NotFound)?;
            match (&node.target, follow) {
                (Some(target), true) => current = target.clone(),
                _ => return Ok(id),
            }
        }
        Err(FsError::InvalidPath)
    }
}

static RAMFS: Mutex<RamFs> = Mutex::new(RamFs::new());

/// Seed a file; used by bring-up (module blobs) and tests.
pub fn add_file(path: &str, data: &[u8]) {
    let mut fs = RAMFS.lock();
    fs.insert(path, data.to_vec(), MODE_FILE | 0o644, None);
}

/// Seed a symlink.
pub fn add_symlink(path: &str, target: &str) {
    let mut fs = RAMFS.lock();
    fs.insert(path, Vec::new(), MODE_SYMLINK | 0o777, Some(target.to_string()));
}

fn ensure_console(fs: &mut RamFs) -> VnodeId {
    if let Some(&id) = fs.paths.get("/dev/console") {
        return id;
    }
    let id = fs.insert("/dev/console", Vec::new(), MODE_CHAR | 0o666, None);
    if let Some(node) = fs.nodes.get_mut(&id) {
        node.console = true;
    }
    id
}

fn op_open(path: &str, flags: OpenFlags, mode: u32) -> Result<VnodeId, FsError> {
    let mut fs = RAMFS.lock();
    if path == "/dev/console" {
        let id = ensure_console(&mut fs);
        if let Some(node) = fs.nodes.get_mut(&id) {
            node.refs += 1;
        }
        return Ok(id);
    }
    match fs.lookup(path, true) {
        Ok(id) => {
            if flags.contains(OpenFlags::CREATE) && flags.contains(OpenFlags::EXCL) {
                return Err(FsError::AlreadyExists);
            }
            if flags.contains(OpenFlags::TRUNCATE) {
                if let Some(node) = fs.nodes.get_mut(&id) {
                    node.data.clear();
                }
            }
            if let Some(node) = fs.nodes.get_mut(&id) {
                node.refs += 1;
            }
            Ok(id)
        }
        Err(FsError::NotFound) if flags.contains(OpenFlags::CREATE) => {
            let id = fs.insert(path, Vec::new(), MODE_FILE | (mode & 0o7777), None);
            if let Some(node) = fs.nodes.get_mut(&id) {
                node.refs += 1;
            }
            Ok(id)
        }
        Err(e) => Err(e),
    }
}

fn op_release(vnode: VnodeId) {
    let mut fs = RAMFS.lock();
    if let Some(node) = fs.nodes.get_mut(&vnode) {
        node.refs = node.refs.saturating_sub(1);
    }
}

fn op_read(vnode: VnodeId, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
    let fs = RAMFS.lock();
    let node = fs.nodes.get(&vnode).ok_or(FsError::BadFileDescriptor)?;
    if node.console {
        // No input source in the core.
        return Ok(0);
    }
    let offset = offset as usize;
    if offset >= node.data.len() {
        return Ok(0);
    }
    let n = buf.len().min(node.data.len() - offset);
    buf[..n].copy_from_slice(&node.data[offset..offset + n]);
    Ok(n)
}

fn op_write(vnode: VnodeId, offset: u64, buf: &[u8]) -> Result<usize, FsError> {
    let mut fs = RAMFS.lock();
    let node = fs.nodes.get_mut(&vnode).ok_or(FsError::BadFileDescriptor)?;
    if node.console {
        crate::logger::write_bytes(buf);
        return Ok(buf.len());
    }
    let offset = offset as usize;
    if node.data.len() < offset + buf.len() {
        node.data.resize(offset + buf.len(), 0);
    }
    node.data[offset..offset + buf.len()].copy_from_slice(buf);
    Ok(buf.len())
}

fn op_size(vnode: VnodeId) -> Result<u64, FsError> {
    let fs = RAMFS.lock();
    let node = fs.nodes.get(&vnode).ok_or(FsError::BadFileDescriptor)?;
    Ok(node.data.len() as u64)
}

fn stat_of(node: &RamNode, ino: VnodeId) -> Stat {
    Stat {
        dev: 1,
        ino,
        nlink: 1,
        mode: node.mode,
        uid: 0,
        gid: 0,
        _pad0: 0,
        rdev: 0,
        size: node.data.len() as i64,
        blksize: 512,
        blocks: (node.data.len() as i64 + 511) / 512,
        atime: 0,
        mtime: 0,
        ctime: 0,
    }
}

fn op_fstat(vnode: VnodeId) -> Result<Stat, FsError> {
    let fs = RAMFS.lock();
    let node = fs.nodes.get(&vnode).ok_or(FsError::BadFileDescriptor)?;
    Ok(stat_of(node, vnode))
}

fn op_stat(path: &str, follow: bool) -> Result<Stat, FsError> {
    let fs = RAMFS.lock();
    let id = fs.lookup(path, follow)?;
    let node = fs.nodes.get(&id).ok_or(FsError::NotFound)?;
    Ok(stat_of(node, id))
}

fn op_ioctl(vnode: VnodeId, _request: u64, _argp: u64) -> Result<i64, FsError> {
    let fs = RAMFS.lock();
    let node = fs.nodes.get(&vnode).ok_or(FsError::BadFileDescriptor)?;
    if node.console {
        // The console answers nothing but exists.
        return Ok(0);
    }
    Err(FsError::NotSupported)
}

fn op_readlink(path: &str, buf: &mut [u8]) -> Result<usize, FsError> {
    let fs = RAMFS.lock();
    let id = fs.lookup(path, false)?;
    let node = fs.nodes.get(&id).ok_or(FsError::NotFound)?;
    let target = node.target.as_ref().ok_or(FsError::NotASymlink)?;
    let n = buf.len().min(target.len());
    buf[..n].copy_from_slice(&target.as_bytes()[..n]);
    Ok(n)
}

/// The capability this provider exposes.
pub fn capability() -> Vfs {
    Vfs {
        open: op_open,
        release: op_release,
        read: op_read,
        write: op_write,
        size: op_size,
        fstat: op_fstat,
        stat: op_stat,
        ioctl: op_ioctl,
        readlink: op_readlink,
    }
}

/// Install the ram provider as the system VFS (first install wins).
pub fn init() {
    super::install(capability());
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn open_missing_without_create_is_enoent() {
        assert_eq!(
            op_open("/no/such/file", OpenFlags::READ, 0).err(),
            Some(FsError::NotFound)
        );
    }

    #[test]
    fn create_write_read_roundtrip() {
        let id = op_open(
            "/tmp/roundtrip",
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
            0o644,
        )
        .expect("create");
        op_write(id, 0, b"hello").expect("write");
        let mut buf = [0u8; 16];
        let n = op_read(id, 0, &mut buf).expect("read");
        assert_eq!(&buf[..n], b"hello");
        // Offset reads past EOF return 0.
        assert_eq!(op_read(id, 100, &mut buf).expect("eof"), 0);
        assert_eq!(op_size(id).expect("size"), 5);
    }

    #[test]
    fn symlink_stat_vs_lstat() {
        add_file("/data/real-target", b"x");
        add_symlink("/data/link", "/data/real-target");

        let followed = op_stat("/data/link", true).expect("stat follows");
        assert_eq!(followed.mode & 0o170000, MODE_FILE);
        let not_followed = op_stat("/data/link", false).expect("lstat does not");
        assert_eq!(not_followed.mode & 0o170000, MODE_SYMLINK);

        let mut buf = [0u8; 64];
        let n = op_readlink("/data/link", &mut buf).expect("readlink");
        assert_eq!(&buf[..n], b"/data/real-target");
        assert_eq!(
            op_readlink("/data/real-target", &mut buf).err(),
            Some(FsError::NotASymlink)
        );
    }
}
