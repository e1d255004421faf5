//! IPC channels
//!
//! Named message channels owned by a process. A channel is a single fixed
//! buffer with a `listening` latch: writers may store while the channel
//! listens (the write clears the latch), readers may load once a write has
//! completed. `wait` support lives in the scheduler (threads block on a
//! channel id and the completing write wakes them).
//!
//! Forking a process deep-copies its table: same ids and names, fresh
//! buffers, so parent-side senders never reach the child.

extern crate alloc;

use alloc::{vec, vec::Vec};

use crate::error::IpcError;

/// Channel id, process-local.
pub type ChannelId = u32;

/// Channel flavor requested at creation. The core treats them alike; the
/// type is kept for providers layered on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Buffer,
    Pipe,
    Socket,
}

impl ChannelType {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            1 => ChannelType::Pipe,
            2 => ChannelType::Socket,
            _ => ChannelType::Buffer,
        }
    }
}

/// Name token, fixed 16 bytes like the native ABI passes it.
pub type ChannelToken = [u8; 16];

struct Channel {
    id: ChannelId,
    kind: ChannelType,
    token: ChannelToken,
    buffer: Option<Vec<u8>>,
    listening: bool,
}

/// Per-process channel table.
pub struct IpcTable {
    channels: Vec<Channel>,
    next_id: ChannelId,
}

/// Ceiling on channels per process.
pub const MAX_CHANNELS: usize = 64;

pub type Result<T> = core::result::Result<T, IpcError>;

impl IpcTable {
    pub const fn new() -> Self {
        Self {
            channels: Vec::new(),
            next_id: 0,
        }
    }

    fn channel(&self, id: ChannelId) -> Result<&Channel> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .ok_or(IpcError::IdNotFound { id })
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        self.channels
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(IpcError::IdNotFound { id })
    }

    /// Create an empty channel with a unique token; returns the local id.
    pub fn create(&mut self, kind: ChannelType, token: ChannelToken) -> Result<ChannelId> {
        if self.channels.len() >= MAX_CHANNELS {
            return Err(IpcError::TableFull);
        }
        if self.channels.iter().any(|c| c.token == token) {
            return Err(IpcError::NameInUse);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.channels.push(Channel {
            id,
            kind,
            token,
            buffer: None,
            listening: false,
        });
        Ok(id)
    }

    /// Attach the backing buffer. Size is fixed for the channel's life.
    pub fn allocate(&mut self, id: ChannelId, size: usize) -> Result<()> {
        if size == 0 {
            return Err(IpcError::BufferTooSmall { have: 0, want: 1 });
        }
        let channel = self.channel_mut(id)?;
        if channel.buffer.is_some() {
            return Err(IpcError::AlreadyAllocated { id });
        }
        channel.buffer = Some(vec![0; size]);
        Ok(())
    }

    /// Flip the write latch.
    pub fn listen(&mut self, id: ChannelId, on: bool) -> Result<()> {
        self.channel_mut(id)?.listening = on;
        Ok(())
    }

    pub fn is_listening(&self, id: ChannelId) -> Result<bool> {
        Ok(self.channel(id)?.listening)
    }

    /// Store a message. Permitted only while the channel listens; the
    /// completed write clears the latch so readers may proceed.
    pub fn write(&mut self, id: ChannelId, data: &[u8]) -> Result<usize> {
        let channel = self.channel_mut(id)?;
        if !channel.listening {
            return Err(IpcError::NotListening { id });
        }
        let buffer = channel
            .buffer
            .as_mut()
            .ok_or(IpcError::NotAllocated { id })?;
        if data.len() > buffer.len() {
            return Err(IpcError::BufferTooSmall {
                have: buffer.len(),
                want: data.len(),
            });
        }
        buffer[..data.len()].copy_from_slice(data);
        channel.listening = false;
        Ok(data.len())
    }

    /// Load the message. Permitted only after a write has completed (the
    /// channel is not listening). Does not change channel state.
    pub fn read(&self, id: ChannelId, out: &mut [u8]) -> Result<usize> {
        let channel = self.channel(id)?;
        if channel.listening {
            return Err(IpcError::StillListening { id });
        }
        let buffer = channel
            .buffer
            .as_ref()
            .ok_or(IpcError::NotAllocated { id })?;
        let n = out.len().min(buffer.len());
        out[..n].copy_from_slice(&buffer[..n]);
        Ok(n)
    }

    /// Free the buffer and remove the channel.
    pub fn destroy(&mut self, id: ChannelId) -> Result<()> {
        let index = self
            .channels
            .iter()
            .position(|c| c.id == id)
            .ok_or(IpcError::IdNotFound { id })?;
        self.channels.swap_remove(index);
        Ok(())
    }

    /// Fork semantics: duplicate every channel with the same id and token
    /// but a fresh zeroed buffer.
    pub fn clone_for_fork(&self) -> Self {
        let mut table = Self::new();
        table.next_id = self.next_id;
        for channel in &self.channels {
            table.channels.push(Channel {
                id: channel.id,
                kind: channel.kind,
                token: channel.token,
                buffer: channel.buffer.as_ref().map(|b| vec![0; b.len()]),
                listening: channel.listening,
            });
        }
        table
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for IpcTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a token from a byte string (tests and the syscall layer).
pub fn token(bytes: &[u8]) -> ChannelToken {
    let mut out = [0u8; 16];
    let n = bytes.len().min(16);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn create_requires_unique_token() {
        let mut table = IpcTable::new();
        let a = table
            .create(ChannelType::Buffer, token(b"chan-a"))
            .expect("first");
        assert_eq!(
            table.create(ChannelType::Buffer, token(b"chan-a")),
            Err(IpcError::NameInUse)
        );
        let b = table
            .create(ChannelType::Pipe, token(b"chan-b"))
            .expect("second");
        assert_ne!(a, b);
    }

    #[test]
    fn write_requires_listening_read_requires_written() {
        let mut table = IpcTable::new();
        let id = table
            .create(ChannelType::Buffer, token(b"wr"))
            .expect("create");
        table.allocate(id, 32).expect("allocate");

        // Not listening yet: writes refused.
        assert_eq!(
            table.write(id, b"hello"),
            Err(IpcError::NotListening { id })
        );

        table.listen(id, true).expect("listen");
        // Listening: reads refused.
        let mut buf = [0u8; 32];
        assert_eq!(table.read(id, &mut buf), Err(IpcError::StillListening { id }));

        // Write lands and clears the latch.
        assert_eq!(table.write(id, b"hello").expect("write"), 5);
        assert!(!table.is_listening(id).expect("latch"));

        // Read is repeatable and state-free.
        let n = table.read(id, &mut buf).expect("read");
        assert_eq!(&buf[..5], b"hello");
        assert!(n >= 5);
        table.read(id, &mut buf).expect("read again");
    }

    #[test]
    fn write_respects_fixed_buffer_size() {
        let mut table = IpcTable::new();
        let id = table
            .create(ChannelType::Buffer, token(b"small"))
            .expect("create");
        table.allocate(id, 4).expect("allocate");
        assert_eq!(
            table.allocate(id, 8),
            Err(IpcError::AlreadyAllocated { id })
        );
        table.listen(id, true).expect("listen");
        assert_eq!(
            table.write(id, b"too long"),
            Err(IpcError::BufferTooSmall { have: 4, want: 8 })
        );
    }

    #[test]
    fn fork_copies_channels_with_fresh_buffers() {
        let mut table = IpcTable::new();
        let id = table
            .create(ChannelType::Buffer, token(b"forked"))
            .expect("create");
        table.allocate(id, 16).expect("allocate");
        table.listen(id, true).expect("listen");
        table.write(id, b"parent data").expect("write");

        let child = table.clone_for_fork();
        // Same id exists, but the parent's message did not cross.
        let mut buf = [0u8; 16];
        child.read(id, &mut buf).expect("child read");
        assert_eq!(&buf[..11], &[0u8; 11]);

        let mut parent_buf = [0u8; 16];
        table.read(id, &mut parent_buf).expect("parent read");
        assert_eq!(&parent_buf[..11], b"parent data");
    }

    #[test]
    fn destroy_removes_channel() {
        let mut table = IpcTable::new();
        let id = table
            .create(ChannelType::Buffer, token(b"gone"))
            .expect("create");
        table.destroy(id).expect("destroy");
        assert_eq!(table.destroy(id), Err(IpcError::IdNotFound { id }));
        assert!(table.is_empty());
    }
}
