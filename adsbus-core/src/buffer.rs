//! Fixed-capacity receive buffer shared by every stream-oriented peer.
//!
//! Data lives in `storage[start..start + len]`. `fill` compacts only when the
//! tail is physically at the end of storage, so parsers usually see a stable
//! slice across calls.

use std::io::{self, Read};

use crate::types::{AdsbusError, Result};

/// Large enough for the longest JSON header line plus a frame behind it.
pub const BUF_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct RingBuffer {
    storage: Box<[u8]>,
    start: usize,
    len: usize,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    pub fn new() -> Self {
        Self::with_capacity(BUF_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        RingBuffer {
            storage: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// No free space even after compaction: the contents can never parse.
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn start(&self) -> usize {
        self.start
    }

    /// Unconsumed bytes.
    pub fn data(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    /// Read once from `reader` into free space. Returns 0 on EOF.
    ///
    /// A full buffer is an error: the caller failed to parse anything out of
    /// a whole buffer's worth of data.
    pub fn fill<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.is_full() {
            return Err(io::Error::other(AdsbusError::BufferFull(self.capacity())));
        }
        if self.start + self.len == self.capacity() {
            self.compact();
        }
        let end = self.start + self.len;
        let n = reader.read(&mut self.storage[end..])?;
        self.len += n;
        Ok(n)
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) -> Result<()> {
        if n > self.len {
            return Err(AdsbusError::Underflow {
                requested: n,
                available: self.len,
            });
        }
        self.start += n;
        self.len -= n;
        if self.len == 0 {
            self.start = 0;
        }
        Ok(())
    }

    /// Discard everything.
    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.storage
            .copy_within(self.start..self.start + self.len, 0);
        self.start = 0;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
