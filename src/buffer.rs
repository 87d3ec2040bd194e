//! Bounded byte staging used for both directions of a channel.
use std::io::{self, Read, Write};

use bytes::BytesMut;

/// A growable byte accumulator with a hard capacity.
///
/// Appends never take the buffer past its capacity: `append` accepts as much
/// as fits and reports how much that was.
#[derive(Debug)]
pub struct ByteBuffer {
    buf: BytesMut,
    limit: usize,
}

impl ByteBuffer {
    #[inline]
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit),
            limit,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.limit
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    /// Append up to the remaining capacity; returns the number of bytes taken.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        self.buf.extend_from_slice(&data[..n]);
        n
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `n` bytes off the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Read at most `max` bytes (and never past capacity) from `reader`.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        let want = max.min(self.remaining());
        if want == 0 {
            return Ok(0);
        }
        let start = self.buf.len();
        self.buf.resize(start + want, 0);
        match reader.read(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e)
            }
        }
    }
}

/// Writes accept as much as fits; a full buffer accepts nothing.
impl Write for ByteBuffer {
    #[inline]
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        Ok(self.append(data))
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
