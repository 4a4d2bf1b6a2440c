//! Outbound byte buffer with resumable partial writes

use bytes::{Buf, BytesMut};
use std::io;

/// Result of one [`OutboundBuffer::drain`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drain {
    /// Bytes the writer accepted
    pub written: usize,
    /// The buffer held data before the call and is empty now
    pub emptied: bool,
}

/// Bytes a writer could not take yet
///
/// Everything before the read position has been handed to the writer; the
/// storage is reclaimed by `BytesMut` as the front is consumed.
#[derive(Debug, Default)]
pub struct OutboundBuffer {
    buf: BytesMut,
}

impl OutboundBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Unconsumed bytes, in order
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Mark `n` leading bytes as written
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n.min(self.buf.len()));
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Hand the unconsumed bytes to `write` once
    ///
    /// `WouldBlock` counts as zero bytes accepted; any other error is
    /// returned and leaves the buffer untouched.
    pub fn drain<F>(&mut self, mut write: F) -> io::Result<Drain>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        if self.buf.is_empty() {
            return Ok(Drain {
                written: 0,
                emptied: false,
            });
        }

        let written = match write(&self.buf) {
            Ok(n) => n.min(self.buf.len()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e),
        };
        self.buf.advance(written);

        Ok(Drain {
            written,
            emptied: self.buf.is_empty(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_drain_resumes() {
        let mut buffer = OutboundBuffer::new();
        buffer.append(b"hello ");
        buffer.append(b"world");

        let mut out = Vec::new();
        let first = buffer
            .drain(|data| {
                out.extend_from_slice(&data[..4]);
                Ok(4)
            })
            .unwrap();
        assert_eq!(first, Drain { written: 4, emptied: false });
        assert_eq!(buffer.pending(), b"o world");

        let second = buffer
            .drain(|data| {
                out.extend_from_slice(data);
                Ok(data.len())
            })
            .unwrap();
        assert!(second.emptied);
        assert_eq!(out, b"hello world");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_would_block_keeps_data() {
        let mut buffer = OutboundBuffer::new();
        buffer.append(b"abc");

        let drain = buffer
            .drain(|_| Err(io::Error::from(io::ErrorKind::WouldBlock)))
            .unwrap();
        assert_eq!(drain.written, 0);
        assert_eq!(buffer.len(), 3);

        let err = buffer
            .drain(|_| Err(io::Error::from(io::ErrorKind::BrokenPipe)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_empty_drain_is_not_emptied() {
        let mut buffer = OutboundBuffer::new();
        let drain = buffer.drain(|data| Ok(data.len())).unwrap();
        assert!(!drain.emptied);
    }
}
