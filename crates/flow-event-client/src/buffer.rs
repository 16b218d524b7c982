// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity receive buffer.
//!
//! The buffer never grows: its capacity is the hard upper bound on the size
//! of a single frame. Consumed frames are discarded by compacting the
//! remaining bytes to the front.

/// Byte region the transport reads into and the frame extractor reads from.
#[derive(Debug)]
pub struct RecvBuffer {
    bytes: Box<[u8]>,
    used: usize,
}

impl RecvBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Number of buffered, not-yet-consumed bytes.
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.bytes.len()
    }

    /// The buffered bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.used]
    }

    /// The writable tail the transport may read into; commit the bytes
    /// actually written with [`advance`](Self::advance).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.used..]
    }

    /// Mark `count` bytes of the spare region as filled.
    pub fn advance(&mut self, count: usize) {
        debug_assert!(count <= self.bytes.len() - self.used);
        self.used = (self.used + count).min(self.bytes.len());
    }

    /// Append as much of `data` as fits; returns the number of bytes copied.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.bytes.len() - self.used);
        self.bytes[self.used..self.used + count].copy_from_slice(&data[..count]);
        self.used += count;
        count
    }

    /// Discard `count` bytes from the front, compacting the remainder.
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.used);
        let count = count.min(self.used);
        self.bytes.copy_within(count..self.used, 0);
        self.used -= count;
    }

    pub fn clear(&mut self) {
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_consume() {
        let mut buf = RecvBuffer::new(8);
        assert_eq!(buf.extend_from_slice(b"abcdef"), 6);
        assert_eq!(buf.as_slice(), b"abcdef");

        buf.consume(2);
        assert_eq!(buf.as_slice(), b"cdef");
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_append_is_bounded_by_capacity() {
        let mut buf = RecvBuffer::new(4);
        assert_eq!(buf.extend_from_slice(b"abcdef"), 4);
        assert!(buf.is_full());
        assert_eq!(buf.extend_from_slice(b"gh"), 0);
        assert_eq!(buf.as_slice(), b"abcd");
    }

    #[test]
    fn test_spare_and_advance() {
        let mut buf = RecvBuffer::new(8);
        buf.extend_from_slice(b"ab");
        let spare = buf.spare_mut();
        assert_eq!(spare.len(), 6);
        spare[..2].copy_from_slice(b"cd");
        buf.advance(2);
        assert_eq!(buf.as_slice(), b"abcd");
    }

    #[test]
    fn test_consume_everything() {
        let mut buf = RecvBuffer::new(8);
        buf.extend_from_slice(b"abcd");
        buf.consume(4);
        assert!(buf.is_empty());
    }
}
