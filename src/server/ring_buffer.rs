// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-capacity byte ring buffer with overwrite-on-full semantics.
//!
//! Each BroadcastPipe consumer owns one of these. A slow consumer never
//! blocks or slows the producer: once the buffer is full, the oldest bytes
//! are silently discarded to make room.

use std::collections::VecDeque;

/// A byte ring buffer owned by a single task. Not thread-safe by design —
/// each consumer task owns exactly one.
#[derive(Debug)]
pub struct RingBuffer {
    capacity: usize,
    data: VecDeque<u8>,
    bytes_written: u64,
    bytes_read: u64,
    overflows: u64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            data: VecDeque::with_capacity(capacity),
            bytes_written: 0,
            bytes_read: 0,
            overflows: 0,
        }
    }

    /// Append bytes, dropping the oldest bytes in the buffer if `bytes`
    /// would exceed capacity. `overflows` accumulates the number of bytes
    /// discarded, not the number of writes that discarded them.
    pub fn write(&mut self, bytes: &[u8]) {
        self.bytes_written += bytes.len() as u64;

        if bytes.len() >= self.capacity {
            self.overflows += (self.data.len() + bytes.len() - self.capacity) as u64;
            self.data.clear();
            let keep_from = bytes.len() - self.capacity;
            self.data.extend(&bytes[keep_from..]);
            return;
        }

        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            for _ in 0..overflow {
                self.data.pop_front();
            }
            self.overflows += overflow as u64;
        }
        self.data.extend(bytes);
    }

    /// Drain up to `max` bytes, oldest first.
    pub fn read(&mut self, max: usize) -> Vec<u8> {
        let n = max.min(self.data.len());
        let out: Vec<u8> = self.data.drain(..n).collect();
        self.bytes_read += out.len() as u64;
        out
    }

    /// Drain every buffered byte.
    pub fn drain_all(&mut self) -> Vec<u8> {
        self.read(self.data.len())
    }

    /// Put bytes back at the front of the buffer, undoing a `read()` whose
    /// bytes a consumer's socket did not actually accept (would-block or a
    /// short write). `bytes_read` is corrected back down to match.
    pub fn unread(&mut self, bytes: &[u8]) {
        for b in bytes.iter().rev() {
            self.data.push_front(*b);
        }
        self.bytes_read -= bytes.len() as u64;
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn overflows(&self) -> u64 {
        self.overflows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let mut buf = RingBuffer::new(16);
        buf.write(b"hello");
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.read(5), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_overwrite_on_full_keeps_newest() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"ABCD");
        buf.write(b"EF");
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.read(4), b"CDEF");
        assert_eq!(buf.overflows(), 2);
    }

    #[test]
    fn test_single_write_larger_than_capacity_keeps_tail() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"ABCDEFGH");
        assert_eq!(buf.read(4), b"EFGH");
        assert_eq!(buf.overflows(), 4);
    }

    #[test]
    fn test_overflow_counts_bytes_not_events() {
        let mut buf = RingBuffer::new(8);
        // Chunked like a 64 KiB producer read draining into a small ring:
        // every chunk after the buffer fills discards bytes one-for-one.
        for _ in 0..500_000 / 8 {
            buf.write(&[0u8; 8]);
        }
        assert_eq!(buf.overflows(), 500_000 - 8);
    }

    #[test]
    fn test_partial_drain_preserves_remainder() {
        let mut buf = RingBuffer::new(16);
        buf.write(b"hello world");
        assert_eq!(buf.read(5), b"hello");
        assert_eq!(buf.read(64), b" world");
    }

    #[test]
    fn test_unread_restores_front_and_corrects_bytes_read() {
        let mut buf = RingBuffer::new(16);
        buf.write(b"hello world");
        let chunk = buf.read(64);
        assert_eq!(buf.bytes_read(), 11);

        buf.unread(&chunk[5..]);
        assert_eq!(buf.bytes_read(), 5);
        assert_eq!(buf.read(64), b" world");
    }

    #[test]
    fn test_counters_track_totals_not_current_size() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"AB");
        buf.read(1);
        buf.write(b"CDEF");
        assert_eq!(buf.bytes_written(), 6);
        assert_eq!(buf.bytes_read(), 1);
        assert!(buf.overflows() >= 1);
    }
}
