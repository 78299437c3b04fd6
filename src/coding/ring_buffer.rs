// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded byte buffer for PTY output replay.

use std::collections::VecDeque;

/// Default replay capacity.
pub const DEFAULT_REPLAY_BYTES: usize = 256 * 1024;

/// Keeps the most recent `capacity` bytes; older bytes are dropped.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    capacity: usize,
    bytes: VecDeque<u8>,
    dropped: u64,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if self.capacity == 0 {
            self.dropped += chunk.len() as u64;
            return;
        }
        // Only the tail of an oversized chunk can survive.
        let chunk = if chunk.len() > self.capacity {
            let skip = chunk.len() - self.capacity;
            self.dropped += skip as u64;
            &chunk[skip..]
        } else {
            chunk
        };

        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.bytes.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.bytes.extend(chunk);
    }

    /// Buffered bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }

    /// Buffered bytes as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }
}

impl Default for ReplayBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drops_oldest() {
        let mut buf = ReplayBuffer::new(8);
        buf.push(b"hello");
        buf.push(b"world");
        assert_eq!(buf.snapshot(), b"lloworld".to_vec());
        assert_eq!(buf.len(), 8);
        assert_eq!(buf.dropped(), 2);
    }

    #[test]
    fn test_oversized_chunk_keeps_tail() {
        let mut buf = ReplayBuffer::new(4);
        buf.push(b"ab");
        buf.push(b"0123456789");
        assert_eq!(buf.text(), "6789");
        assert_eq!(buf.dropped(), 8);
    }

    #[test]
    fn test_zero_capacity() {
        let mut buf = ReplayBuffer::new(0);
        buf.push(b"abc");
        assert!(buf.is_empty());
        assert_eq!(buf.dropped(), 3);
    }
}
