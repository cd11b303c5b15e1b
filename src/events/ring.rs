//! Fixed-capacity byte ring that keeps only the most recent bytes.

use std::collections::VecDeque;

/// Holds at most `capacity` bytes; older bytes are dropped from the head.
#[derive(Debug, Clone)]
pub struct Ring {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Bytes written since the last reset, including dropped ones.
    total_written: u64,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total_written: 0,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.total_written += bytes.len() as u64;
        if self.capacity == 0 {
            return;
        }
        let tail = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.buf.len() + tail.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(tail);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    /// Take the buffered bytes, leaving the ring empty.
    pub fn take(&mut self) -> Vec<u8> {
        self.total_written = 0;
        self.buf.drain(..).collect()
    }
}

impl std::fmt::Display for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.to_vec()))
    }
}

/// Keep at most the last `max` bytes of `s`, cutting on a char boundary.
pub fn tail_truncate(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s.drain(..start);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_last_bytes() {
        let mut ring = Ring::new(4);
        ring.write(b"ab");
        ring.write(b"cdef");
        assert_eq!(ring.to_vec(), b"cdef");
        assert_eq!(ring.total_written(), 6);
        ring.write(b"0123456789");
        assert_eq!(ring.to_vec(), b"6789");
    }

    #[test]
    fn take_clears() {
        let mut ring = Ring::new(8);
        ring.write(b"hello");
        assert_eq!(ring.take(), b"hello");
        assert!(ring.is_empty());
        assert_eq!(ring.total_written(), 0);
    }

    #[test]
    fn truncate_respects_char_boundary() {
        let mut s = "aé".to_string();
        tail_truncate(&mut s, 1);
        assert_eq!(s, "");
        let mut s = "hello".to_string();
        tail_truncate(&mut s, 3);
        assert_eq!(s, "llo");
    }
}
