// src/core/replication/backlog.rs

//! The replication buffer (C5): a bounded, append-only byte ring with
//! absolute offset semantics.

use bytes::Bytes;
use std::collections::VecDeque;

/// Default capacity: 1 MiB of retained write-stream bytes.
pub const DEFAULT_CAPACITY: usize = 1024 * 1024;

/// Returned by `range` when the requested prefix has already been
/// evicted: the caller must fall back to a full resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TooFarBehind {
    pub oldest_offset: i64,
}

struct Entry {
    offset: i64,
    bytes: Bytes,
}

/// A circular byte buffer addressed by absolute offset. `write` advances
/// `master_offset` monotonically; entries older than `capacity` bytes are
/// evicted from the front as new ones arrive.
pub struct ReplicationBuffer {
    entries: VecDeque<Entry>,
    capacity: usize,
    current_size: usize,
    /// Offset of the next byte that will be written.
    master_offset: i64,
    /// Offset of the oldest byte still retained.
    oldest_offset: i64,
}

impl ReplicationBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            current_size: 0,
            master_offset: 0,
            oldest_offset: 0,
        }
    }

    pub fn master_offset(&self) -> i64 {
        self.master_offset
    }

    pub fn oldest_offset(&self) -> i64 {
        self.oldest_offset
    }

    /// Appends `bytes` to the stream, returning the absolute offset at
    /// which `bytes[0]` was written.
    pub fn write(&mut self, bytes: Bytes) -> i64 {
        let offset = self.master_offset;
        self.current_size += bytes.len();
        self.master_offset += bytes.len() as i64;
        self.entries.push_back(Entry { offset, bytes });

        while self.current_size > self.capacity {
            if self.entries.len() <= 1 {
                break;
            }
            let evicted = self.entries.pop_front().unwrap();
            self.current_size -= evicted.bytes.len();
            self.oldest_offset = evicted.offset + evicted.bytes.len() as i64;
        }
        offset
    }

    /// Returns every entry with `offset >= from`, or `Err` if `from` has
    /// already been evicted (the caller needs a full resync instead).
    pub fn range(&self, from: i64) -> Result<Vec<Bytes>, TooFarBehind> {
        if from < self.oldest_offset {
            return Err(TooFarBehind {
                oldest_offset: self.oldest_offset,
            });
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| e.offset >= from)
            .map(|e| e.bytes.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_returns_offset_and_advances_monotonically() {
        let mut buf = ReplicationBuffer::new(DEFAULT_CAPACITY);
        let o1 = buf.write(Bytes::from_static(b"abc"));
        let o2 = buf.write(Bytes::from_static(b"de"));
        assert_eq!(o1, 0);
        assert_eq!(o2, 3);
        assert_eq!(buf.master_offset(), 5);
    }

    #[test]
    fn range_errors_when_requested_offset_evicted() {
        let mut buf = ReplicationBuffer::new(4);
        buf.write(Bytes::from_static(b"aaaa"));
        buf.write(Bytes::from_static(b"bbbb"));
        assert!(buf.range(0).is_err());
        assert!(buf.range(4).is_ok());
    }

    #[test]
    fn range_returns_requested_suffix() {
        let mut buf = ReplicationBuffer::new(DEFAULT_CAPACITY);
        buf.write(Bytes::from_static(b"aa"));
        buf.write(Bytes::from_static(b"bb"));
        buf.write(Bytes::from_static(b"cc"));
        let slice = buf.range(2).unwrap();
        assert_eq!(slice, vec![Bytes::from_static(b"bb"), Bytes::from_static(b"cc")]);
    }
}
