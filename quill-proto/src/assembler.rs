use std::collections::BTreeMap;

use bytes::{Buf, Bytes};

/// Helper to assemble unordered stream frames into an ordered byte sequence
///
/// Duplicate and overlapping chunks, the normal result of retransmission, are
/// deduplicated at read time.
#[derive(Debug, Default)]
pub struct Assembler {
    chunks: BTreeMap<u64, Bytes>,
    bytes_read: u64,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offset of the next byte `read` will yield
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn insert(&mut self, offset: u64, mut data: Bytes) {
        let end = offset + data.len() as u64;
        if end <= self.bytes_read || data.is_empty() {
            return;
        }
        let offset = if offset < self.bytes_read {
            data.advance((self.bytes_read - offset) as usize);
            self.bytes_read
        } else {
            offset
        };
        match self.chunks.get(&offset) {
            // Keep the longer of two chunks at the same offset
            Some(existing) if existing.len() >= data.len() => {}
            _ => {
                self.chunks.insert(offset, data);
            }
        }
    }

    /// Pop the contiguous run of bytes starting at the current read offset
    pub fn read(&mut self) -> Option<Bytes> {
        let mut out = Vec::new();
        while let Some((&start, chunk)) = self.chunks.iter().next() {
            let pos = self.bytes_read + out.len() as u64;
            if start > pos {
                break;
            }
            let chunk = chunk.clone();
            self.chunks.remove(&start);
            let chunk_end = start + chunk.len() as u64;
            if chunk_end <= pos {
                // Wholly duplicate data
                continue;
            }
            out.extend_from_slice(&chunk[(pos - start) as usize..]);
        }
        if out.is_empty() {
            return None;
        }
        self.bytes_read += out.len() as u64;
        Some(out.into())
    }
}
