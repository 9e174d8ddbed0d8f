use std::{cmp::Ordering, collections::BinaryHeap};

use bytes::{Buf, Bytes};

/// Helper to assemble unordered stream frames into an ordered stream
#[derive(Debug, Default)]
pub(crate) struct Assembler {
    data: BinaryHeap<Chunk>,
    /// Length of the contiguous prefix of the stream which has been taken out
    bytes_read: u64,
    /// First offset we haven't received any data at or after
    end: u64,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Buffer a chunk received at `offset`
    ///
    /// Out-of-order and overlapping chunks are retained until their
    /// predecessors arrive.
    pub(crate) fn insert(&mut self, offset: u64, bytes: Bytes) {
        self.end = self.end.max(offset + bytes.len() as u64);
        if bytes.is_empty() {
            return;
        }
        self.data.push(Chunk { offset, bytes });
    }

    /// Take the next contiguous run of bytes, if any is ready
    pub(crate) fn read(&mut self) -> Option<Bytes> {
        loop {
            let chunk = self.data.peek()?;
            if chunk.offset > self.bytes_read {
                // Gap before this chunk; wait for the predecessor
                return None;
            }
            let end = chunk.offset + chunk.bytes.len() as u64;
            if end <= self.bytes_read {
                // Wholly duplicate data
                self.data.pop();
                continue;
            }
            let mut chunk = self.data.pop().unwrap();
            // Skip any prefix we already delivered
            chunk.bytes.advance((self.bytes_read - chunk.offset) as usize);
            self.bytes_read = end;
            return Some(chunk.bytes);
        }
    }

    /// Length of the contiguous prefix delivered so far
    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Offset after the largest byte received
    pub(crate) fn end(&self) -> u64 {
        self.end
    }
}

#[derive(Debug, Eq)]
struct Chunk {
    offset: u64,
    bytes: Bytes,
}

impl Ord for Chunk {
    // Invert ordering based on offset (max-heap, min offset first),
    // prioritize longer chunks at the same offset.
    fn cmp(&self, other: &Self) -> Ordering {
        self.offset
            .cmp(&other.offset)
            .reverse()
            .then(self.bytes.len().cmp(&other.bytes.len()))
    }
}

impl PartialOrd for Chunk {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        (self.offset, self.bytes.len()) == (other.offset, other.bytes.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn next(x: &mut Assembler) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = x.read() {
            out.extend_from_slice(&chunk);
        }
        if out.is_empty() { None } else { Some(out) }
    }

    #[test]
    fn assemble_ordered() {
        let mut x = Assembler::new();
        assert_matches!(next(&mut x), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123");
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"456");
        x.insert(6, Bytes::from_static(b"789"));
        x.insert(9, Bytes::from_static(b"10"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"78910");
    }

    #[test]
    fn assemble_unordered() {
        let mut x = Assembler::new();
        x.insert(3, Bytes::from_static(b"456"));
        assert_matches!(next(&mut x), None);
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123456");
    }

    #[test]
    fn assemble_duplicate() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(0, Bytes::from_static(b"123"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_contained() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"12345"));
        x.insert(1, Bytes::from_static(b"234"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"12345");
    }

    #[test]
    fn assemble_overlapping() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"123"));
        x.insert(1, Bytes::from_static(b"234"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"1234");
    }

    #[test]
    fn assemble_old() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"1234"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"1234");
        x.insert(0, Bytes::from_static(b"1234"));
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn gap_then_fill() {
        let mut x = Assembler::new();
        x.insert(0, Bytes::from_static(b"ab"));
        x.insert(4, Bytes::from_static(b"ef"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"ab");
        x.insert(2, Bytes::from_static(b"cd"));
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"cdef");
        assert_eq!(x.bytes_read(), 6);
        assert_eq!(x.end(), 6);
    }
}
