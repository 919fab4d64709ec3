//! Chunking: split a payload into ordered chunks, reassemble strictly in order.

/// Default chunk size in bytes. Small, for slow short-range links.
pub const DEFAULT_CHUNK_SIZE: u32 = 16 * 1024; // 16 KiB

/// One chunk of a payload: index and byte range (start, end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRange {
    pub index: u64,
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// The bytes of `payload` this range covers.
    pub fn slice<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        &payload[self.start as usize..self.end as usize]
    }
}

/// Split a payload of `total_len` bytes into fixed-size chunks; the last may be shorter.
pub fn split_into_chunks(total_len: u64, chunk_size: u32) -> Vec<ChunkRange> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE as u64
    } else {
        chunk_size as u64
    };
    let mut out = Vec::new();
    let mut start = 0u64;
    let mut index = 0u64;
    while start < total_len {
        let end = (start + size).min(total_len);
        out.push(ChunkRange { index, start, end });
        start = end;
        index += 1;
    }
    out
}

/// Number of chunks a payload splits into.
pub fn chunk_count(total_len: u64, chunk_size: u32) -> u64 {
    if chunk_size == 0 {
        return chunk_count(total_len, DEFAULT_CHUNK_SIZE);
    }
    total_len.div_ceil(chunk_size as u64)
}

/// Result of offering a chunk to a `Reassembly`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkApply {
    /// Appended; carries the new received length.
    Applied(u64),
    /// Index already applied; dropped.
    Duplicate { index: u64 },
    /// Index ahead of the next expected one; dropped.
    OutOfOrder { expected: u64, got: u64 },
    /// Chunk larger than the negotiated chunk size, or past the declared total.
    Overflow { index: u64 },
}

/// In-order reassembly buffer for a single payload.
pub struct Reassembly {
    total_len: u64,
    chunk_size: u32,
    next_index: u64,
    buf: Vec<u8>,
}

impl Reassembly {
    pub fn new(total_len: u64, chunk_size: u32) -> Self {
        Self {
            total_len,
            chunk_size,
            next_index: 0,
            buf: Vec::with_capacity(total_len as usize),
        }
    }

    /// Apply chunk `index` only if it is the next one expected.
    pub fn apply(&mut self, index: u64, data: &[u8]) -> ChunkApply {
        if index < self.next_index {
            return ChunkApply::Duplicate { index };
        }
        if index > self.next_index {
            return ChunkApply::OutOfOrder {
                expected: self.next_index,
                got: index,
            };
        }
        let len = data.len() as u64;
        if len > self.chunk_size as u64 || self.received() + len > self.total_len {
            return ChunkApply::Overflow { index };
        }
        self.buf.extend_from_slice(data);
        self.next_index += 1;
        ChunkApply::Applied(self.received())
    }

    pub fn received(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.total_len
    }

    /// Consume the buffer. Callers verify length and checksum before exposing it.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
