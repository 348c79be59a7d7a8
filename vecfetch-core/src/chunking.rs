use crate::error::{Result, VecfetchError};
use crate::range::ByteRange;

const MIN_CHUNK_SIZE: u64 = 1 << 20; // 1 MiB
const MAX_CHUNK_SIZE: u64 = 64 << 20; // 64 MiB
const MAX_PREFERRED_CHUNKS: u64 = 4096;

/// One leaf of the tree: a contiguous slice of the target file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub index: u32,
    pub range: ByteRange,
}

/// Deterministic mapping of `(total_size, chunk_size)` to chunk ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLayout {
    total_size: u64,
    chunk_size: u32,
    chunk_count: u32,
}

impl ChunkLayout {
    pub fn new(total_size: u64, chunk_size: u32) -> Result<Self> {
        if chunk_size == 0 {
            return Err(VecfetchError::InvalidConfiguration("chunk size must be > 0".into()));
        }
        let count = total_size.div_ceil(chunk_size as u64);
        let chunk_count = u32::try_from(count).map_err(|_| {
            VecfetchError::InvalidConfiguration(format!(
                "{count} chunks of {chunk_size} bytes exceed the u32 leaf index space"
            ))
        })?;
        Ok(Self { total_size, chunk_size, chunk_count })
    }

    /// Layout with a chunk size derived from the content size: small files get
    /// small power-of-two chunks, large ones scale from 1 MiB up to 64 MiB to
    /// keep the leaf count near 4096.
    pub fn with_default_chunk_size(total_size: u64) -> Result<Self> {
        Self::new(total_size, default_chunk_size(total_size))
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    pub fn chunk_range(&self, index: u32) -> Option<ByteRange> {
        if index >= self.chunk_count {
            return None;
        }
        let start = index as u64 * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(self.total_size);
        ByteRange::new(start, end).ok()
    }

    pub fn chunk(&self, index: u32) -> Option<Chunk> {
        self.chunk_range(index).map(|range| Chunk { index, range })
    }

    pub fn chunk_len(&self, index: u32) -> u64 {
        self.chunk_range(index).map(|r| r.size()).unwrap_or(0)
    }

    /// Chunk holding `offset`. Offsets at or past the end have no chunk.
    pub fn chunk_index_of(&self, offset: u64) -> Option<u32> {
        if offset >= self.total_size {
            return None;
        }
        Some((offset / self.chunk_size as u64) as u32)
    }

    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        (0..self.chunk_count).filter_map(move |i| self.chunk(i))
    }

    pub fn ranges(&self) -> Vec<ByteRange> {
        self.chunks().map(|c| c.range).collect()
    }

    /// Indices of every chunk intersecting `range`; empty for an empty range.
    pub fn chunks_overlapping(&self, range: &ByteRange) -> std::ops::Range<u32> {
        if range.is_empty() || range.start() >= self.total_size {
            return 0..0;
        }
        let first = (range.start() / self.chunk_size as u64) as u32;
        let last = ((range.end().min(self.total_size) - 1) / self.chunk_size as u64) as u32;
        first..last + 1
    }
}

pub fn default_chunk_size(total_size: u64) -> u32 {
    if total_size == 0 {
        return MIN_CHUNK_SIZE as u32;
    }
    if total_size < 1024 {
        return 64;
    }
    if total_size < MIN_CHUNK_SIZE {
        return total_size.next_power_of_two().max(1024) as u32;
    }
    let mut chunk = MIN_CHUNK_SIZE;
    while chunk < MAX_CHUNK_SIZE && total_size.div_ceil(chunk) > MAX_PREFERRED_CHUNKS {
        chunk *= 2;
    }
    chunk as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sizes_follow_content() {
        assert_eq!(default_chunk_size(0), 1 << 20);
        assert_eq!(default_chunk_size(500), 64);
        assert_eq!(default_chunk_size(1500), 2048);
        assert_eq!(default_chunk_size(10_000_000), 1 << 20);
        // 8 GiB -> 4096 chunks of 2 MiB
        assert_eq!(default_chunk_size(8 << 30), 2 << 20);
        // Capped at 64 MiB regardless of chunk count
        assert_eq!(default_chunk_size(1 << 40), 64 << 20);
    }

    #[test]
    fn overlapping_clamps_to_content() {
        let l = ChunkLayout::new(1000, 100).unwrap();
        assert_eq!(l.chunks_overlapping(&ByteRange::new(0, 1).unwrap()), 0..1);
        assert_eq!(l.chunks_overlapping(&ByteRange::new(99, 101).unwrap()), 0..2);
        assert_eq!(l.chunks_overlapping(&ByteRange::new(950, 5000).unwrap()), 9..10);
        assert_eq!(l.chunks_overlapping(&ByteRange::new(40, 40).unwrap()), 0..0);
        assert_eq!(l.chunk_index_of(1000), None);
    }
}
