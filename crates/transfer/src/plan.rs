use std::collections::BTreeSet;

use crate::TransferError;

/// A contiguous byte range of a file, uploaded as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Position of the chunk in the plan.
    pub index: u32,
    /// First byte (inclusive).
    pub start: u64,
    /// Last byte (exclusive).
    pub end: u64,
}

impl ChunkRange {
    /// Size of this chunk in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Ordered, non-overlapping partition of `[0, file_size)`.
///
/// Plans are pure functions of `(file_size, chunk_size)`: the same inputs
/// always produce the same ranges, which is what makes a persisted set of
/// uploaded indices meaningful after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    chunks: Vec<ChunkRange>,
}

impl ChunkPlan {
    /// Partitions a file of `file_size` bytes into `chunk_size` pieces.
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }

        let total = file_size.div_ceil(chunk_size);
        let total = u32::try_from(total).map_err(|_| TransferError::TooManyChunks(total))?;

        let chunks = (0..total)
            .map(|index| {
                let start = u64::from(index) * chunk_size;
                let end = (start + chunk_size).min(file_size);
                ChunkRange { index, start, end }
            })
            .collect();

        Ok(Self {
            file_size,
            chunk_size,
            chunks,
        })
    }

    /// Number of chunks in the plan.
    pub fn total(&self) -> u32 {
        // `new` bounds the chunk count to u32.
        self.chunks.len() as u32
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Returns the range for `index`, if it is part of the plan.
    pub fn chunk(&self, index: u32) -> Option<ChunkRange> {
        self.chunks.get(index as usize).copied()
    }

    /// All chunk ranges in index order.
    pub fn chunks(&self) -> &[ChunkRange] {
        &self.chunks
    }

    /// Indices of the plan not present in `uploaded`, in ascending order.
    pub fn pending<'a>(&'a self, uploaded: &'a BTreeSet<u32>) -> impl Iterator<Item = u32> + 'a {
        self.chunks
            .iter()
            .map(|c| c.index)
            .filter(move |i| !uploaded.contains(i))
    }

    /// Returns `true` when `uploaded` contains every index in `[0, total)`.
    ///
    /// Counting alone is not enough: the set may carry stray indices from a
    /// differently sized plan, so coverage is checked index by index.
    pub fn is_covered(&self, uploaded: &BTreeSet<u32>) -> bool {
        self.chunks.iter().all(|c| uploaded.contains(&c.index))
    }

    /// Integer percentage of chunks present in `uploaded`, rounded to nearest.
    pub fn progress(&self, uploaded: &BTreeSet<u32>) -> u8 {
        let total = u64::from(self.total());
        if total == 0 {
            return 0;
        }
        let done = uploaded.iter().filter(|i| **i < self.total()).count() as u64;
        // round(100 * done / total) without floating point.
        ((200 * done + total) / (2 * total)) as u8
    }
}
