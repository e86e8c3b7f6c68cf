use std::ops::Range;

use crate::TransferError;

/// Splits a file of `file_size` bytes into fixed-size chunks.
///
/// Byte ranges are derived from `(index, chunk_size, file_size)` on demand
/// and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    file_size: u64,
    chunk_size: u64,
    total_chunks: u32,
}

impl ChunkPlan {
    pub fn new(file_size: u64, chunk_size: u64) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidChunkSize);
        }
        let total_chunks = u32::try_from(file_size.div_ceil(chunk_size))
            .map_err(|_| TransferError::TooManyChunks { file_size })?;
        Ok(Self {
            file_size,
            chunk_size,
            total_chunks,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// `ceil(file_size / chunk_size)`; zero for an empty file.
    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Byte range `[index * chunk_size, min((index + 1) * chunk_size, file_size))`.
    pub fn range_of(&self, index: u32) -> Result<Range<u64>, TransferError> {
        if index >= self.total_chunks {
            return Err(TransferError::IndexOutOfRange {
                index,
                total: self.total_chunks,
            });
        }
        let start = u64::from(index) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file_size);
        Ok(start..end)
    }

    /// Length in bytes of chunk `index`, or 0 if out of range.
    pub fn len_of(&self, index: u32) -> u64 {
        self.range_of(index).map(|r| r.end - r.start).unwrap_or(0)
    }

    /// Iterates over every chunk index with its byte range, in order.
    pub fn ranges(&self) -> impl Iterator<Item = (u32, Range<u64>)> + '_ {
        (0..self.total_chunks).map(move |i| {
            let start = u64::from(i) * self.chunk_size;
            (i, start..(start + self.chunk_size).min(self.file_size))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ten_million_in_one_and_a_half_million_chunks() {
        let plan = ChunkPlan::new(10_000_000, 1_500_000).unwrap();
        assert_eq!(plan.total_chunks(), 7);
        for i in 0..6 {
            assert_eq!(plan.len_of(i), 1_500_000);
        }
        assert_eq!(plan.range_of(6).unwrap(), 9_000_000..10_000_000);
        assert_eq!(plan.len_of(6), 1_000_000);
    }

    #[test]
    fn ranges_cover_file_without_gaps() {
        for (size, chunk) in [(1u64, 1u64), (10, 3), (12, 4), (4096, 1000), (7, 100)] {
            let plan = ChunkPlan::new(size, chunk).unwrap();
            assert_eq!(u64::from(plan.total_chunks()), size.div_ceil(chunk));

            let mut next = 0;
            for (i, r) in plan.ranges() {
                assert_eq!(r.start, next, "gap before chunk {i} ({size}/{chunk})");
                assert!(r.end > r.start);
                assert_eq!(plan.range_of(i).unwrap(), r);
                next = r.end;
            }
            assert_eq!(next, size);
        }
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let plan = ChunkPlan::new(0, 1024).unwrap();
        assert_eq!(plan.total_chunks(), 0);
        assert_eq!(plan.ranges().count(), 0);
    }

    #[test]
    fn zero_chunk_size_rejected() {
        assert!(matches!(
            ChunkPlan::new(100, 0),
            Err(TransferError::InvalidChunkSize)
        ));
    }

    #[test]
    fn too_many_chunks_rejected() {
        assert!(matches!(
            ChunkPlan::new(u64::MAX, 1),
            Err(TransferError::TooManyChunks { .. })
        ));
    }

    #[test]
    fn index_out_of_range() {
        let plan = ChunkPlan::new(10, 4).unwrap();
        assert!(matches!(
            plan.range_of(3),
            Err(TransferError::IndexOutOfRange { index: 3, total: 3 })
        ));
        assert_eq!(plan.len_of(3), 0);
    }
}
