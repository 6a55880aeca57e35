use std::iter::StepBy;
use std::ops::Range;

use crate::error::{ExpandError, Result};

/// Splits the time index into chunk-aligned work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDispatcher {
    len: usize,
    chunk_size: usize,
}

impl ChunkDispatcher {
    pub fn new(len: usize, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ExpandError::config("Time chunk size must be positive"));
        }
        Ok(Self { len, chunk_size })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.len.div_ceil(self.chunk_size)
    }

    /// Chunk start offsets: `0, chunk_size, 2 * chunk_size, ...` below `len`.
    pub fn offsets(&self) -> StepBy<Range<usize>> {
        (0..self.len).step_by(self.chunk_size)
    }

    /// The half-open slice a work item covers, clipped to the index length.
    pub fn slice(&self, offset: usize) -> Range<usize> {
        offset..(offset + self.chunk_size).min(self.len)
    }

    pub fn ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        self.offsets().map(move |offset| self.slice(offset))
    }
}
