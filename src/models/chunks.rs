use std::collections::BTreeMap;

use crate::utils::constants::DIM_TIME;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkExtent {
    /// One chunk spanning the whole dimension.
    Full,
    Size(usize),
}

/// Physical chunk sizes of the destination store, per dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkLayout {
    extents: BTreeMap<String, ChunkExtent>,
}

impl ChunkLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output layout: every non-periodic input dimension unchunked, `time` at
    /// the resolved chunk size.
    pub fn for_output(
        input_chunks: &BTreeMap<String, usize>,
        periodic_dims: &[&str],
        time_chunk_size: usize,
    ) -> Self {
        let mut extents: BTreeMap<String, ChunkExtent> = input_chunks
            .keys()
            .filter(|dim| !periodic_dims.contains(&dim.as_str()))
            .map(|dim| (dim.clone(), ChunkExtent::Full))
            .collect();
        extents.insert(DIM_TIME.to_string(), ChunkExtent::Size(time_chunk_size));

        Self { extents }
    }

    pub fn with_extent(mut self, dim: &str, extent: ChunkExtent) -> Self {
        self.extents.insert(dim.to_string(), extent);
        self
    }

    pub fn extent(&self, dim: &str) -> Option<ChunkExtent> {
        self.extents.get(dim).copied()
    }

    pub fn time_chunk_size(&self) -> Option<usize> {
        match self.extent(DIM_TIME)? {
            ChunkExtent::Size(size) => Some(size),
            ChunkExtent::Full => None,
        }
    }

    /// Concrete chunk shape for an array. Dimensions missing from the layout
    /// are left unchunked.
    pub fn chunk_shape(&self, dims: &[String], shape: &[usize]) -> Vec<usize> {
        dims.iter()
            .zip(shape)
            .map(|(dim, &size)| match self.extent(dim) {
                Some(ChunkExtent::Size(chunk)) => chunk.max(1),
                Some(ChunkExtent::Full) | None => size.max(1),
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ChunkExtent)> {
        self.extents.iter()
    }
}
