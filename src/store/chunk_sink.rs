use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};

use crate::config::Compression;
use crate::error::{ExpandError, Result};
use crate::models::{ChunkKey, ChunkLayout, Fragment, Template};
use crate::store::writer::{ArraySpec, StoreWriter};
use crate::utils::constants::DIM_TIME;

/// Destination for (key, fragment) pairs.
///
/// Creating the sink lays out the whole output from the template and writes
/// the coordinates; each committed fragment then fills exactly one time chunk
/// of one variable.
#[derive(Debug)]
pub struct ChunkSink {
    writer: StoreWriter,
    template: Template,
    time_chunk_size: usize,
}

impl ChunkSink {
    pub fn create(
        path: &Path,
        template: &Template,
        layout: &ChunkLayout,
        compression: Compression,
    ) -> Result<Self> {
        let time_chunk_size = layout.time_chunk_size().ok_or_else(|| {
            ExpandError::config("Output chunk layout has no fixed time chunk size")
        })?;
        if time_chunk_size == 0 {
            return Err(ExpandError::config("Time chunk size must be positive"));
        }

        let time = template.time_coordinate()?;

        let mut specs = vec![ArraySpec::from_variable(&time, vec![time.shape()[0].max(1)])];
        for coord in &template.coords {
            let chunks = coord.shape().iter().map(|&s| s.max(1)).collect();
            specs.push(ArraySpec::from_variable(coord, chunks));
        }
        for schema in template.variables.values() {
            let chunks = layout.chunk_shape(&schema.dims, &schema.shape);
            specs.push(ArraySpec::from_schema(schema, chunks));
        }

        let writer = StoreWriter::create(path, template.attrs.clone(), specs, compression)?;

        writer.write_array(&time.name, &time.data)?;
        for coord in &template.coords {
            writer.write_array(&coord.name, &coord.data)?;
        }

        Ok(Self {
            writer,
            template: template.clone(),
            time_chunk_size,
        })
    }

    pub fn path(&self) -> &Path {
        self.writer.root()
    }

    /// Commit one fragment at the position named by its key.
    pub fn commit(&self, key: &ChunkKey, fragment: &Fragment) -> Result<()> {
        let name = fragment.name();
        if key.vars.len() != 1 || !key.vars.contains(name) {
            return Err(ExpandError::storage(
                self.path(),
                format!("{} does not match fragment variable '{}'", key, name),
            ));
        }

        let schema = self.template.variable(name).ok_or_else(|| {
            ExpandError::storage(self.path(), format!("Variable '{}' is not in the template", name))
        })?;
        let variable = &fragment.variable;

        if variable.dims != schema.dims || variable.shape()[1..] != schema.shape[1..] {
            return Err(ExpandError::storage(
                self.path(),
                format!(
                    "Fragment for '{}' has dims {:?} shape {:?}, expected {:?} {:?}",
                    name,
                    variable.dims,
                    variable.shape(),
                    schema.dims,
                    schema.shape
                ),
            ));
        }

        // Dispatch granularity must match the store's time chunking
        let start = key.offset(DIM_TIME);
        let total = self.template.time_len();
        if start % self.time_chunk_size != 0 || start >= total {
            return Err(ExpandError::config(format!(
                "{} is not aligned with the output time chunk size {}",
                key, self.time_chunk_size
            )));
        }
        let expected = self.time_chunk_size.min(total - start);
        if fragment.time_len() != expected || variable.shape()[0] != expected {
            return Err(ExpandError::config(format!(
                "{} covers {} timestamps but the output time chunk holds {}",
                key,
                fragment.time_len(),
                expected
            )));
        }
        if fragment.times.first() != self.template.times.get(start) {
            return Err(ExpandError::storage(
                self.path(),
                format!("{} starts at the wrong timestamp", key),
            ));
        }

        let origin: Vec<usize> = schema.dims.iter().map(|dim| key.offset(dim)).collect();
        self.writer.write_region(name, &origin, &variable.data)?;

        debug!(key = %key, "Committed fragment");
        Ok(())
    }

    /// Verify every expected key was committed, then mark the store complete.
    pub fn finish(&self, committed: &BTreeSet<ChunkKey>, expected: &BTreeSet<ChunkKey>) -> Result<()> {
        let missing: Vec<&ChunkKey> = expected.difference(committed).collect();
        if let Some(first) = missing.first() {
            return Err(ExpandError::storage(
                self.path(),
                format!("{} chunk(s) never written, first: {}", missing.len(), first),
            ));
        }

        let unexpected: Vec<&ChunkKey> = committed.difference(expected).collect();
        if let Some(first) = unexpected.first() {
            return Err(ExpandError::storage(
                self.path(),
                format!("{} unexpected chunk(s) written, first: {}", unexpected.len(), first),
            ));
        }

        self.writer.mark_complete()?;
        info!(path = %self.path().display(), chunks = committed.len(), "Output store complete");
        Ok(())
    }
}
