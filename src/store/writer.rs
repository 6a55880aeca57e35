use ndarray::ArrayD;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::codec::bytes_to_bytes::zstd::ZstdCodec;
use zarrs::array::codec::BytesToBytesCodecTraits;
use zarrs::array::{Array, ArrayBuilder, ChunkGrid, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::GroupBuilder;
use zarrs_filesystem::FilesystemStore;

use crate::config::Compression;
use crate::error::{ExpandError, Result};
use crate::models::{ArrayData, DataType, Dataset, Element, Variable, VariableSchema};
use crate::utils::constants::{COMPLETE_ATTR, COMPRESSION_LEVEL, ZARR_JSON_FILE, ZGROUP_FILE};

/// Everything needed to lay out one array on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySpec {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: DataType,
    pub fill_value: FillValue,
    pub attrs: Map<String, Value>,
}

impl ArraySpec {
    pub fn from_variable(variable: &Variable, chunks: Vec<usize>) -> Self {
        Self::from_schema(&variable.schema(), chunks)
    }

    pub fn from_schema(schema: &VariableSchema, chunks: Vec<usize>) -> Self {
        Self {
            name: schema.name.clone(),
            dims: schema.dims.clone(),
            shape: schema.shape.clone(),
            chunks,
            dtype: schema.dtype,
            fill_value: schema.fill_value.clone(),
            attrs: schema.attrs.clone(),
        }
    }
}

impl Compression {
    /// Bytes-to-bytes codec for arrays of `dtype`, if any.
    fn codec(&self, dtype: DataType) -> Result<Option<Arc<dyn BytesToBytesCodecTraits>>> {
        match self {
            Compression::None => Ok(None),
            Compression::Zstd => Ok(Some(Arc::new(ZstdCodec::new(
                COMPRESSION_LEVEL.into(),
                false,
            )))),
            Compression::BloscLz4 => {
                let level = BloscCompressionLevel::try_from(COMPRESSION_LEVEL)
                    .map_err(|_| ExpandError::config("Invalid blosc compression level"))?;
                let codec = BloscCodec::new(
                    BloscCompressor::LZ4,
                    level,
                    None,
                    BloscShuffleMode::Shuffle,
                    Some(dtype.size_in_bytes()),
                )
                .map_err(|e| ExpandError::config(e.to_string()))?;
                Ok(Some(Arc::new(codec)))
            }
        }
    }
}

struct OutputArray {
    spec: ArraySpec,
    array: Array<FilesystemStore>,
}

impl fmt::Debug for OutputArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputArray")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Writes a Zarr v3 group. Array metadata is fixed at creation; data is then
/// written in chunk-aligned regions, so concurrent writers never share a chunk.
///
/// The root group carries `expansion_complete = false` until `mark_complete`.
#[derive(Debug)]
pub struct StoreWriter {
    root: PathBuf,
    store: Arc<FilesystemStore>,
    attrs: Map<String, Value>,
    arrays: BTreeMap<String, OutputArray>,
}

impl StoreWriter {
    /// Create (or replace) the store at `root` and write all metadata.
    pub fn create(
        root: &Path,
        attrs: Map<String, Value>,
        arrays: Vec<ArraySpec>,
        compression: Compression,
    ) -> Result<Self> {
        prepare_root(root)?;
        let store = Arc::new(FilesystemStore::new(root).map_err(ExpandError::zarr(root))?);

        let mut writer = Self {
            root: root.to_path_buf(),
            store,
            attrs,
            arrays: BTreeMap::new(),
        };
        writer.store_group(false)?;

        for spec in arrays {
            if spec.shape.len() != spec.chunks.len() || spec.shape.len() != spec.dims.len() {
                return Err(ExpandError::storage(
                    root,
                    format!("Array '{}' has mismatched dims/shape/chunks", spec.name),
                ));
            }
            let array = writer.build_array(&spec, compression)?;
            writer
                .arrays
                .insert(spec.name.clone(), OutputArray { spec, array });
        }

        info!(path = %root.display(), arrays = writer.arrays.len(), compression = %compression, "Created store");
        Ok(writer)
    }

    fn build_array(&self, spec: &ArraySpec, compression: Compression) -> Result<Array<FilesystemStore>> {
        let chunk_grid: ChunkGrid = spec
            .chunks
            .iter()
            .map(|&c| c.max(1) as u64)
            .collect::<Vec<u64>>()
            .try_into()
            .map_err(|e| ExpandError::storage(&self.root, format!("{:?}", e)))?;

        let mut builder = ArrayBuilder::new(
            spec.shape.iter().map(|&s| s as u64).collect::<Vec<u64>>(),
            spec.dtype.to_zarrs(),
            chunk_grid,
            spec.fill_value.clone(),
        );
        builder
            .attributes(spec.attrs.clone())
            .dimension_names(Some(spec.dims.iter().map(String::as_str).collect::<Vec<_>>()));
        if let Some(codec) = compression.codec(spec.dtype)? {
            builder.bytes_to_bytes_codecs(vec![codec]);
        }

        let array = builder
            .build(self.store.clone(), &format!("/{}", spec.name))
            .map_err(ExpandError::zarr(&self.root))?;
        array.store_metadata().map_err(ExpandError::zarr(&self.root))?;
        Ok(array)
    }

    fn store_group(&self, complete: bool) -> Result<()> {
        let mut attrs = self.attrs.clone();
        attrs.insert(COMPLETE_ATTR.to_string(), Value::Bool(complete));

        let group = GroupBuilder::new()
            .attributes(attrs)
            .build(self.store.clone(), "/")
            .map_err(ExpandError::zarr(&self.root))?;
        group.store_metadata().map_err(ExpandError::zarr(&self.root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn spec(&self, name: &str) -> Option<&ArraySpec> {
        self.arrays.get(name).map(|a| &a.spec)
    }

    /// Write a whole array.
    pub fn write_array(&self, name: &str, data: &ArrayData) -> Result<()> {
        let origin = vec![0; data.ndim()];
        self.write_region(name, &origin, data)
    }

    /// Write `data` at `origin`. The region must start on chunk boundaries and
    /// end on a chunk boundary or the array edge, and match the array's dtype.
    pub fn write_region(&self, name: &str, origin: &[usize], data: &ArrayData) -> Result<()> {
        let output = self
            .arrays
            .get(name)
            .ok_or_else(|| ExpandError::storage(&self.root, format!("Unknown array '{}'", name)))?;
        let spec = &output.spec;

        if origin.len() != spec.shape.len() || data.ndim() != spec.shape.len() {
            return Err(ExpandError::storage(
                &self.root,
                format!(
                    "Region rank {} / data rank {} does not match rank {} of '{}'",
                    origin.len(),
                    data.ndim(),
                    spec.shape.len(),
                    name
                ),
            ));
        }
        if data.dtype() != spec.dtype {
            return Err(ExpandError::storage(
                &self.root,
                format!("'{}' is {} but the region holds {}", name, spec.dtype, data.dtype()),
            ));
        }

        for axis in 0..origin.len() {
            let (start, end) = (origin[axis], origin[axis] + data.shape()[axis]);
            let (chunk, size) = (spec.chunks[axis].max(1), spec.shape[axis]);
            if start % chunk != 0 || end > size || (end % chunk != 0 && end != size) {
                return Err(ExpandError::storage(
                    &self.root,
                    format!(
                        "Region {}..{} on axis '{}' of '{}' is not chunk-aligned (chunk {}, size {})",
                        start, end, spec.dims[axis], name, chunk, size
                    ),
                ));
            }
        }

        let subset = ArraySubset::new_with_start_shape(
            origin.iter().map(|&o| o as u64).collect(),
            data.shape().iter().map(|&s| s as u64).collect(),
        )
        .map_err(ExpandError::zarr(&self.root))?;

        match data {
            ArrayData::Float32(values) => store_elements(&output.array, &subset, values, &self.root)?,
            ArrayData::Float64(values) => store_elements(&output.array, &subset, values, &self.root)?,
            ArrayData::Int32(values) => store_elements(&output.array, &subset, values, &self.root)?,
            ArrayData::Int64(values) => store_elements(&output.array, &subset, values, &self.root)?,
        }

        debug!(array = %name, origin = ?origin, shape = ?data.shape(), "Wrote region");
        Ok(())
    }

    /// Rewrite the root group with `expansion_complete = true`.
    pub fn mark_complete(&self) -> Result<()> {
        self.store_group(true)?;
        info!(path = %self.root.display(), "Marked store complete");
        Ok(())
    }
}

fn store_elements<T: Element + zarrs::array::Element>(
    array: &Array<FilesystemStore>,
    subset: &ArraySubset,
    values: &ArrayD<T>,
    root: &Path,
) -> Result<()> {
    // Logical iteration order is C order, whatever the memory layout
    let elements: Vec<T> = values.iter().copied().collect();
    array
        .store_array_subset_elements(subset, &elements)
        .map_err(ExpandError::zarr(root))
}

/// Write a whole dataset with the given per-dimension chunk extents.
/// Dimensions without an entry are left unchunked.
pub fn write_dataset(
    path: &Path,
    dataset: &Dataset,
    chunks: &BTreeMap<String, usize>,
    compression: Compression,
) -> Result<()> {
    let specs: Vec<ArraySpec> = dataset
        .variables()
        .map(|var| {
            let chunk_shape = var
                .dims
                .iter()
                .zip(var.shape())
                .map(|(dim, &size)| chunks.get(dim).copied().unwrap_or(size).max(1))
                .collect();
            ArraySpec::from_variable(var, chunk_shape)
        })
        .collect();

    let writer = StoreWriter::create(path, dataset.attrs.clone(), specs, compression)?;
    for var in dataset.variables() {
        writer.write_array(&var.name, &var.data)?;
    }
    writer.mark_complete()
}

/// Remove a previous store at `root`, refusing to touch anything that is not
/// an empty directory or a Zarr group.
pub fn prepare_root(root: &Path) -> Result<()> {
    if root.exists() {
        let is_group = root.join(ZARR_JSON_FILE).is_file() || root.join(ZGROUP_FILE).is_file();
        let is_empty_dir = root.is_dir() && fs::read_dir(root)?.next().is_none();
        if !is_group && !is_empty_dir {
            return Err(ExpandError::storage(
                root,
                "Refusing to overwrite a path that is not a Zarr store",
            ));
        }
        if is_group {
            fs::remove_dir_all(root)?;
        }
    }
    fs::create_dir_all(root)?;
    Ok(())
}
