use ndarray::{ArrayD, Dimension, IxDyn};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use zarrs::array::{Array, ElementOwned};
use zarrs::array_subset::ArraySubset;
use zarrs::group::Group;
use zarrs::storage::{ListableStorageTraits, ReadableStorageTraits, StorePrefix};
use zarrs_filesystem::FilesystemStore;

use crate::error::{ExpandError, Result};
use crate::models::array_data::with_element_type;
use crate::models::{
    ArrayData, ClimatologySource, DataType, Dataset, Element, Variable, VariableSchema,
};
use crate::utils::constants::{ARRAY_DIMENSIONS_ATTR, COMPLETE_ATTR};

/// A data variable left on disk until a block of it is requested.
struct SourceArray {
    schema: VariableSchema,
    chunks: Vec<usize>,
    array: Array<FilesystemStore>,
}

impl fmt::Debug for SourceArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceArray")
            .field("schema", &self.schema)
            .field("chunks", &self.chunks)
            .finish_non_exhaustive()
    }
}

/// A climatology opened from a Zarr group (v2 or v3, any codec zarrs reads).
///
/// Dimension coordinates are loaded at open; data variables are read through
/// `read_block`, which only decodes the chunks overlapping the block.
#[derive(Debug)]
pub struct ZarrClimatology {
    path: PathBuf,
    attrs: Map<String, Value>,
    coords: BTreeMap<String, Variable>,
    arrays: BTreeMap<String, SourceArray>,
}

impl ZarrClimatology {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Native chunk extent of every dimension used by a data variable.
    pub fn native_chunks(&self) -> Result<BTreeMap<String, usize>> {
        let mut chunks: BTreeMap<String, usize> = BTreeMap::new();
        for (name, source) in &self.arrays {
            for (dim, &extent) in source.schema.dims.iter().zip(&source.chunks) {
                match chunks.get(dim) {
                    Some(&existing) if existing != extent => {
                        return Err(ExpandError::storage(
                            &self.path,
                            format!(
                                "Inconsistent chunks along '{}': {} vs {} (in '{}')",
                                dim, existing, extent, name
                            ),
                        ));
                    }
                    _ => {
                        chunks.insert(dim.clone(), extent);
                    }
                }
            }
        }
        Ok(chunks)
    }

    /// Read every array into memory.
    pub fn load(&self) -> Result<Dataset> {
        let mut dataset = Dataset::new();
        dataset.attrs = self.attrs.clone();
        for coord in self.coords.values() {
            dataset.insert(coord.clone());
        }
        for source in self.arrays.values() {
            let schema = &source.schema;
            dataset.insert(Variable {
                name: schema.name.clone(),
                dims: schema.dims.clone(),
                fill_value: schema.fill_value.clone(),
                attrs: schema.attrs.clone(),
                data: read_all(&source.array, schema, &self.path)?,
            });
        }
        Ok(dataset)
    }
}

impl ClimatologySource for ZarrClimatology {
    fn attrs(&self) -> &Map<String, Value> {
        &self.attrs
    }

    fn coord(&self, name: &str) -> Option<&Variable> {
        self.coords.get(name)
    }

    fn coords(&self) -> Vec<&Variable> {
        self.coords.values().collect()
    }

    fn data_vars(&self) -> Vec<VariableSchema> {
        self.arrays.values().map(|a| a.schema.clone()).collect()
    }

    fn read_block(&self, name: &str, ranges: &[Range<usize>]) -> Result<ArrayData> {
        let source = self.arrays.get(name).ok_or_else(|| {
            ExpandError::storage(&self.path, format!("No data variable '{}'", name))
        })?;
        read_subset(&source.array, source.schema.dtype, ranges, &self.path)
    }
}

/// Open a Zarr group read-only. Coordinates are loaded; data stays on disk.
pub fn open(path: &Path) -> Result<ZarrClimatology> {
    let store = open_store(path)?;
    let mut attrs = open_group(&store, path)?.attributes().clone();
    attrs.remove(COMPLETE_ATTR);

    let mut coords = BTreeMap::new();
    let mut arrays = BTreeMap::new();

    for (name, array) in list_arrays(&store, path)? {
        let (schema, chunks) = describe(&name, &array, path)?;
        debug!(array = %name, shape = ?schema.shape, chunks = ?chunks, dtype = %schema.dtype, "Opened array");

        if schema.dims.len() == 1 && schema.dims[0] == name {
            let data = read_all(&array, &schema, path)?;
            coords.insert(
                name,
                Variable {
                    name: schema.name,
                    dims: schema.dims,
                    fill_value: schema.fill_value,
                    attrs: schema.attrs,
                    data,
                },
            );
        } else {
            arrays.insert(name, SourceArray { schema, chunks, array });
        }
    }

    Ok(ZarrClimatology {
        path: path.to_path_buf(),
        attrs,
        coords,
        arrays,
    })
}

/// One array as described by its metadata.
#[derive(Debug, Clone)]
pub struct ArraySummary {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: String,
    pub chunk_files: usize,
}

#[derive(Debug, Clone)]
pub struct StoreSummary {
    pub path: PathBuf,
    pub arrays: Vec<ArraySummary>,
    pub complete: bool,
}

impl StoreSummary {
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Store: {}\n  Arrays: {}\n  Complete: {}\n",
            self.path.display(),
            self.arrays.len(),
            if self.complete { "yes" } else { "no (expansion did not finish)" }
        );

        for array in &self.arrays {
            let expected: usize = array
                .shape
                .iter()
                .zip(&array.chunks)
                .map(|(&s, &c)| s.div_ceil(c.max(1)))
                .product();
            out.push_str(&format!(
                "  {} ({}) dims={:?} shape={:?} chunks={:?} stored chunks={}/{}\n",
                array.name,
                array.dtype,
                array.dims,
                array.shape,
                array.chunks,
                array.chunk_files,
                expected
            ));
        }

        out
    }
}

/// Describe a store from its metadata without loading array data.
///
/// A group carrying `expansion_complete = false` was left by a run that did
/// not finish; groups without the attribute count as complete.
pub fn inspect(path: &Path) -> Result<StoreSummary> {
    let store = open_store(path)?;
    let complete = open_group(&store, path)?
        .attributes()
        .get(COMPLETE_ATTR)
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let mut arrays = Vec::new();
    for (name, array) in list_arrays(&store, path)? {
        let (schema, chunks) = describe(&name, &array, path)?;
        let chunk_files = count_stored_chunks(&store, &array, &schema.shape, &chunks, path)?;

        arrays.push(ArraySummary {
            name,
            dims: schema.dims,
            shape: schema.shape,
            chunks,
            dtype: schema.dtype.to_string(),
            chunk_files,
        });
    }

    Ok(StoreSummary {
        path: path.to_path_buf(),
        arrays,
        complete,
    })
}

fn open_store(path: &Path) -> Result<Arc<FilesystemStore>> {
    if !path.is_dir() {
        return Err(ExpandError::storage(path, "No Zarr store at this path"));
    }
    Ok(Arc::new(
        FilesystemStore::new(path).map_err(ExpandError::zarr(path))?,
    ))
}

fn open_group(store: &Arc<FilesystemStore>, path: &Path) -> Result<Group<FilesystemStore>> {
    Group::open(store.clone(), "/")
        .map_err(|e| ExpandError::storage(path, format!("Not a Zarr group: {}", e)))
}

/// Arrays directly under the root group, by name. Child groups are skipped.
fn list_arrays(
    store: &Arc<FilesystemStore>,
    path: &Path,
) -> Result<Vec<(String, Array<FilesystemStore>)>> {
    let listing = store
        .list_dir(&StorePrefix::root())
        .map_err(ExpandError::zarr(path))?;

    let mut arrays = Vec::new();
    for prefix in listing.prefixes() {
        let name = prefix.as_str().trim_end_matches('/').to_string();
        let node_path = format!("/{}", name);
        match Array::open(store.clone(), &node_path) {
            Ok(array) => arrays.push((name, array)),
            Err(_) if Group::open(store.clone(), &node_path).is_ok() => {
                debug!(group = %name, "Skipping child group");
            }
            Err(e) => {
                return Err(ExpandError::storage(
                    path,
                    format!("Cannot open array '{}': {}", name, e),
                ))
            }
        }
    }
    arrays.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(arrays)
}

/// Schema and regular chunk shape of an opened array.
fn describe(
    name: &str,
    array: &Array<FilesystemStore>,
    path: &Path,
) -> Result<(VariableSchema, Vec<usize>)> {
    let dtype = DataType::from_zarrs(array.data_type()).ok_or_else(|| {
        ExpandError::storage(
            path,
            format!("Array '{}' has unsupported data type {:?}", name, array.data_type()),
        )
    })?;

    let shape: Vec<usize> = array.shape().iter().map(|&s| s as usize).collect();
    let mut attrs = array.attributes().clone();
    let dims = dimension_names(name, array, &mut attrs, path)?;

    let origin = vec![0u64; shape.len()];
    let chunks: Vec<usize> = array
        .chunk_grid()
        .chunk_shape(&origin, array.shape())
        .map_err(ExpandError::zarr(path))?
        .ok_or_else(|| {
            ExpandError::storage(path, format!("Array '{}' has no regular chunk shape", name))
        })?
        .iter()
        .map(|c| c.get() as usize)
        .collect();

    let schema = VariableSchema {
        name: name.to_string(),
        dims,
        shape,
        dtype,
        fill_value: array.fill_value().clone(),
        attrs,
    };
    Ok((schema, chunks))
}

/// Dimension names from v3 metadata, else from xarray's `_ARRAY_DIMENSIONS`
/// attribute. The attribute is removed either way.
fn dimension_names(
    name: &str,
    array: &Array<FilesystemStore>,
    attrs: &mut Map<String, Value>,
    path: &Path,
) -> Result<Vec<String>> {
    let from_attr = attrs.remove(ARRAY_DIMENSIONS_ATTR);
    let from_metadata: Option<Vec<String>> = array.dimension_names().as_ref().and_then(|names| {
        names
            .iter()
            .map(|n| n.as_str().map(str::to_string))
            .collect()
    });

    let dims = match (from_metadata, from_attr) {
        (Some(dims), _) => dims,
        (None, Some(value)) => serde_json::from_value(value)?,
        (None, None) => {
            return Err(ExpandError::storage(
                path,
                format!("Array '{}' has no dimension names", name),
            ))
        }
    };

    if dims.len() != array.shape().len() {
        return Err(ExpandError::storage(
            path,
            format!(
                "Array '{}' names {} dimensions for a {}-d array",
                name,
                dims.len(),
                array.shape().len()
            ),
        ));
    }
    Ok(dims)
}

fn read_all(array: &Array<FilesystemStore>, schema: &VariableSchema, path: &Path) -> Result<ArrayData> {
    let full: Vec<Range<usize>> = schema.shape.iter().map(|&size| 0..size).collect();
    read_subset(array, schema.dtype, &full, path)
}

fn read_subset(
    array: &Array<FilesystemStore>,
    dtype: DataType,
    ranges: &[Range<usize>],
    path: &Path,
) -> Result<ArrayData> {
    let start: Vec<u64> = ranges.iter().map(|r| r.start as u64).collect();
    let shape: Vec<usize> = ranges.iter().map(|r| r.end.saturating_sub(r.start)).collect();
    let subset = ArraySubset::new_with_start_shape(start, shape.iter().map(|&s| s as u64).collect())
        .map_err(ExpandError::zarr(path))?;

    with_element_type!(dtype, T => retrieve::<T>(array, &subset, &shape, path))
}

fn retrieve<T: Element + ElementOwned>(
    array: &Array<FilesystemStore>,
    subset: &ArraySubset,
    shape: &[usize],
    path: &Path,
) -> Result<ArrayData> {
    let values: Vec<T> = array
        .retrieve_array_subset_elements(subset)
        .map_err(ExpandError::zarr(path))?;
    Ok(ArrayD::from_shape_vec(IxDyn(shape), values)?.into())
}

fn count_stored_chunks(
    store: &Arc<FilesystemStore>,
    array: &Array<FilesystemStore>,
    shape: &[usize],
    chunks: &[usize],
    path: &Path,
) -> Result<usize> {
    let grid: Vec<usize> = shape
        .iter()
        .zip(chunks)
        .map(|(&s, &c)| s.div_ceil(c.max(1)))
        .collect();

    let mut stored = 0;
    for index in ndarray::indices(IxDyn(&grid)) {
        let indices: Vec<u64> = index.slice().iter().map(|&i| i as u64).collect();
        let key = array.chunk_key(&indices);
        if store.size_key(&key).map_err(ExpandError::zarr(path))?.is_some() {
            stored += 1;
        }
    }
    Ok(stored)
}
