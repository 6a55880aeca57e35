use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::Range;
use zarrs::array::FillValue;

use crate::error::{ExpandError, Result};
use crate::models::{ArrayData, ClimatologySource};

/// Element types understood by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Float32,
    Float64,
    Int32,
    Int64,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float32 | DataType::Int32 => 4,
            DataType::Float64 | DataType::Int64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// NaN for floats, zero for integers.
    pub fn default_fill_value(&self) -> FillValue {
        match self {
            DataType::Float32 => FillValue::from(f32::NAN),
            DataType::Float64 => FillValue::from(f64::NAN),
            DataType::Int32 => FillValue::from(0i32),
            DataType::Int64 => FillValue::from(0i64),
        }
    }

    pub fn to_zarrs(&self) -> zarrs::array::DataType {
        match self {
            DataType::Float32 => zarrs::array::DataType::Float32,
            DataType::Float64 => zarrs::array::DataType::Float64,
            DataType::Int32 => zarrs::array::DataType::Int32,
            DataType::Int64 => zarrs::array::DataType::Int64,
        }
    }

    pub fn from_zarrs(data_type: &zarrs::array::DataType) -> Option<Self> {
        match data_type {
            zarrs::array::DataType::Float32 => Some(DataType::Float32),
            zarrs::array::DataType::Float64 => Some(DataType::Float64),
            zarrs::array::DataType::Int32 => Some(DataType::Int32),
            zarrs::array::DataType::Int64 => Some(DataType::Int64),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Float32 => write!(f, "float32"),
            DataType::Float64 => write!(f, "float64"),
            DataType::Int32 => write!(f, "int32"),
            DataType::Int64 => write!(f, "int64"),
        }
    }
}

/// Shape, dtype and attributes of one variable, without data.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSchema {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub dtype: DataType,
    pub fill_value: FillValue,
    pub attrs: Map<String, Value>,
}

impl VariableSchema {
    pub fn axis_of(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }
}

/// A named, dimensioned array held in its stored element type.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub dims: Vec<String>,
    pub fill_value: FillValue,
    pub attrs: Map<String, Value>,
    pub data: ArrayData,
}

impl Variable {
    pub fn new(name: &str, dims: &[&str], data: impl Into<ArrayData>) -> Result<Self> {
        let data = data.into();
        if dims.len() != data.ndim() {
            return Err(ExpandError::config(format!(
                "Variable '{}' has {} dimension names for a {}-d array",
                name,
                dims.len(),
                data.ndim()
            )));
        }

        Ok(Self {
            name: name.to_string(),
            dims: dims.iter().map(|d| d.to_string()).collect(),
            fill_value: data.dtype().default_fill_value(),
            attrs: Map::new(),
            data,
        })
    }

    pub fn with_fill_value(mut self, fill_value: FillValue) -> Self {
        self.fill_value = fill_value;
        self
    }

    pub fn with_attr(mut self, key: &str, value: Value) -> Self {
        self.attrs.insert(key.to_string(), value);
        self
    }

    pub fn axis_of(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    /// Whether this array is a dimension coordinate (1-d, named after its dimension).
    pub fn is_dimension_coordinate(&self) -> bool {
        self.dims.len() == 1 && self.dims[0] == self.name
    }

    pub fn schema(&self) -> VariableSchema {
        VariableSchema {
            name: self.name.clone(),
            dims: self.dims.clone(),
            shape: self.shape().to_vec(),
            dtype: self.dtype(),
            fill_value: self.fill_value.clone(),
            attrs: self.attrs.clone(),
        }
    }
}

/// In-memory multi-variable collection: dimension coordinates plus data variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub coords: BTreeMap<String, Variable>,
    pub data_vars: BTreeMap<String, Variable>,
    pub attrs: Map<String, Value>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an array, classifying it as coordinate or data variable.
    pub fn insert(&mut self, variable: Variable) {
        if variable.is_dimension_coordinate() {
            self.coords.insert(variable.name.clone(), variable);
        } else {
            self.data_vars.insert(variable.name.clone(), variable);
        }
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.insert(variable);
        self
    }

    /// Size of every dimension used by any array.
    pub fn dim_sizes(&self) -> BTreeMap<String, usize> {
        let mut sizes = BTreeMap::new();
        for var in self.variables() {
            for (dim, &size) in var.dims.iter().zip(var.shape()) {
                sizes.insert(dim.clone(), size);
            }
        }
        sizes
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.coords.values().chain(self.data_vars.values())
    }
}

impl ClimatologySource for Dataset {
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
        self.data_vars.values().map(Variable::schema).collect()
    }

    fn read_block(&self, name: &str, ranges: &[Range<usize>]) -> Result<ArrayData> {
        self.data_vars
            .get(name)
            .ok_or_else(|| ExpandError::config(format!("No data variable '{}'", name)))?
            .data
            .slice_block(ranges)
    }
}
