use serde_json::{Map, Value};
use std::ops::Range;

use crate::error::Result;
use crate::models::{ArrayData, Variable, VariableSchema};

/// Read access to a climatology.
///
/// Coordinates are small and held in memory. Data variables are only
/// described up front; their values are read block by block, so a store
/// backed source touches just the chunks a selection needs.
pub trait ClimatologySource: Sync {
    fn attrs(&self) -> &Map<String, Value>;

    fn coord(&self, name: &str) -> Option<&Variable>;

    fn coords(&self) -> Vec<&Variable>;

    fn data_vars(&self) -> Vec<VariableSchema>;

    /// Values of `name` over `ranges`, one range per axis.
    fn read_block(&self, name: &str, ranges: &[Range<usize>]) -> Result<ArrayData>;

    fn has_coord(&self, name: &str) -> bool {
        self.coord(name).is_some()
    }

    /// Coordinate labels as integers, for label-based lookups.
    fn coord_labels(&self, name: &str) -> Result<Option<Vec<i64>>> {
        self.coord(name).map(|c| c.data.to_labels(name)).transpose()
    }
}
