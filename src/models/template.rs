use chrono::NaiveDateTime;
use ndarray::Array1;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{ExpandError, Result};
use crate::models::{ClimatologySource, Variable, VariableSchema};
use crate::utils::constants::{DIM_TIME, TIME_CALENDAR};
use crate::utils::time::format_cf_timestamp;

/// Zero-data description of the expanded output.
///
/// Periodic dimensions are collapsed away and every data variable gains a
/// leading `time` dimension sized to the full time index. Non-periodic
/// coordinates are carried with their values so they can be written up front.
#[derive(Debug, Clone)]
pub struct Template {
    pub times: Vec<NaiveDateTime>,
    pub coords: Vec<Variable>,
    pub variables: BTreeMap<String, VariableSchema>,
    pub attrs: Map<String, Value>,
}

impl Template {
    pub fn from_climatology<S: ClimatologySource + ?Sized>(
        climatology: &S,
        periodic_dims: &[&str],
        times: Vec<NaiveDateTime>,
    ) -> Self {
        let is_periodic = |dim: &str| periodic_dims.contains(&dim);

        let coords = climatology
            .coords()
            .into_iter()
            .filter(|c| !is_periodic(&c.name))
            .cloned()
            .collect();

        let variables = climatology
            .data_vars()
            .into_iter()
            .map(|var| {
                let mut dims = vec![DIM_TIME.to_string()];
                let mut shape = vec![times.len()];
                for (dim, &size) in var.dims.iter().zip(&var.shape) {
                    if !is_periodic(dim) {
                        dims.push(dim.clone());
                        shape.push(size);
                    }
                }

                let schema = VariableSchema {
                    dims,
                    shape,
                    ..var
                };
                (schema.name.clone(), schema)
            })
            .collect();

        Self {
            times,
            coords,
            variables,
            attrs: climatology.attrs().clone(),
        }
    }

    pub fn time_len(&self) -> usize {
        self.times.len()
    }

    pub fn variable(&self, name: &str) -> Option<&VariableSchema> {
        self.variables.get(name)
    }

    /// The `time` coordinate encoded CF-style as integer hours since the first timestamp.
    pub fn time_coordinate(&self) -> Result<Variable> {
        let origin = self
            .times
            .first()
            .ok_or_else(|| ExpandError::config("Template has an empty time index"))?;

        let hours: Array1<i64> = self
            .times
            .iter()
            .map(|t| (*t - *origin).num_hours())
            .collect();

        let variable = Variable::new(DIM_TIME, &[DIM_TIME], hours.into_dyn())?
            .with_attr(
                "units",
                Value::String(format!("hours since {}", format_cf_timestamp(origin))),
            )
            .with_attr("calendar", Value::String(TIME_CALENDAR.to_string()));

        Ok(variable)
    }
}
