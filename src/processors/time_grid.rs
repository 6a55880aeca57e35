use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;

use crate::error::{ExpandError, Result};
use crate::models::{ClimatologySource, Template};
use crate::utils::constants::{DIM_DAYOFYEAR, DIM_HOUR, HOURS_PER_DAY};
use crate::utils::time::parse_timestamp;

/// Which periodic coordinates a climatology carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Periodicity {
    /// Spacing of the `hour` coordinate, or `None` for a daily climatology.
    pub hour_step: Option<i64>,
}

impl Periodicity {
    pub fn daily() -> Self {
        Self { hour_step: None }
    }

    pub fn hourly(step: i64) -> Result<Self> {
        if step <= 0 {
            return Err(ExpandError::config(format!(
                "Hour coordinate step must be positive, got {}",
                step
            )));
        }
        Ok(Self {
            hour_step: Some(step),
        })
    }

    /// Detect the periodic coordinates by name.
    pub fn detect<S: ClimatologySource + ?Sized>(climatology: &S) -> Result<Self> {
        if !climatology.has_coord(DIM_DAYOFYEAR) {
            return Err(ExpandError::config(format!(
                "Climatology has no '{}' coordinate",
                DIM_DAYOFYEAR
            )));
        }

        match climatology.coord_labels(DIM_HOUR)? {
            None => Ok(Self::daily()),
            Some(hours) if hours.len() < 2 => Err(ExpandError::config(format!(
                "Cannot derive the hour step from {} hour label(s)",
                hours.len()
            ))),
            Some(hours) => Self::hourly(hours[1] - hours[0]),
        }
    }

    pub fn step(&self) -> Duration {
        Duration::hours(self.hour_step.unwrap_or(HOURS_PER_DAY))
    }

    /// Dimensions collapsed away in the output.
    pub fn periodic_dims(&self) -> Vec<&'static str> {
        match self.hour_step {
            Some(_) => vec![DIM_HOUR, DIM_DAYOFYEAR],
            None => vec![DIM_DAYOFYEAR],
        }
    }
}

/// Output timestamps plus the chunk size used to split them.
#[derive(Debug, Clone)]
pub struct TimeGrid {
    pub times: Vec<NaiveDateTime>,
    pub chunk_size: usize,
    pub periodicity: Periodicity,
}

impl TimeGrid {
    pub fn new(
        periodicity: Periodicity,
        time_start: &str,
        time_stop: &str,
        time_chunk_size: Option<usize>,
        input_chunks: &BTreeMap<String, usize>,
    ) -> Result<Self> {
        let start = parse_timestamp(time_start)?;
        let stop = parse_timestamp(time_stop)?;
        let times = time_range(start, stop, periodicity.step())?;
        let chunk_size = resolve_chunk_size(time_chunk_size, input_chunks)?;

        Ok(Self {
            times,
            chunk_size,
            periodicity,
        })
    }

    pub fn from_climatology<S: ClimatologySource + ?Sized>(
        climatology: &S,
        input_chunks: &BTreeMap<String, usize>,
        time_start: &str,
        time_stop: &str,
        time_chunk_size: Option<usize>,
    ) -> Result<Self> {
        let periodicity = Periodicity::detect(climatology)?;
        Self::new(periodicity, time_start, time_stop, time_chunk_size, input_chunks)
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn step(&self) -> Duration {
        self.periodicity.step()
    }

    pub fn template<S: ClimatologySource + ?Sized>(&self, climatology: &S) -> Template {
        Template::from_climatology(
            climatology,
            &self.periodicity.periodic_dims(),
            self.times.clone(),
        )
    }
}

/// Timestamps from `start` to `stop` inclusive, spaced by `step`. A `stop`
/// that falls between steps is not itself included.
pub fn time_range(start: NaiveDateTime, stop: NaiveDateTime, step: Duration) -> Result<Vec<NaiveDateTime>> {
    if stop < start {
        return Err(ExpandError::config(format!(
            "time_stop {} precedes time_start {}",
            stop, start
        )));
    }
    if step <= Duration::zero() {
        return Err(ExpandError::config("Time step must be positive"));
    }

    let step_seconds = step.num_seconds();
    if step_seconds <= 0 {
        return Err(ExpandError::config("Time step must be at least one second"));
    }
    let count = (stop - start).num_seconds() / step_seconds + 1;

    (0..count)
        .map(|i| {
            step_seconds
                .checked_mul(i)
                .and_then(Duration::try_seconds)
                .and_then(|offset| start.checked_add_signed(offset))
                .ok_or_else(|| {
                    ExpandError::config(format!(
                        "Timestamp {} steps of {}s after {} is out of range",
                        i, step_seconds, start
                    ))
                })
        })
        .collect()
}

/// Explicit chunk size if given, else the product of the input's native
/// `dayofyear` and `hour` chunk extents.
pub fn resolve_chunk_size(
    time_chunk_size: Option<usize>,
    input_chunks: &BTreeMap<String, usize>,
) -> Result<usize> {
    let chunk_size = match time_chunk_size {
        Some(size) => size,
        None => {
            let days = input_chunks.get(DIM_DAYOFYEAR).copied().ok_or_else(|| {
                ExpandError::config(format!(
                    "Cannot infer time chunk size: input has no '{}' chunking",
                    DIM_DAYOFYEAR
                ))
            })?;
            days * input_chunks.get(DIM_HOUR).copied().unwrap_or(1)
        }
    };

    if chunk_size == 0 {
        return Err(ExpandError::config("Time chunk size must be positive"));
    }
    Ok(chunk_size)
}
