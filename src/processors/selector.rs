use chrono::{Datelike, NaiveDateTime, Timelike};
use ndarray::{ArrayViewD, Axis};
use std::collections::HashMap;
use std::ops::Range;

use crate::error::{ExpandError, Result};
use crate::models::array_data::with_element_type;
use crate::models::{ArrayData, ChunkKey, ClimatologySource, Element, Fragment, Variable, VariableSchema};
use crate::utils::constants::{DIM_DAYOFYEAR, DIM_HOUR, DIM_TIME};

/// Position of one output timestamp along the periodic axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PeriodicPosition {
    day: usize,
    hour: Option<usize>,
}

/// Where one timestamp's record sits: which block was read, and the axis
/// indices to take from it (highest axis first).
#[derive(Debug, Clone)]
struct Pick {
    block: usize,
    axes: Vec<(usize, usize)>,
}

/// Maps ranges of the output time index onto climatology records.
///
/// Lookups are by label: each timestamp's day-of-year (and hour-of-day when
/// the climatology has an `hour` coordinate) must be present among the
/// coordinate values, otherwise the selection fails. Only the runs of
/// consecutive days a chunk touches are read from the source.
#[derive(Debug)]
pub struct ClimatologySelector<'a, S: ClimatologySource + ?Sized> {
    climatology: &'a S,
    variables: Vec<VariableSchema>,
    day_index: HashMap<i64, usize>,
    hour_index: Option<HashMap<i64, usize>>,
}

impl<'a, S: ClimatologySource + ?Sized> ClimatologySelector<'a, S> {
    pub fn new(climatology: &'a S) -> Result<Self> {
        let day_index = climatology
            .coord_labels(DIM_DAYOFYEAR)?
            .map(label_index)
            .ok_or_else(|| {
                ExpandError::config(format!("Climatology has no '{}' coordinate", DIM_DAYOFYEAR))
            })?;
        let hour_index = climatology.coord_labels(DIM_HOUR)?.map(label_index);

        Ok(Self {
            climatology,
            variables: climatology.data_vars(),
            day_index,
            hour_index,
        })
    }

    /// Select the climatology for `time_index[range]`, one fragment per variable.
    pub fn select(&self, range: Range<usize>, time_index: &[NaiveDateTime]) -> Result<Fragments> {
        let end = range.end.min(time_index.len());
        if range.start >= end {
            return Err(ExpandError::config(format!(
                "Chunk range {}..{} is outside the time index of length {}",
                range.start,
                range.end,
                time_index.len()
            )));
        }

        let times = time_index[range.start..end].to_vec();
        let positions = self.positions(&times)?;
        let runs = contiguous_runs(positions.iter().map(|p| p.day).collect());

        let variables = self
            .variables
            .iter()
            .map(|schema| self.select_variable(schema, &positions, &runs))
            .collect::<Result<Vec<_>>>()?;

        Ok(Fragments {
            start: range.start,
            times,
            variables: variables.into_iter(),
        })
    }

    fn positions(&self, times: &[NaiveDateTime]) -> Result<Vec<PeriodicPosition>> {
        times
            .iter()
            .map(|timestamp| {
                let day = lookup(&self.day_index, DIM_DAYOFYEAR, timestamp.ordinal() as i64, timestamp)?;
                let hour = match &self.hour_index {
                    Some(index) => Some(lookup(index, DIM_HOUR, timestamp.hour() as i64, timestamp)?),
                    None => None,
                };
                Ok(PeriodicPosition { day, hour })
            })
            .collect()
    }

    fn is_periodic(&self, dim: &str) -> bool {
        dim == DIM_DAYOFYEAR || (dim == DIM_HOUR && self.hour_index.is_some())
    }

    fn select_variable(
        &self,
        schema: &VariableSchema,
        positions: &[PeriodicPosition],
        runs: &[Range<usize>],
    ) -> Result<Variable> {
        let day_axis = schema.axis_of(DIM_DAYOFYEAR);
        let hour_axis = self.hour_index.as_ref().and_then(|_| schema.axis_of(DIM_HOUR));

        let full: Vec<Range<usize>> = schema.shape.iter().map(|&size| 0..size).collect();
        let blocks: Vec<ArrayData> = match day_axis {
            Some(axis) => runs
                .iter()
                .map(|run| {
                    let mut ranges = full.clone();
                    ranges[axis] = run.clone();
                    self.climatology.read_block(&schema.name, &ranges)
                })
                .collect::<Result<_>>()?,
            // No day axis: one whole read, broadcast along time
            None => vec![self.climatology.read_block(&schema.name, &full)?],
        };

        let picks: Vec<Pick> = positions
            .iter()
            .map(|pos| {
                let mut pick = Pick {
                    block: 0,
                    axes: Vec::with_capacity(2),
                };
                if let Some(axis) = day_axis {
                    pick.block = runs.partition_point(|run| run.end <= pos.day);
                    let run_start = runs.get(pick.block).map_or(pos.day, |run| run.start);
                    pick.axes.push((axis, pos.day - run_start));
                }
                if let (Some(axis), Some(hour)) = (hour_axis, pos.hour) {
                    pick.axes.push((axis, hour));
                }
                // Highest axis first so earlier axis numbers stay valid
                pick.axes.sort_by(|a, b| b.0.cmp(&a.0));
                pick
            })
            .collect();

        let data = with_element_type!(schema.dtype, T => stack_picks::<T>(&schema.name, &blocks, &picks)?);

        let mut dims = vec![DIM_TIME.to_string()];
        dims.extend(schema.dims.iter().filter(|d| !self.is_periodic(d)).cloned());

        Ok(Variable {
            name: schema.name.clone(),
            dims,
            fill_value: schema.fill_value.clone(),
            attrs: schema.attrs.clone(),
            data,
        })
    }
}

/// Take each pick's record from its block and stack them along a new leading axis.
fn stack_picks<T: Element>(name: &str, blocks: &[ArrayData], picks: &[Pick]) -> Result<ArrayData> {
    let typed = blocks
        .iter()
        .map(|block| {
            block.typed::<T>().ok_or_else(|| {
                ExpandError::config(format!(
                    "Variable '{}' read as {} but is declared {}",
                    name,
                    block.dtype(),
                    T::DTYPE
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let views: Vec<ArrayViewD<T>> = picks
        .iter()
        .map(|pick| {
            let block = typed.get(pick.block).ok_or_else(|| {
                ExpandError::config(format!("Variable '{}' has no block {}", name, pick.block))
            })?;
            Ok(pick
                .axes
                .iter()
                .fold(block.view(), |view, &(axis, index)| {
                    view.index_axis_move(Axis(axis), index)
                }))
        })
        .collect::<Result<_>>()?;

    Ok(ndarray::stack(Axis(0), &views)?.into())
}

/// Group positions into sorted runs of consecutive indices.
fn contiguous_runs(mut positions: Vec<usize>) -> Vec<Range<usize>> {
    positions.sort_unstable();
    positions.dedup();

    let mut runs: Vec<Range<usize>> = Vec::new();
    for position in positions {
        match runs.last_mut() {
            Some(run) if run.end == position => run.end += 1,
            _ => runs.push(position..position + 1),
        }
    }
    runs
}

/// Lazily pairs each selected variable with its write key.
#[derive(Debug)]
pub struct Fragments {
    start: usize,
    times: Vec<NaiveDateTime>,
    variables: std::vec::IntoIter<Variable>,
}

impl Iterator for Fragments {
    type Item = (ChunkKey, Fragment);

    fn next(&mut self) -> Option<Self::Item> {
        let variable = self.variables.next()?;
        let key = ChunkKey::for_time_chunk(self.start, &variable.name);
        let fragment = Fragment {
            times: self.times.clone(),
            variable,
        };
        Some((key, fragment))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.variables.size_hint()
    }
}

impl ExactSizeIterator for Fragments {}

/// Select the climatology matching `time_index[range]`.
pub fn select_climatology<S: ClimatologySource + ?Sized>(
    range: Range<usize>,
    climatology: &S,
    time_index: &[NaiveDateTime],
) -> Result<Fragments> {
    ClimatologySelector::new(climatology)?.select(range, time_index)
}

fn label_index(labels: Vec<i64>) -> HashMap<i64, usize> {
    labels
        .into_iter()
        .enumerate()
        .map(|(position, label)| (label, position))
        .collect()
}

fn lookup(
    index: &HashMap<i64, usize>,
    dim: &str,
    label: i64,
    timestamp: &NaiveDateTime,
) -> Result<usize> {
    index.get(&label).copied().ok_or_else(|| ExpandError::Lookup {
        dim: dim.to_string(),
        label,
        timestamp: *timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Dataset;
    use crate::processors::time_grid::time_range;
    use crate::utils::time::parse_timestamp;
    use chrono::Duration;
    use ndarray::{Array1, Array2, Array3};
    use pretty_assertions::assert_eq;
    use serde_json::{Map, Value};
    use std::sync::Mutex;

    fn ts(value: &str) -> NaiveDateTime {
        parse_timestamp(value).unwrap()
    }

    fn coord(name: &str, labels: Vec<i64>) -> Variable {
        Variable::new(name, &[name], Array1::from(labels).into_dyn()).unwrap()
    }

    fn values(variable: &Variable) -> Vec<f64> {
        variable.data.typed::<f64>().unwrap().iter().copied().collect()
    }

    /// Daily climatology over `days`, value = day * 100 + x for two variables.
    fn daily_climatology(days: std::ops::RangeInclusive<i64>) -> Dataset {
        let labels: Vec<i64> = days.collect();
        let n = labels.len();
        let t2m = Array2::from_shape_fn((n, 3), |(i, x)| (labels[i] * 100) as f64 + x as f64);
        let z500 = Array2::from_shape_fn((n, 3), |(i, x)| -((labels[i] * 100) as f32 + x as f32));

        Dataset::new()
            .with_variable(coord("dayofyear", labels.clone()))
            .with_variable(coord("x", vec![0, 1, 2]))
            .with_variable(Variable::new("t2m", &["dayofyear", "x"], t2m.into_dyn()).unwrap())
            .with_variable(
                Variable::new("z500", &["x", "dayofyear"], z500.t().to_owned().into_dyn()).unwrap(),
            )
    }

    fn hourly_climatology() -> Dataset {
        let hours = vec![0i64, 6, 12, 18];
        let values = Array3::from_shape_fn((4, 366, 2), |(h, d, x)| {
            (hours[h] * 1000) as f64 + (d + 1) as f64 + x as f64 / 10.0
        });

        Dataset::new()
            .with_variable(coord("hour", hours.clone()))
            .with_variable(coord("dayofyear", (1..=366).collect()))
            .with_variable(Variable::new("t2m", &["hour", "dayofyear", "x"], values.into_dyn()).unwrap())
    }

    /// Records every block read so tests can see what a selection touched.
    struct RecordingSource {
        inner: Dataset,
        reads: Mutex<Vec<(String, Vec<Range<usize>>)>>,
    }

    impl ClimatologySource for RecordingSource {
        fn attrs(&self) -> &Map<String, Value> {
            self.inner.attrs()
        }

        fn coord(&self, name: &str) -> Option<&Variable> {
            self.inner.coord(name)
        }

        fn coords(&self) -> Vec<&Variable> {
            self.inner.coords()
        }

        fn data_vars(&self) -> Vec<VariableSchema> {
            self.inner.data_vars()
        }

        fn read_block(&self, name: &str, ranges: &[Range<usize>]) -> Result<ArrayData> {
            self.reads
                .lock()
                .unwrap()
                .push((name.to_string(), ranges.to_vec()));
            self.inner.read_block(name, ranges)
        }
    }

    #[test]
    fn test_single_day_climatology_repeats_value() {
        let clim = daily_climatology(1..=1);
        let times = time_range(ts("2017-01-01"), ts("2017-01-01"), Duration::hours(24)).unwrap();

        let fragments: Vec<_> = select_climatology(0..1, &clim, &times).unwrap().collect();
        let (_, t2m) = fragments.iter().find(|(k, _)| k.vars.contains("t2m")).unwrap();
        assert_eq!(values(&t2m.variable), vec![100.0, 101.0, 102.0]);
    }

    #[test]
    fn test_values_follow_day_of_year() {
        let clim = daily_climatology(1..=366);
        let times = time_range(ts("2017-12-30"), ts("2018-01-02"), Duration::hours(24)).unwrap();

        let (key, fragment) = select_climatology(0..4, &clim, &times)
            .unwrap()
            .find(|(k, _)| k.vars.contains("t2m"))
            .unwrap();

        assert_eq!(key, ChunkKey::for_time_chunk(0, "t2m"));
        assert_eq!(fragment.variable.dims, vec!["time", "x"]);
        let data = fragment.variable.data.typed::<f64>().unwrap();
        let first_column: Vec<f64> = data.index_axis(Axis(1), 0).iter().copied().collect();
        assert_eq!(first_column, vec![36400.0, 36500.0, 100.0, 200.0]);
    }

    #[test]
    fn test_non_leading_periodic_axis() {
        let clim = daily_climatology(1..=366);
        let times = time_range(ts("2017-02-01"), ts("2017-02-03"), Duration::hours(24)).unwrap();

        let (_, fragment) = select_climatology(1..3, &clim, &times)
            .unwrap()
            .find(|(k, _)| k.vars.contains("z500"))
            .unwrap();

        assert_eq!(fragment.variable.dims, vec!["time", "x"]);
        assert_eq!(fragment.variable.shape(), &[2, 3]);
        assert_eq!(fragment.variable.data.typed::<f32>().unwrap()[[0, 2]], -3302.0);
        assert_eq!(fragment.times, vec![ts("2017-02-02"), ts("2017-02-03")]);
    }

    #[test]
    fn test_hour_aware_selection() {
        let clim = hourly_climatology();
        let times = time_range(ts("2017-01-01T00"), ts("2017-01-01T18"), Duration::hours(6)).unwrap();
        assert_eq!(times.len(), 4);

        let fragments: Vec<_> = select_climatology(0..4, &clim, &times).unwrap().collect();
        assert_eq!(fragments.len(), 1);

        let variable = &fragments[0].1.variable;
        assert_eq!(variable.dims, vec!["time", "x"]);
        let data = variable.data.typed::<f64>().unwrap();
        let per_time: Vec<f64> = data.index_axis(Axis(1), 0).iter().copied().collect();
        assert_eq!(per_time, vec![1.0, 6001.0, 12001.0, 18001.0]);
    }

    #[test]
    fn test_leap_day_resolves_when_present() {
        let clim = daily_climatology(1..=366);
        let times = time_range(ts("2020-12-31"), ts("2020-12-31"), Duration::hours(24)).unwrap();

        let (_, fragment) = select_climatology(0..1, &clim, &times)
            .unwrap()
            .find(|(k, _)| k.vars.contains("t2m"))
            .unwrap();
        assert_eq!(fragment.variable.data.typed::<f64>().unwrap()[[0, 0]], 36600.0);
    }

    #[test]
    fn test_missing_day_366_is_lookup_error() {
        let clim = daily_climatology(1..=365);
        let times = time_range(ts("2020-12-30"), ts("2021-01-01"), Duration::hours(24)).unwrap();

        match select_climatology(0..3, &clim, &times) {
            Err(ExpandError::Lookup { dim, label, timestamp }) => {
                assert_eq!(dim, "dayofyear");
                assert_eq!(label, 366);
                assert_eq!(timestamp, ts("2020-12-31"));
            }
            other => panic!("expected lookup error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_hour_is_lookup_error() {
        let clim = hourly_climatology();
        let times = vec![ts("2017-01-01T03")];

        assert!(matches!(
            select_climatology(0..1, &clim, &times),
            Err(ExpandError::Lookup { ref dim, label: 3, .. }) if dim == "hour"
        ));
    }

    #[test]
    fn test_one_fragment_per_variable() {
        let clim = daily_climatology(1..=366);
        let times = time_range(ts("2017-01-01"), ts("2017-01-31"), Duration::hours(24)).unwrap();

        let fragments: Vec<_> = select_climatology(10..20, &clim, &times).unwrap().collect();
        assert_eq!(fragments.len(), 2);

        for (key, fragment) in &fragments {
            assert_eq!(key.vars.len(), 1);
            assert_eq!(key.offset("time"), 10);
            assert_eq!(fragment.time_len(), 10);
            assert_eq!(fragment.variable.shape()[0], 10);
            assert!(key.vars.contains(fragment.name()));
        }
    }

    #[test]
    fn test_selection_is_idempotent() {
        let clim = daily_climatology(1..=366);
        let times = time_range(ts("2019-03-01"), ts("2019-05-01"), Duration::hours(24)).unwrap();
        let selector = ClimatologySelector::new(&clim).unwrap();

        let first: Vec<_> = selector.select(30..60, &times).unwrap().collect();
        let second: Vec<_> = selector.select(30..60, &times).unwrap().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_short_final_chunk_clipped() {
        let clim = daily_climatology(1..=366);
        let times = time_range(ts("2017-01-01"), ts("2017-01-10"), Duration::hours(24)).unwrap();

        let fragments: Vec<_> = select_climatology(8..12, &clim, &times).unwrap().collect();
        assert!(fragments.iter().all(|(_, f)| f.time_len() == 2));

        assert!(matches!(
            select_climatology(12..16, &clim, &times),
            Err(ExpandError::Configuration(_))
        ));
    }

    #[test]
    fn test_static_variable_broadcast_along_time() {
        let clim = daily_climatology(1..=366).with_variable(
            Variable::new("orography", &["x"], Array1::from(vec![5.0f64, 6.0, 7.0]).into_dyn()).unwrap(),
        );
        let times = time_range(ts("2017-01-01"), ts("2017-01-02"), Duration::hours(24)).unwrap();

        let (_, fragment) = select_climatology(0..2, &clim, &times)
            .unwrap()
            .find(|(k, _)| k.vars.contains("orography"))
            .unwrap();
        assert_eq!(fragment.variable.dims, vec!["time", "x"]);
        assert_eq!(values(&fragment.variable), vec![5.0, 6.0, 7.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_reads_only_touched_day_runs() {
        let source = RecordingSource {
            inner: daily_climatology(1..=366),
            reads: Mutex::new(Vec::new()),
        };
        let times = time_range(ts("2017-12-30"), ts("2018-01-02"), Duration::hours(24)).unwrap();

        let (_, fragment) = select_climatology(0..4, &source, &times)
            .unwrap()
            .find(|(k, _)| k.vars.contains("t2m"))
            .unwrap();
        assert_eq!(
            values(&fragment.variable).into_iter().step_by(3).collect::<Vec<_>>(),
            vec![36400.0, 36500.0, 100.0, 200.0]
        );

        // Days 1-2 and 364-365 wrap the year: two reads per variable, never the whole year
        let reads = source.reads.lock().unwrap();
        let t2m_reads: Vec<&Vec<Range<usize>>> = reads
            .iter()
            .filter(|(name, _)| name == "t2m")
            .map(|(_, ranges)| ranges)
            .collect();
        assert_eq!(t2m_reads, vec![&vec![0..2, 0..3], &vec![363..365, 0..3]]);

        let z500_reads: Vec<&Vec<Range<usize>>> = reads
            .iter()
            .filter(|(name, _)| name == "z500")
            .map(|(_, ranges)| ranges)
            .collect();
        assert_eq!(z500_reads, vec![&vec![0..3, 0..2], &vec![0..3, 363..365]]);
    }

    #[test]
    fn test_integer_values_keep_their_type() {
        let big = (1i64 << 53) + 1;
        let counts = Array2::from_shape_fn((366, 1), |(d, _)| big + d as i64);
        let clim = Dataset::new()
            .with_variable(coord("dayofyear", (1..=366).collect()))
            .with_variable(Variable::new("count", &["dayofyear", "x"], counts.into_dyn()).unwrap());
        let times = time_range(ts("2017-01-01"), ts("2017-01-03"), Duration::hours(24)).unwrap();

        let (_, fragment) = select_climatology(0..3, &clim, &times).unwrap().next().unwrap();
        assert_eq!(
            fragment.variable.data.typed::<i64>().unwrap().iter().copied().collect::<Vec<_>>(),
            vec![big, big + 1, big + 2]
        );
    }

    #[test]
    fn test_runs_group_consecutive_positions() {
        assert_eq!(contiguous_runs(vec![364, 365, 0, 1, 1]), vec![0..2, 364..366]);
        assert_eq!(contiguous_runs(vec![5]), vec![5..6]);
        assert_eq!(contiguous_runs(vec![3, 1, 2]), vec![1..4]);
    }
}
