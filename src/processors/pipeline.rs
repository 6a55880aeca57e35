use crossbeam::channel;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{ensure_distinct_paths, ExpandConfig, Runner};
use crate::error::{ExpandError, Result};
use crate::models::{ChunkExtent, ChunkKey, ChunkLayout, ClimatologySource, Fragment, Template};
use crate::processors::{ChunkDispatcher, ClimatologySelector, TimeGrid};
use crate::store::{self, ChunkSink, ZarrClimatology};
use crate::utils::progress::ProgressReporter;

/// Everything resolved before the first work item runs.
#[derive(Debug)]
pub struct ExpansionPlan {
    pub climatology: ZarrClimatology,
    pub input_chunks: BTreeMap<String, usize>,
    pub grid: TimeGrid,
    pub template: Template,
    pub layout: ChunkLayout,
    pub dispatcher: ChunkDispatcher,
}

impl ExpansionPlan {
    /// One key per (time chunk, variable).
    pub fn expected_keys(&self) -> BTreeSet<ChunkKey> {
        self.dispatcher
            .offsets()
            .flat_map(|start| {
                self.template
                    .variables
                    .keys()
                    .map(move |name| ChunkKey::for_time_chunk(start, name))
            })
            .collect()
    }

    pub fn summary(&self) -> String {
        let mut out = String::from("=== Expansion Plan ===\n");
        out.push_str(&format!(
            "Time steps: {} ({} .. {}, every {}h)\n",
            self.grid.len(),
            self.grid.times.first().map_or("-".to_string(), |t| t.to_string()),
            self.grid.times.last().map_or("-".to_string(), |t| t.to_string()),
            self.grid.step().num_hours()
        ));
        out.push_str(&format!(
            "Periodic dims: {:?}\n",
            self.grid.periodicity.periodic_dims()
        ));
        out.push_str(&format!(
            "Time chunk size: {} ({} work items)\n",
            self.grid.chunk_size,
            self.dispatcher.chunk_count()
        ));
        out.push_str(&format!(
            "Variables: {}\n",
            self.template.variables.keys().cloned().collect::<Vec<_>>().join(", ")
        ));
        out.push_str("Output chunks:\n");
        for (dim, extent) in self.layout.iter() {
            let extent = match extent {
                ChunkExtent::Full => "whole dimension".to_string(),
                ChunkExtent::Size(size) => size.to_string(),
            };
            out.push_str(&format!("  {}: {}\n", dim, extent));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ExpansionSummary {
    pub runner: Runner,
    pub time_steps: usize,
    pub chunk_size: usize,
    pub work_items: usize,
    pub variables: usize,
    pub fragments_written: usize,
    pub elapsed: Duration,
}

impl ExpansionSummary {
    pub fn summary(&self) -> String {
        format!(
            "=== Expansion Complete ===\nRunner: {}\nTime steps: {}\nTime chunk size: {}\nWork items: {}\nVariables: {}\nFragments written: {}\nElapsed: {:.2}s\n",
            self.runner,
            self.time_steps,
            self.chunk_size,
            self.work_items,
            self.variables,
            self.fragments_written,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Drives open → plan → dispatch → select → write for one run.
pub struct ExpansionPipeline {
    config: ExpandConfig,
}

impl ExpansionPipeline {
    pub fn new(config: ExpandConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExpandConfig {
        &self.config
    }

    /// Open the climatology and resolve the time grid, template and layout.
    pub fn plan(&self) -> Result<ExpansionPlan> {
        let climatology = store::open(&self.config.input_path)?;
        let input_chunks = climatology.native_chunks()?;
        info!(
            path = %self.config.input_path.display(),
            variables = climatology.data_vars().len(),
            chunks = ?input_chunks,
            "Opened climatology"
        );

        let grid = TimeGrid::from_climatology(
            &climatology,
            &input_chunks,
            &self.config.time_start,
            &self.config.time_stop,
            self.config.time_chunk_size,
        )?;
        let template = grid.template(&climatology);
        let layout = ChunkLayout::for_output(
            &input_chunks,
            &grid.periodicity.periodic_dims(),
            grid.chunk_size,
        );
        let dispatcher = ChunkDispatcher::new(grid.len(), grid.chunk_size)?;

        if layout.time_chunk_size() != Some(dispatcher.chunk_size()) {
            return Err(ExpandError::config(
                "Dispatch chunk size differs from the output time chunk size",
            ));
        }

        info!(
            time_steps = grid.len(),
            chunk_size = grid.chunk_size,
            work_items = dispatcher.chunk_count(),
            "Resolved time grid"
        );

        Ok(ExpansionPlan {
            climatology,
            input_chunks,
            grid,
            template,
            layout,
            dispatcher,
        })
    }

    /// Run the whole expansion. The output store is only marked complete
    /// once every (chunk, variable) key has been written.
    pub fn run(&self, progress: Option<&ProgressReporter>) -> Result<ExpansionSummary> {
        let started = Instant::now();

        if let Some(p) = progress {
            p.set_message("Opening climatology...");
        }
        let plan = self.plan()?;
        let expected = plan.expected_keys();

        let selector = ClimatologySelector::new(&plan.climatology)?;
        ensure_distinct_paths(&self.config.input_path, &self.config.output_path)?;
        let sink = ChunkSink::create(
            &self.config.output_path,
            &plan.template,
            &plan.layout,
            self.config.compression,
        )?;

        if let Some(p) = progress {
            p.set_length(expected.len() as u64);
            p.set_message(&format!(
                "Writing {} chunks of {} variables...",
                plan.dispatcher.chunk_count(),
                plan.template.variables.len()
            ));
        }

        let result = match self.config.runner {
            Runner::Direct => self.run_direct(&plan, &selector, &sink, progress),
            Runner::Parallel => self.run_parallel(&plan, &selector, &sink, progress),
        };

        let committed = match result {
            Ok(committed) => committed,
            Err(e) => {
                warn!(error = %e, "Expansion failed; output store left incomplete");
                if let Some(p) = progress {
                    p.abandon_with_message("Expansion failed");
                }
                return Err(e);
            }
        };

        sink.finish(&committed, &expected)?;

        if let Some(p) = progress {
            p.finish_with_message(&format!("Wrote {} fragments", committed.len()));
        }

        Ok(ExpansionSummary {
            runner: self.config.runner,
            time_steps: plan.grid.len(),
            chunk_size: plan.grid.chunk_size,
            work_items: plan.dispatcher.chunk_count(),
            variables: plan.template.variables.len(),
            fragments_written: committed.len(),
            elapsed: started.elapsed(),
        })
    }

    fn run_direct(
        &self,
        plan: &ExpansionPlan,
        selector: &ClimatologySelector<ZarrClimatology>,
        sink: &ChunkSink,
        progress: Option<&ProgressReporter>,
    ) -> Result<BTreeSet<ChunkKey>> {
        let mut committed = BTreeSet::new();

        for start in plan.dispatcher.offsets() {
            debug!(start, "Selecting chunk");
            for (key, fragment) in selector.select(plan.dispatcher.slice(start), &plan.grid.times)? {
                sink.commit(&key, &fragment)?;
                record_commit(&mut committed, key, sink)?;
                if let Some(p) = progress {
                    p.increment(1);
                }
            }
        }

        Ok(committed)
    }

    fn run_parallel(
        &self,
        plan: &ExpansionPlan,
        selector: &ClimatologySelector<ZarrClimatology>,
        sink: &ChunkSink,
        progress: Option<&ProgressReporter>,
    ) -> Result<BTreeSet<ChunkKey>> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers)
            .build()?;

        let offsets: Vec<usize> = plan.dispatcher.offsets().collect();
        let (tx, rx) = channel::bounded::<(ChunkKey, Fragment)>(self.config.channel_capacity);
        let cancelled = AtomicBool::new(false);

        std::thread::scope(|scope| {
            let writers: Vec<_> = (0..self.config.writers)
                .map(|_| {
                    let rx = rx.clone();
                    let cancelled = &cancelled;
                    scope.spawn(move || -> Result<Vec<ChunkKey>> {
                        let mut committed = Vec::new();
                        for (key, fragment) in rx.iter() {
                            if let Err(e) = sink.commit(&key, &fragment) {
                                cancelled.store(true, Ordering::SeqCst);
                                return Err(e);
                            }
                            if let Some(p) = progress {
                                p.increment(1);
                            }
                            committed.push(key);
                        }
                        Ok(committed)
                    })
                })
                .collect();
            drop(rx);

            let produced: Result<()> = pool.install(|| {
                offsets.par_iter().try_for_each_with(tx, |tx, &start| {
                    if cancelled.load(Ordering::SeqCst) {
                        return Err(ExpandError::Cancelled);
                    }
                    debug!(start, "Selecting chunk");
                    for pair in selector.select(plan.dispatcher.slice(start), &plan.grid.times)? {
                        tx.send(pair).map_err(|_| ExpandError::Cancelled)?;
                    }
                    Ok(())
                })
            });
            if produced.is_err() {
                cancelled.store(true, Ordering::SeqCst);
            }

            let mut committed = BTreeSet::new();
            let mut writer_error = None;
            for handle in writers {
                match handle.join() {
                    Ok(Ok(keys)) => {
                        for key in keys {
                            if let Err(e) = record_commit(&mut committed, key, sink) {
                                writer_error.get_or_insert(e);
                            }
                        }
                    }
                    Ok(Err(e)) => {
                        writer_error.get_or_insert(e);
                    }
                    Err(_) => {
                        writer_error.get_or_insert(ExpandError::storage(
                            sink.path(),
                            "Writer thread panicked",
                        ));
                    }
                }
            }

            // A failed writer is the root cause of any producer cancellation
            if let Some(e) = writer_error {
                return Err(e);
            }
            produced?;
            Ok(committed)
        })
    }
}

fn record_commit(committed: &mut BTreeSet<ChunkKey>, key: ChunkKey, sink: &ChunkSink) -> Result<()> {
    let description = key.to_string();
    if !committed.insert(key) {
        return Err(ExpandError::storage(
            sink.path(),
            format!("{} was written more than once", description),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Compression, ConfigOverrides};
    use crate::models::{Dataset, Variable};
    use crate::store::{inspect, write_dataset};
    use ndarray::{Array, Array1, IxDyn};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn write_climatology(dir: &Path) -> PathBuf {
        let clim = Dataset::new()
            .with_variable(
                Variable::new("dayofyear", &["dayofyear"], Array1::from_iter(1i64..=366).into_dyn())
                    .unwrap(),
            )
            .with_variable(
                Variable::new("a", &["dayofyear"], Array::<f64, _>::zeros(IxDyn(&[366]))).unwrap(),
            )
            .with_variable(
                Variable::new("b", &["dayofyear"], Array::<f64, _>::ones(IxDyn(&[366]))).unwrap(),
            );
        let path = dir.join("clim.zarr");
        let chunks = [("dayofyear".to_string(), 10)].into_iter().collect();
        write_dataset(&path, &clim, &chunks, Compression::Zstd).unwrap();
        path
    }

    fn overrides(dir: &Path, runner: Runner) -> ConfigOverrides {
        ConfigOverrides {
            input_path: Some(write_climatology(dir)),
            output_path: Some(dir.join("out.zarr")),
            time_stop: Some("2017-01-25".to_string()),
            runner: Some(runner),
            workers: Some(2),
            writers: Some(3),
            ..Default::default()
        }
    }

    fn pipeline(dir: &Path, runner: Runner) -> ExpansionPipeline {
        ExpansionPipeline::new(ExpandConfig::resolve(overrides(dir, runner)).unwrap())
    }

    #[test]
    fn test_expected_keys_cover_chunks_and_variables() {
        let tmp = TempDir::new().unwrap();
        let plan = pipeline(tmp.path(), Runner::Direct).plan().unwrap();

        let keys = plan.expected_keys();
        assert_eq!(plan.dispatcher.offsets().collect::<Vec<_>>(), vec![0, 10, 20]);
        assert_eq!(keys.len(), 6);
        assert!(keys.contains(&ChunkKey::for_time_chunk(20, "b")));
    }

    #[test]
    fn test_runners_write_every_key_once() {
        for runner in [Runner::Direct, Runner::Parallel] {
            let tmp = TempDir::new().unwrap();
            let summary = pipeline(tmp.path(), runner).run(None).unwrap();
            assert_eq!(summary.fragments_written, 6);
            assert_eq!(summary.time_steps, 25);
            assert!(inspect(&tmp.path().join("out.zarr")).unwrap().complete);
        }
    }

    #[test]
    fn test_run_refuses_output_aliasing_input() {
        let tmp = TempDir::new().unwrap();
        // Bypass resolve() so the pipeline's own check is exercised
        let mut config = ExpandConfig::resolve(overrides(tmp.path(), Runner::Direct)).unwrap();
        config.output_path = tmp.path().join("missing").join("..").join("clim.zarr");

        let result = ExpansionPipeline::new(config).run(None);
        assert!(matches!(result, Err(ExpandError::Configuration(_))));
        assert!(store::open(&tmp.path().join("clim.zarr")).is_ok());
    }

    #[test]
    fn test_duplicate_commit_detected() {
        let tmp = TempDir::new().unwrap();
        let p = pipeline(tmp.path(), Runner::Direct);
        let plan = p.plan().unwrap();
        let sink = ChunkSink::create(
            &p.config().output_path,
            &plan.template,
            &plan.layout,
            Compression::None,
        )
        .unwrap();

        let mut committed = BTreeSet::new();
        record_commit(&mut committed, ChunkKey::for_time_chunk(0, "a"), &sink).unwrap();
        let result = record_commit(&mut committed, ChunkKey::for_time_chunk(0, "a"), &sink);
        assert!(matches!(result, Err(ExpandError::Storage { ref message, .. }) if message.contains("more than once")));
    }
}
