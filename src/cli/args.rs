use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{Compression, ConfigOverrides, Runner};

#[derive(Parser)]
#[command(name = "clim-expand")]
#[command(about = "Expand a dayofyear/hour climatology into a dense time series Zarr store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Suppress progress output")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Expand a climatology store along a time axis
    Expand {
        #[arg(short, long, help = "Input climatology Zarr store")]
        input_path: Option<PathBuf>,

        #[arg(short, long, help = "Output Zarr store")]
        output_path: Option<PathBuf>,

        #[arg(long, help = "First output timestamp [default: 2017-01-01]")]
        time_start: Option<String>,

        #[arg(long, help = "Last output timestamp, inclusive [default: 2017-12-31]")]
        time_stop: Option<String>,

        #[arg(
            long,
            help = "Time steps per output chunk [default: input dayofyear chunk * hour chunk]"
        )]
        time_chunk_size: Option<usize>,

        #[arg(long, value_enum, help = "Execution runtime [default: parallel]")]
        runner: Option<Runner>,

        #[arg(long, value_enum, help = "Output chunk compression [default: zstd]")]
        compression: Option<Compression>,

        #[arg(long, help = "Selection worker threads [default: number of CPUs]")]
        workers: Option<usize>,

        #[arg(long, help = "Writer threads for the parallel runner [default: 4]")]
        writers: Option<usize>,

        #[arg(short, long, help = "TOML config file")]
        config: Option<PathBuf>,

        #[arg(long, default_value = "false", help = "Print the plan without writing")]
        dry_run: bool,
    },

    /// Display information about a Zarr store
    Info {
        #[arg(short, long)]
        path: PathBuf,
    },
}

impl Commands {
    /// Command-line values for `expand`, layered over file and environment.
    pub fn overrides(&self) -> ConfigOverrides {
        match self {
            Commands::Expand {
                input_path,
                output_path,
                time_start,
                time_stop,
                time_chunk_size,
                runner,
                compression,
                workers,
                writers,
                ..
            } => ConfigOverrides {
                input_path: input_path.clone(),
                output_path: output_path.clone(),
                time_start: time_start.clone(),
                time_stop: time_stop.clone(),
                time_chunk_size: *time_chunk_size,
                runner: *runner,
                compression: *compression,
                workers: *workers,
                writers: *writers,
                channel_capacity: None,
            },
            Commands::Info { .. } => ConfigOverrides::default(),
        }
    }
}
