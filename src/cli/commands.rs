use tracing_subscriber::EnvFilter;

use crate::cli::args::{Cli, Commands};
use crate::config::ExpandConfig;
use crate::error::Result;
use crate::processors::ExpansionPipeline;
use crate::store;
use crate::utils::progress::ProgressReporter;

pub async fn run(cli: Cli) -> Result<()> {
    init_logging(cli.verbose);

    let overrides = cli.command.overrides();

    match cli.command {
        Commands::Expand {
            config, dry_run, ..
        } => {
            let config = ExpandConfig::load(config.as_deref(), overrides)?;

            println!("Expanding climatology...");
            println!("Input store: {}", config.input_path.display());
            println!("Output store: {}", config.output_path.display());
            println!(
                "Time range: {} .. {} (runner: {}, workers: {}, writers: {}, compression: {})",
                config.time_start,
                config.time_stop,
                config.runner,
                config.workers,
                config.writers,
                config.compression
            );

            let pipeline = ExpansionPipeline::new(config);

            if dry_run {
                let plan = tokio::task::spawn_blocking(move || pipeline.plan()).await??;
                println!("\n{}", plan.summary());
                println!("Dry run complete - no output store written");
                return Ok(());
            }

            let quiet = cli.quiet;
            let summary = tokio::task::spawn_blocking(move || {
                let progress = ProgressReporter::new(0, "Expanding climatology...", quiet);
                pipeline.run(Some(&progress))
            })
            .await??;

            println!("\n{}", summary.summary());
            println!("Expansion complete!");
        }

        Commands::Info { path } => {
            println!("Inspecting Zarr store: {}", path.display());

            let summary = tokio::task::spawn_blocking(move || store::inspect(&path)).await??;
            println!("\n{}", summary.summary());

            if !summary.complete {
                println!("⚠️  Store is marked incomplete - expansion did not finish");
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A subscriber may already be installed when embedded in another binary
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
