use clap::Parser;
use clim_expand::cli::{run, Cli};
use clim_expand::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
