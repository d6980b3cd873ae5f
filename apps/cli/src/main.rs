//! Archivist CLI: find documents on the Internet Archive for a free-text query.
//!
//! Runs the search, filter, metadata, finder, file finder and downloader
//! stages, caching each query's results on disk.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
