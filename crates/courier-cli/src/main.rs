mod bootstrap_helpers;
mod cli_args;
mod commands;
mod render;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::Cli;
use crate::commands::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let output = run_cli(cli).await?;
    print!("{output}");
    Ok(())
}
