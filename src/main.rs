use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use orbit_queue::cli::{self, WorkerArgs};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = WorkerArgs::parse();
    cli::run(args, None).await
}
