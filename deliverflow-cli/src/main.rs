//! # deliverflow
//!
//! Runs build, test and deploy pipelines from a YAML definition.

#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

mod commands;

use clap::Parser;

use crate::commands::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let code = commands::execute(cli).await?;
    std::process::exit(code);
}
