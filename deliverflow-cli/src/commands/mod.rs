//! CLI command definitions and dispatch.

pub mod plan;
pub mod purge;
pub mod run;
pub mod slug;

use anyhow::Context;
use clap::{Parser, Subcommand};
use deliverflow::observability::{init_logging, LogFormat};
use deliverflow::pipeline::PipelineConfig;
use std::path::{Path, PathBuf};

/// Stage-sequenced build, test and volume-image delivery.
#[derive(Parser, Debug)]
#[command(name = "deliverflow", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Log output format (text or json).
    #[arg(long, global = true, env = "DELIVERFLOW_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a pipeline.
    Run(run::RunArgs),
    /// Print the stage schedule of a pipeline without running it.
    Plan(plan::PlanArgs),
    /// Remove artifacts whose retention elapsed.
    Purge(purge::PurgeArgs),
    /// Print the slug of a ref name.
    Slug(slug::SlugArgs),
}

/// Dispatches the parsed command and returns the process exit code.
///
/// # Errors
///
/// Returns an error if the command cannot be carried out.
pub async fn execute(cli: Cli) -> anyhow::Result<i32> {
    if let Some(format) = cli.log_format {
        init_logging(format)?;
    } else if !matches!(cli.command, Command::Run(_)) {
        init_logging(LogFormat::default())?;
    }

    match cli.command {
        Command::Run(args) => run::execute(args, cli.log_format).await,
        Command::Plan(args) => plan::execute(&args),
        Command::Purge(args) => purge::execute(&args),
        Command::Slug(args) => Ok(slug::execute(&args)),
    }
}

/// Loads a pipeline file, or the reference pipeline when none is given.
pub(crate) fn load_pipeline(file: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match file {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("cannot load pipeline from {}", path.display())),
        None => Ok(PipelineConfig::reference()),
    }
}

/// Pipeline file argument shared by `run` and `plan`.
#[derive(clap::Args, Debug, Clone)]
pub struct PipelineArg {
    /// Pipeline definition; the built-in reference pipeline when omitted.
    #[arg(long, short = 'f', env = "DELIVERFLOW_PIPELINE")]
    pub file: Option<PathBuf>,
}
