//! `deliverflow run`: execute a pipeline against the current CI environment.

use super::{load_pipeline, PipelineArg};
use anyhow::Context;
use clap::Args;
use deliverflow::artifacts::ArtifactStore;
use deliverflow::config::{parse_isolation, ExecutionMode, OrchestratorConfig};
use deliverflow::context::{PipelineContext, RunEnvironment};
use deliverflow::core::RunStatus;
use deliverflow::events::LoggingEventSink;
use deliverflow::exec::ProcessRunner;
use deliverflow::observability::{init_logging, LogFormat};
use deliverflow::pipeline::RunReport;
use std::path::PathBuf;
use std::sync::Arc;

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArg,

    /// Source tree copied into every stage workspace.
    #[arg(long, default_value = ".")]
    pub source: PathBuf,

    /// Directory for stage sandboxes.
    #[arg(long)]
    pub work_root: Option<PathBuf>,

    /// Directory for stored artifacts.
    #[arg(long)]
    pub artifact_root: Option<PathBuf>,

    /// Run up to N independent stages at once.
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,

    /// Stage isolation: `process`, or a container engine such as `docker`.
    #[arg(long)]
    pub isolation: Option<String>,

    /// Write the JSON run report here.
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Keep stage sandboxes after the run.
    #[arg(long)]
    pub keep_sandboxes: bool,

    /// Make deploy wait for every test stage.
    #[arg(long)]
    pub gate_deploy_on_tests: bool,
}

impl RunArgs {
    /// Layers the flags over the environment-derived configuration.
    fn apply(&self, mut config: OrchestratorConfig) -> anyhow::Result<OrchestratorConfig> {
        config = config.with_source_dir(&self.source);
        if let Some(root) = &self.work_root {
            config = config.with_work_root(root);
        }
        if let Some(root) = &self.artifact_root {
            config = config.with_artifact_root(root);
        }
        if let Some(n) = self.parallel {
            config = config.with_mode(if n > 1 {
                ExecutionMode::Parallel { max_concurrency: n }
            } else {
                ExecutionMode::Sequential
            });
        }
        if let Some(isolation) = &self.isolation {
            config = config.with_isolation(parse_isolation(isolation)?);
        }
        if let Some(report) = &self.report {
            config = config.with_report_path(report);
        }
        if self.keep_sandboxes {
            config = config.with_keep_sandboxes(true);
        }
        Ok(config)
    }
}

/// Executes the `run` command.
///
/// Exits 0 when every stage succeeded, 1 when a stage failed and 130 when
/// the run was interrupted.
///
/// # Errors
///
/// Returns an error if configuration, validation or the artifact store fail.
pub async fn execute(args: RunArgs, log_format: Option<LogFormat>) -> anyhow::Result<i32> {
    let config = args.apply(OrchestratorConfig::from_env()?)?;
    if log_format.is_none() {
        init_logging(config.log_format)?;
    }

    let mut pipeline = load_pipeline(args.pipeline.file.as_deref())?;
    if args.gate_deploy_on_tests {
        pipeline = pipeline.with_gate_deploy_on_tests(true);
    }
    let graph = pipeline.to_graph()?;
    let env = pipeline.apply_variables(RunEnvironment::from_env().context("incomplete CI environment")?);

    let store = ArtifactStore::open(&config.artifact_root)
        .with_context(|| format!("cannot open artifact store at {}", config.artifact_root.display()))?;
    let ctx = Arc::new(
        PipelineContext::new(Arc::new(env), Arc::new(store), Arc::new(ProcessRunner::new()))
            .with_pipeline_name(pipeline.name.clone())
            .with_event_sink(Arc::new(LoggingEventSink::default())),
    );

    let token = Arc::clone(ctx.cancel_token());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, aborting run");
            token.cancel("interrupted");
        }
    });

    let run = graph.execute(ctx, &config).await?;
    let report = run.report();
    print_summary(&report);
    Ok(exit_code(report.status))
}

fn exit_code(status: RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded => 0,
        RunStatus::Cancelled => 130,
        _ => 1,
    }
}

fn print_summary(report: &RunReport) {
    println!("{} {} ({:.1}s)", report.pipeline, report.status, report.duration_ms / 1000.0);
    for stage in &report.stages {
        let detail = stage
            .failure
            .clone()
            .or_else(|| stage.reason.clone())
            .unwrap_or_default();
        println!("  {:<16} {:<10} {detail}", stage.name, stage.status.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Command};
    use clap::Parser;
    use deliverflow::exec::Isolation;
    use pretty_assertions::assert_eq;

    fn run_args(extra: &[&str]) -> RunArgs {
        let argv = ["deliverflow", "run"].into_iter().chain(extra.iter().copied());
        match Cli::parse_from(argv).command {
            Command::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let args = run_args(&["--parallel", "3", "--isolation", "podman", "--report", "out/report.json"]);
        let config = args.apply(OrchestratorConfig::default()).unwrap();
        assert_eq!(config.mode, ExecutionMode::Parallel { max_concurrency: 3 });
        assert_eq!(config.isolation, Isolation::container("podman"));
        assert_eq!(config.report_path, Some(PathBuf::from("out/report.json")));
        assert_eq!(config.source_dir, Some(PathBuf::from(".")));
    }

    #[test]
    fn test_parallel_one_is_sequential() {
        let config = run_args(&["--parallel", "1"]).apply(OrchestratorConfig::default()).unwrap();
        assert_eq!(config.mode, ExecutionMode::Sequential);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(RunStatus::Succeeded), 0);
        assert_eq!(exit_code(RunStatus::Failed), 1);
        assert_eq!(exit_code(RunStatus::Cancelled), 130);
    }
}
