//! `deliverflow plan`: show what a pipeline would run, in order.

use super::{load_pipeline, PipelineArg};
use clap::Args;
use deliverflow::pipeline::StageGraph;
use deliverflow::utils::format_duration;
use std::fmt::Write;

/// Arguments for the `plan` command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub pipeline: PipelineArg,

    /// Print the validated pipeline as YAML instead.
    #[arg(long)]
    pub yaml: bool,

    /// Make deploy wait for every test stage.
    #[arg(long)]
    pub gate_deploy_on_tests: bool,
}

/// Executes the `plan` command.
///
/// # Errors
///
/// Returns an error if the pipeline cannot be loaded or fails validation.
pub fn execute(args: &PlanArgs) -> anyhow::Result<i32> {
    let mut pipeline = load_pipeline(args.pipeline.file.as_deref())?;
    if args.gate_deploy_on_tests {
        pipeline = pipeline.with_gate_deploy_on_tests(true);
    }
    let graph = pipeline.to_graph()?;
    if args.yaml {
        print!("{}", pipeline.to_yaml()?);
    } else {
        print!("{}", render(&graph));
    }
    Ok(0)
}

/// One line per stage in execution order.
fn render(graph: &StageGraph) -> String {
    let mut out = format!("pipeline {} ({} stages)\n", graph.name(), graph.stage_count());
    for (i, stage) in graph.stages().enumerate() {
        let needs = if stage.dependencies.is_empty() {
            "-".to_string()
        } else {
            stage.dependencies.iter().cloned().collect::<Vec<_>>().join(",")
        };
        let _ = writeln!(
            out,
            "{:>2}. {:<16} {:<8} image={} needs={needs} artifacts=[{}] expire_in={}",
            i + 1,
            stage.name,
            stage.kind.to_string(),
            stage.image,
            stage.artifacts.paths.join(","),
            format_duration(stage.artifacts.expire_in),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use deliverflow::pipeline::PipelineConfig;

    #[test]
    fn test_render_reference_plan() {
        let graph = PipelineConfig::reference().to_graph().unwrap();
        let plan = render(&graph);
        let lines: Vec<&str> = plan.lines().collect();
        assert_eq!(lines[0], "pipeline performance_test (3 stages)");
        assert!(lines[1].contains("build") && lines[1].contains("needs=-"));
        assert!(lines[2].contains("test") && lines[2].contains("needs=build"));
        assert!(lines[3].contains("deploy") && lines[3].contains("needs=build"));
    }
}
