//! StageGraph DAG execution engine.
//!
//! Stages become ready once every dependency has finished. A ready stage
//! runs only if all of its dependencies succeeded; otherwise it is skipped
//! and the skip propagates to its own dependents.

use super::{PipelineRun, StageResult, StageSpec};
use crate::artifacts::Collection;
use crate::cancellation::CancellationToken;
use crate::config::OrchestratorConfig;
use crate::context::{PipelineContext, StageContext, StageInputs};
use crate::core::{StageEvent, StageKind, StageOutput, StageStatus};
use crate::errors::{DeliverError, Result};
use crate::exec::Sandbox;
use crate::observability::{SpanTimer, StageSpanAttributes};
use crate::stages::{error_output, failure_for, run_step, Step};
use crate::utils::{format_iso8601, now_utc};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::Instrument;

/// A directed acyclic graph of stages for execution.
#[derive(Debug)]
pub struct StageGraph {
    /// The pipeline name.
    name: String,
    /// Stage specifications.
    stages: HashMap<String, StageSpec>,
    /// Execution order (topologically sorted).
    execution_order: Vec<String>,
    /// Reverse edges, in execution order.
    dependents: HashMap<String, Vec<String>>,
    /// Shared setup lines.
    before_script: Vec<String>,
}

impl StageGraph {
    /// Creates a new stage graph.
    ///
    /// The graph is expected to be validated already; see [`super::PipelineBuilder`].
    #[must_use]
    pub fn new(
        name: String,
        stages: HashMap<String, StageSpec>,
        stage_order: &[String],
        before_script: Vec<String>,
    ) -> Self {
        let execution_order = topological_sort(&stages, stage_order);

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for stage in &execution_order {
            for dep in &stages[stage].dependencies {
                dependents.entry(dep.clone()).or_default().push(stage.clone());
            }
        }

        Self {
            name,
            stages,
            execution_order,
            dependents,
            before_script,
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the execution order.
    #[must_use]
    pub fn execution_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Returns the shared setup lines.
    #[must_use]
    pub fn before_script(&self) -> &[String] {
        &self.before_script
    }

    /// Looks up a stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.get(name)
    }

    /// Stages in execution order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.execution_order.iter().filter_map(|name| self.stages.get(name))
    }

    /// Stages that list `name` in their dependencies.
    #[must_use]
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map_or(&[], Vec::as_slice)
    }

    /// Executes the graph to completion and returns the terminal run.
    ///
    /// Stages run one at a time in execution order unless the configured
    /// mode allows more. Stage failures never abort the call; they are
    /// recorded in the returned run.
    ///
    /// # Errors
    ///
    /// Returns an error only if the report cannot be written or the graph
    /// deadlocks, which a validated graph never does.
    pub async fn execute(&self, ctx: Arc<PipelineContext>, config: &OrchestratorConfig) -> Result<PipelineRun> {
        let timer = SpanTimer::start(&self.name);
        let mut run = PipelineRun::new(ctx.run_id(), &self.name, self.execution_order.clone());
        let position: HashMap<&str, usize> = self
            .execution_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        tracing::info!(
            pipeline = %self.name,
            run_id = %ctx.run_id(),
            schedule = ?self.execution_order,
            "run started"
        );
        ctx.record(&StageEvent::run_started(&ctx.run_id().to_string(), &self.execution_order));
        run.mark_running();

        // Number of unfinished dependencies per stage.
        let mut in_degree: HashMap<&str, usize> = self
            .stages
            .iter()
            .map(|(name, spec)| (name.as_str(), spec.dependencies.len()))
            .collect();
        let mut ready: BTreeSet<(usize, &str)> = in_degree
            .iter()
            .filter(|(_, &count)| count == 0)
            .map(|(name, _)| (position[name], *name))
            .collect();

        let limit = config.mode.concurrency();
        let mut active = FuturesUnordered::new();

        loop {
            while active.len() < limit {
                let Some((_, name)) = ready.pop_first() else {
                    break;
                };
                let spec = &self.stages[name];
                if ctx.is_cancelled() {
                    let reason = format!("run cancelled: {}", ctx.cancel_token().reason().unwrap_or_default());
                    self.skip(&ctx, &mut run, spec, &reason);
                    self.settle(name, &ctx, &mut run, &mut in_degree, &mut ready, &position);
                    continue;
                }
                active.push(self.run_stage(spec, Arc::clone(&ctx), config));
            }

            let Some(result) = active.next().await else {
                break;
            };
            let name = self.stages[&result.name].name.as_str();
            run.record(result);
            self.settle(name, &ctx, &mut run, &mut in_degree, &mut ready, &position);
        }

        if run.stages.len() < self.stages.len() {
            let pending: Vec<&str> = self
                .execution_order
                .iter()
                .filter(|name| run.result(name).is_none())
                .map(String::as_str)
                .collect();
            return Err(DeliverError::Internal(format!(
                "Deadlocked stage graph; remaining stages: {pending:?}"
            )));
        }

        run.finish(ctx.is_cancelled(), timer.finish());
        let report = run.report();
        tracing::info!(
            pipeline = %self.name,
            run_id = %run.run_id,
            status = %run.status,
            duration_ms = run.duration_ms,
            "run finished"
        );
        ctx.record(
            &StageEvent::run_completed(&run.run_id.to_string(), &run.status.to_string(), run.duration_ms)
                .add_data("report", report.to_value()?),
        );
        if let Some(path) = &config.report_path {
            report.write_json(path)?;
            tracing::info!(path = %path.display(), "run report written");
        }
        Ok(run)
    }

    /// Releases the dependents of a finished stage.
    ///
    /// A dependent whose last dependency just finished becomes ready if all
    /// of its dependencies succeeded, and is skipped otherwise; skips
    /// cascade through the worklist.
    fn settle<'a>(
        &'a self,
        finished: &'a str,
        ctx: &PipelineContext,
        run: &mut PipelineRun,
        in_degree: &mut HashMap<&'a str, usize>,
        ready: &mut BTreeSet<(usize, &'a str)>,
        position: &HashMap<&'a str, usize>,
    ) {
        let mut worklist = vec![finished];
        while let Some(done) = worklist.pop() {
            for child in self.dependents(done) {
                let child = child.as_str();
                let Some(count) = in_degree.get_mut(child) else {
                    continue;
                };
                *count = count.saturating_sub(1);
                if *count > 0 {
                    continue;
                }

                let spec = &self.stages[child];
                let blocker = spec
                    .dependencies
                    .iter()
                    .find_map(|dep| run.stage_status(dep).filter(|s| !s.is_success()).map(|s| (dep, s)));
                match blocker {
                    None => {
                        ready.insert((position[child], child));
                    }
                    Some((dep, status)) => {
                        let reason = format!("dependency '{dep}' {status}");
                        self.skip(ctx, run, spec, &reason);
                        worklist.push(child);
                    }
                }
            }
        }
    }

    fn skip(&self, ctx: &PipelineContext, run: &mut PipelineRun, spec: &StageSpec, reason: &str) {
        tracing::info!(stage = %spec.name, reason, "stage skipped");
        ctx.record(&StageEvent::skipped(&spec.name, reason));
        run.record(StageResult::not_run(&spec.name, spec.kind, StageOutput::skipped(reason)));
    }

    /// Runs one stage end to end and reports it.
    async fn run_stage(&self, spec: &StageSpec, ctx: Arc<PipelineContext>, config: &OrchestratorConfig) -> StageResult {
        let started_at = now_utc();
        let timer = SpanTimer::start(&spec.name);
        let span = tracing::info_span!("stage", stage = %spec.name, kind = %spec.kind, image = %spec.image);

        ctx.record(&StageEvent::started(&spec.name, &spec.image));
        let (output, artifacts) = self.drive_stage(spec, &ctx, config).instrument(span).await;
        let duration_ms = timer.finish();

        let mut attributes = StageSpanAttributes::new(&spec.name)
            .with_kind(spec.kind.to_string())
            .with_status(output.status.to_string())
            .with_exit_code(output.exit_code)
            .with_duration_ms(duration_ms);
        match output.status {
            StageStatus::Failed => {
                let error = output.failure.as_ref().map(ToString::to_string).unwrap_or_default();
                ctx.record(&StageEvent::failed(&spec.name, &error, output.exit_code));
                attributes = attributes.with_error(error);
            }
            StageStatus::Cancelled => {
                let reason = output.cancel_reason.clone().unwrap_or_default();
                ctx.record(&StageEvent::cancelled(&spec.name, &reason));
                attributes = attributes.with_error(reason);
            }
            StageStatus::Skipped => {
                ctx.record(&StageEvent::skipped(&spec.name, output.skip_reason.as_deref().unwrap_or("")));
            }
            _ => ctx.record(&StageEvent::completed(&spec.name, duration_ms)),
        }
        attributes.emit();

        StageResult {
            name: spec.name.clone(),
            kind: spec.kind,
            output,
            started_at: Some(started_at),
            finished_at: now_utc(),
            duration_ms,
            artifacts,
        }
    }

    /// Provisions the sandbox, runs setup and the stage, then collects artifacts.
    async fn drive_stage(
        &self,
        spec: &StageSpec,
        ctx: &Arc<PipelineContext>,
        config: &OrchestratorConfig,
    ) -> (StageOutput, Vec<String>) {
        let sandbox = match Sandbox::provision(
            &config.work_root,
            ctx.run_id(),
            &spec.name,
            &spec.image,
            config.isolation.clone(),
            ctx.env().exported_vars(),
        ) {
            Ok(sandbox) => sandbox.keep(config.keep_sandboxes),
            Err(err) => return (error_output(spec.kind, "provision", &err), Vec::new()),
        };

        if let Some(source) = &config.source_dir {
            let exclude = [config.work_root.clone(), config.artifact_root.clone()];
            if let Err(err) = sandbox.seed_from(source, &exclude) {
                return (error_output(spec.kind, "checkout", &err), Vec::new());
            }
        }

        let inputs = StageInputs::new(
            Arc::clone(ctx.store()),
            ctx.run_id(),
            &spec.name,
            spec.dependencies.iter().cloned(),
        );
        if let Err(err) = inputs.fetch_all(sandbox.workspace()) {
            return (error_output(spec.kind, "fetch", &err), Vec::new());
        }

        let stage_ctx = StageContext::new(Arc::clone(ctx), &spec.name, inputs, sandbox);
        let mut output = match self.run_setup(&stage_ctx, spec.kind).await {
            Some(stopped) => stopped,
            None => spec.runner.execute(&stage_ctx).await,
        };
        output.prepend_log(&stage_ctx.take_log());
        remove_setup_state(ctx, &stage_ctx).await;

        if output.status == StageStatus::Skipped {
            return (output, Vec::new());
        }

        let collection = Collection {
            run_id: ctx.run_id(),
            stage: &spec.name,
            workspace: stage_ctx.sandbox().workspace(),
            spec: &spec.artifacts,
            status: output.status,
            log: &output.log,
        };
        match ctx.store().collect(collection, now_utc()) {
            Ok(artifact) => {
                let files: Vec<String> = artifact.files.iter().map(|f| f.path.clone()).collect();
                if !files.is_empty() {
                    ctx.record(&StageEvent::artifact_collected(
                        &spec.name,
                        files.len(),
                        &format_iso8601(&artifact.expires_at),
                    ));
                }
                (output, files)
            }
            Err(err) => {
                tracing::warn!(stage = %spec.name, error = %err, "artifact collection failed");
                if output.is_success() {
                    let log = std::mem::take(&mut output.log);
                    output = StageOutput::failed(failure_for(spec.kind, "artifacts", err.to_string(), None)).with_log(log);
                }
                (output, Vec::new())
            }
        }
    }

    /// Runs the shared setup lines; returns the output to stop with on failure.
    /// Runs `before_script` as one shell session whose exported variables,
    /// working directory and (in containers) filesystem carry into the stage.
    async fn run_setup(&self, ctx: &StageContext, kind: StageKind) -> Option<StageOutput> {
        if self.before_script.is_empty() {
            return None;
        }
        let sandbox = ctx.sandbox();
        if let Step::Stop(output) = run_step(ctx, kind, "setup", sandbox.setup(&self.before_script)).await {
            return Some(output);
        }
        let committed = match sandbox.commit_setup() {
            Some(commit) => match run_step(ctx, kind, "setup", commit).await {
                Step::Stop(output) => return Some(output),
                Step::Done(_) => true,
            },
            None => false,
        };
        sandbox.enter_session(committed);
        None
    }
}

/// Removes the setup container and image, best effort.
async fn remove_setup_state(ctx: &PipelineContext, stage_ctx: &StageContext) {
    // Runs after an abort too, so it must not observe the run's token.
    let token = CancellationToken::new();
    for command in stage_ctx.sandbox().cleanup() {
        match ctx.runner().run(&command, &token).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::debug!(stage = %stage_ctx.stage_name(), command = %command, exit_code = output.exit_code, "setup cleanup failed");
            }
            Err(err) => tracing::debug!(stage = %stage_ctx.stage_name(), command = %command, error = %err, "setup cleanup failed"),
        }
    }
}

/// Performs topological sort on the stage graph.
fn topological_sort(stages: &HashMap<String, StageSpec>, stage_order: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    let mut visited = BTreeSet::new();
    let mut temp_visited = BTreeSet::new();

    fn visit(
        node: &str,
        stages: &HashMap<String, StageSpec>,
        visited: &mut BTreeSet<String>,
        temp_visited: &mut BTreeSet<String>,
        result: &mut Vec<String>,
    ) {
        if visited.contains(node) || temp_visited.contains(node) {
            return;
        }

        temp_visited.insert(node.to_string());

        if let Some(spec) = stages.get(node) {
            for dep in &spec.dependencies {
                visit(dep, stages, visited, temp_visited, result);
            }
        }

        temp_visited.remove(node);
        visited.insert(node.to_string());
        result.push(node.to_string());
    }

    // Visit in insertion order for determinism
    for name in stage_order {
        visit(name, stages, &mut visited, &mut temp_visited, &mut result);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::config::ExecutionMode;
    use crate::context::RunEnvironment;
    use crate::core::RunStatus;
    use crate::errors::StageFailure;
    use crate::events::CollectingEventSink;
    use crate::exec::{CommandOutput, Isolation, MockCommandRunner, ProcessRunner};
    use crate::pipeline::PipelineBuilder;
    use crate::stages::{FnStage, NoOpStage, ScriptStage, Stage};
    use crate::testing::ScriptedRunner;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn noop(name: &str) -> Arc<dyn Stage> {
        Arc::new(NoOpStage::new(name))
    }

    fn failing(name: &str) -> Arc<dyn Stage> {
        Arc::new(FnStage::new(name, |_| StageOutput::failed(StageFailure::script("exit 1", Some(1)))))
    }

    fn context(dir: &Path, sink: Arc<CollectingEventSink>) -> Arc<PipelineContext> {
        let store = Arc::new(ArtifactStore::open(dir.join("artifacts")).unwrap());
        Arc::new(
            PipelineContext::new(
                Arc::new(RunEnvironment::new("abc123", "main")),
                store,
                Arc::new(MockCommandRunner::new()),
            )
            .with_event_sink(sink),
        )
    }

    fn config(dir: &Path) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_work_root(dir.join("work"))
            .with_artifact_root(dir.join("artifacts"))
    }

    #[test]
    fn test_topological_order_follows_insertion() {
        let graph = PipelineBuilder::new("delivery")
            .stage("build", noop("build"), &[])
            .unwrap()
            .stage("test", noop("test"), &["build"])
            .unwrap()
            .stage("deploy", noop("deploy"), &["build"])
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(graph.execution_order(), &["build", "test", "deploy"]);
        assert_eq!(graph.dependents("build"), &["test".to_string(), "deploy".to_string()]);
        assert!(graph.dependents("deploy").is_empty());
    }

    #[tokio::test]
    async fn test_graph_execution() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let graph = PipelineBuilder::new("delivery")
            .stage("build", noop("build"), &[])
            .unwrap()
            .stage("test", noop("test"), &["build"])
            .unwrap()
            .build()
            .unwrap();

        let run = graph.execute(context(dir.path(), sink.clone()), &config(dir.path())).await.unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.stages.len(), 2);
        assert_eq!(
            sink.event_types(),
            vec![
                "run.started",
                "stage.started",
                "stage.completed",
                "stage.started",
                "stage.completed",
                "run.completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_skips_transitive_dependents_only() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let graph = PipelineBuilder::new("delivery")
            .stage("build", failing("build"), &[])
            .unwrap()
            .stage("test", noop("test"), &["build"])
            .unwrap()
            .stage("report", noop("report"), &["test"])
            .unwrap()
            .stage("lint", noop("lint"), &[])
            .unwrap()
            .build()
            .unwrap();

        let run = graph.execute(context(dir.path(), sink.clone()), &config(dir.path())).await.unwrap();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage_status("build"), Some(StageStatus::Failed));
        assert_eq!(run.stage_status("test"), Some(StageStatus::Skipped));
        assert_eq!(run.stage_status("report"), Some(StageStatus::Skipped));
        assert_eq!(run.stage_status("lint"), Some(StageStatus::Succeeded));
        assert_eq!(
            run.result("report").unwrap().output.skip_reason.as_deref(),
            Some("dependency 'test' skipped")
        );
        assert_eq!(sink.events_of_type("stage.skipped").len(), 2);
    }

    #[tokio::test]
    async fn test_setup_failure_stops_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_, _| Ok(CommandOutput::failed(127, "sh: rosdep: not found")));
        let store = Arc::new(ArtifactStore::open(dir.path().join("artifacts")).unwrap());
        let ctx = Arc::new(PipelineContext::new(
            Arc::new(RunEnvironment::new("abc123", "main")),
            store,
            Arc::new(runner),
        ));
        let graph = PipelineBuilder::new("delivery")
            .before_script(["rosdep install -y"])
            .stage("build", noop("build"), &[])
            .unwrap()
            .build()
            .unwrap();

        let run = graph.execute(ctx, &config(dir.path())).await.unwrap();

        let build = run.result("build").unwrap();
        assert_eq!(build.status(), StageStatus::Failed);
        assert_eq!(build.output.exit_code, Some(127));
        assert!(build.output.log.starts_with("$ sh -c "));
    }

    #[tokio::test]
    async fn test_setup_exports_reach_script() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path().join("artifacts")).unwrap());
        let ctx = Arc::new(PipelineContext::new(
            Arc::new(RunEnvironment::new("abc123", "main")),
            store,
            Arc::new(ProcessRunner::new()),
        ));
        let script = ScriptStage::new("lint", [r#"test "$SETUP_DONE" = 1"#, r#"test "$(pwd)" = /tmp"#]);
        let graph = PipelineBuilder::new("delivery")
            .before_script(["export SETUP_DONE=1", "cd /tmp"])
            .stage("lint", Arc::new(script), &[])
            .unwrap()
            .build()
            .unwrap();

        let run = graph.execute(ctx, &config(dir.path())).await.unwrap();

        let lint = run.result("lint").unwrap();
        assert_eq!(lint.status(), StageStatus::Succeeded, "{}", lint.output.log);
    }

    #[tokio::test]
    async fn test_container_setup_is_committed_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let store = Arc::new(ArtifactStore::open(dir.path().join("artifacts")).unwrap());
        let ctx = Arc::new(PipelineContext::new(
            Arc::new(RunEnvironment::new("abc123", "main")),
            store,
            runner.clone(),
        ));
        let graph = PipelineBuilder::new("delivery")
            .before_script(["apt-get install -y clang-tidy"])
            .stage("lint", Arc::new(ScriptStage::new("lint", ["clang-tidy --version"])), &[])
            .unwrap()
            .build()
            .unwrap();

        let config = config(dir.path()).with_isolation(Isolation::container("docker"));
        let run = graph.execute(ctx.clone(), &config).await.unwrap();

        assert_eq!(run.result("lint").unwrap().status(), StageStatus::Succeeded);
        let calls = runner.calls();
        let image = format!("deliverflow-setup:{}-lint", ctx.run_id());
        let container = format!("deliverflow-setup-{}-lint", ctx.run_id());
        assert!(calls[0].starts_with(&["docker", "run", "--name", container.as_str()]));
        assert!(calls[1].starts_with(&["docker", "commit", container.as_str(), image.as_str()]));
        assert!(calls[2].starts_with(&["docker", "run", "--rm"]));
        assert!(calls[2].args.contains(&image));
        assert!(calls[2].args.last().unwrap().contains("clang-tidy --version"));
        assert!(calls[3].starts_with(&["docker", "rm", "-f", container.as_str()]));
        assert!(calls[4].starts_with(&["docker", "rmi", "-f", image.as_str()]));
        assert_eq!(calls.len(), 5);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let ctx = context(dir.path(), sink);
        ctx.cancel_token().cancel("user abort");
        let graph = PipelineBuilder::new("delivery")
            .stage("build", noop("build"), &[])
            .unwrap()
            .stage("test", noop("test"), &["build"])
            .unwrap()
            .build()
            .unwrap();

        let run = graph.execute(ctx, &config(dir.path())).await.unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.stages_with_status(StageStatus::Skipped), vec!["build", "test"]);
        assert_eq!(
            run.result("build").unwrap().output.skip_reason.as_deref(),
            Some("run cancelled: user abort")
        );
    }

    #[tokio::test]
    async fn test_parallel_mode_runs_independent_branches() {
        let dir = tempfile::tempdir().unwrap();
        let graph = PipelineBuilder::new("delivery")
            .stage("build", noop("build"), &[])
            .unwrap()
            .stage("test", noop("test"), &["build"])
            .unwrap()
            .stage("deploy", noop("deploy"), &["build"])
            .unwrap()
            .build()
            .unwrap();
        let config = config(dir.path()).with_mode(ExecutionMode::Parallel { max_concurrency: 2 });

        let run = graph
            .execute(context(dir.path(), Arc::new(CollectingEventSink::new())), &config)
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Succeeded);
        let names: Vec<&str> = run.stages.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["build", "test", "deploy"]);
    }

    #[tokio::test]
    async fn test_report_written_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let graph = PipelineBuilder::new("delivery")
            .stage("build", noop("build"), &[])
            .unwrap()
            .build()
            .unwrap();
        let report_path = dir.path().join("out").join("report.json");
        let config = config(dir.path()).with_report_path(&report_path);

        graph
            .execute(context(dir.path(), Arc::new(CollectingEventSink::new())), &config)
            .await
            .unwrap();

        let report: serde_json::Value = serde_json::from_slice(&std::fs::read(report_path).unwrap()).unwrap();
        assert_eq!(report["status"], "succeeded");
        assert_eq!(report["stages"][0]["name"], "build");
    }
}
