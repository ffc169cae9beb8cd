//! Stage trait and implementations.
//!
//! Stages are the units of work in a delivery pipeline. The built-in
//! stages drive external tools through the stage context; none of them
//! reimplements a build system, test runner or image builder.

mod build;
mod deploy;
mod script;
mod test;

pub use build::{BuildConfig, BuildStage};
pub use deploy::{DeployConfig, DeployStage};
pub use script::ScriptStage;
pub use test::{TestConfig, TestStage, TestSummary};

use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::{DeliverError, StageFailure};
use crate::exec::{CommandOutput, CommandSpec};
use async_trait::async_trait;
use std::fmt::Debug;

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage.
    fn name(&self) -> &str;

    /// The role of the stage, used to classify setup failures.
    fn kind(&self) -> StageKind {
        StageKind::Script
    }

    /// Executes the stage.
    ///
    /// Failures are reported through the returned output, never by panicking.
    async fn execute(&self, ctx: &StageContext) -> StageOutput;
}

/// Builds the failure matching a stage kind.
#[must_use]
pub fn failure_for(kind: StageKind, step: &str, reason: impl Into<String>, exit_code: Option<i32>) -> StageFailure {
    match kind {
        StageKind::Build => StageFailure::build(reason, exit_code),
        StageKind::Test => StageFailure::test(reason, exit_code),
        StageKind::Deploy => StageFailure::packaging(step, reason, exit_code),
        StageKind::Script => StageFailure::script(reason, exit_code),
    }
}

/// Outcome of one command run by a stage.
pub(crate) enum Step {
    /// Exited zero.
    Done(CommandOutput),
    /// The stage is over; return this output.
    Stop(StageOutput),
}

/// Runs `command`, mapping non-zero exits and errors to a stage output.
pub(crate) async fn run_step(ctx: &StageContext, kind: StageKind, step: &str, command: CommandSpec) -> Step {
    let program = command.program.clone();
    match ctx.exec(command).await {
        Ok(output) if output.success() => Step::Done(output),
        Ok(output) => {
            let detail = output.last_line().unwrap_or("no output").to_string();
            tracing::warn!(
                stage = %ctx.stage_name(),
                step,
                exit_code = output.exit_code,
                "command failed"
            );
            Step::Stop(StageOutput::failed(failure_for(
                kind,
                step,
                format!("{program} exited with {}: {detail}", output.exit_code),
                Some(output.exit_code),
            )))
        }
        Err(err) => Step::Stop(error_output(kind, step, &err)),
    }
}

/// Maps an orchestration error to a stage output.
#[must_use]
pub fn error_output(kind: StageKind, step: &str, err: &DeliverError) -> StageOutput {
    match err {
        DeliverError::Cancelled(reason) => StageOutput::cancelled(reason.clone()),
        other => StageOutput::failed(failure_for(kind, step, other.to_string(), None)),
    }
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext) -> StageOutput + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        (self.func)(ctx)
    }
}

/// A stage that does nothing and succeeds.
#[derive(Debug, Clone)]
pub struct NoOpStage {
    name: String,
}

impl NoOpStage {
    /// Creates a new no-op stage.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Stage for NoOpStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &StageContext) -> StageOutput {
        StageOutput::succeeded()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::artifacts::ArtifactStore;
    use crate::context::{PipelineContext, RunEnvironment, StageContext, StageInputs};
    use crate::exec::{CommandRunner, Isolation, Sandbox};
    use std::path::Path;
    use std::sync::Arc;

    pub(crate) fn stage_context(
        dir: &Path,
        stage: &str,
        needs: &[&str],
        runner: Arc<dyn CommandRunner>,
    ) -> StageContext {
        stage_context_with(dir, stage, needs, runner, RunEnvironment::new("abc123", "main"))
    }

    pub(crate) fn stage_context_with(
        dir: &Path,
        stage: &str,
        needs: &[&str],
        runner: Arc<dyn CommandRunner>,
        env: RunEnvironment,
    ) -> StageContext {
        let store = Arc::new(ArtifactStore::open(dir.join("store")).unwrap());
        let ctx = Arc::new(PipelineContext::new(Arc::new(env), store.clone(), runner));
        let sandbox = Sandbox::provision(
            &dir.join("work"),
            ctx.run_id(),
            stage,
            "ros:humble",
            Isolation::Process,
            ctx.env().exported_vars(),
        )
        .unwrap();
        let inputs = StageInputs::new(store, ctx.run_id(), stage, needs.iter().copied());
        StageContext::new(ctx, stage, inputs, sandbox)
    }
}
