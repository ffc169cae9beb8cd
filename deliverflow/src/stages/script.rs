//! Stages defined as a list of shell lines.

use super::{run_step, Stage, Step};
use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use async_trait::async_trait;

/// Runs its lines as one shell session, stopping at the first failure.
///
/// Lines share variables and the working directory, as they would in an
/// interactive shell.
#[derive(Debug, Clone)]
pub struct ScriptStage {
    name: String,
    kind: StageKind,
    lines: Vec<String>,
}

impl ScriptStage {
    /// Creates a script stage.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: StageKind::Script,
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }

    /// Classifies failures as those of `kind`.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// The script lines.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

#[async_trait]
impl Stage for ScriptStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        if let Step::Stop(output) = run_step(ctx, self.kind, "script", ctx.sandbox().script(&self.lines)).await {
            return output;
        }
        StageOutput::succeeded().with_data("lines", serde_json::json!(self.lines.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::exec::{CommandOutput, MockCommandRunner, ProcessRunner};
    use crate::stages::test_support::stage_context;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_lines_as_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd, _| cmd.args.last().map(String::as_str) == Some("set -e\necho one\necho two"))
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok("one\ntwo")));
        let ctx = stage_context(dir.path(), "lint", &[], Arc::new(runner));

        let output = ScriptStage::new("lint", ["echo one", "echo two"]).execute(&ctx).await;
        assert!(output.is_success());
        assert_eq!(output.data.get("lines"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_failure_classified_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_, _| Ok(CommandOutput::failed(127, "sh: nope: not found")));
        let ctx = stage_context(dir.path(), "lint", &[], Arc::new(runner));

        let output = ScriptStage::new("lint", ["nope", "echo never"])
            .with_kind(StageKind::Test)
            .execute(&ctx)
            .await;

        assert_eq!(output.status, StageStatus::Failed);
        assert_eq!(output.exit_code, Some(127));
        assert_eq!(output.failure.unwrap().kind(), "test");
    }

    #[tokio::test]
    async fn test_lines_share_state_and_stop_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context(dir.path(), "lint", &[], Arc::new(ProcessRunner::new()));

        let shared = ScriptStage::new("lint", ["mkdir out", "cd out", "NAME=lint", r#"touch "$NAME.ok""#])
            .execute(&ctx)
            .await;
        assert!(shared.is_success(), "{}", ctx.log());
        assert!(ctx.sandbox().workspace().join("out/lint.ok").is_file());

        let stopped = ScriptStage::new("lint", ["false", "touch never"]).execute(&ctx).await;
        assert_eq!(stopped.status, StageStatus::Failed);
        assert!(!ctx.sandbox().workspace().join("never").exists());
    }
}
