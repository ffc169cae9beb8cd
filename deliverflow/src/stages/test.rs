//! Test stage: install the bundle and run the test suite.

use super::{error_output, run_step, Stage, Step};
use crate::artifacts::{extract_bundle, ArtifactSpec};
use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::StageFailure;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Settings for the test stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Test runner binary.
    pub tool: String,
    /// Absolute install prefix the bundle restores.
    pub install_prefix: String,
    /// Bundle file name.
    pub bundle_name: String,
    /// Stage that publishes the bundle.
    pub producer: String,
    /// File receiving the verbose summary.
    pub results_file: String,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            tool: "colcon".to_string(),
            install_prefix: "/opt/performance_test".to_string(),
            bundle_name: "opt.tar.gz".to_string(),
            producer: "build".to_string(),
            results_file: "test-results.txt".to_string(),
        }
    }
}

impl TestConfig {
    /// The artifact spec this stage publishes: the summary, kept regardless of outcome.
    #[must_use]
    pub fn artifact_spec(&self) -> ArtifactSpec {
        ArtifactSpec::new([self.results_file.clone()]).always()
    }
}

/// Counts reported by the test summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    /// Test cases run.
    pub tests: u32,
    /// Cases that errored.
    pub errors: u32,
    /// Cases that failed.
    pub failures: u32,
    /// Cases skipped.
    pub skipped: u32,
}

#[allow(clippy::expect_used)]
fn summary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(\d+)\s+tests?,\s*(\d+)\s+errors?,\s*(\d+)\s+failures?,\s*(\d+)\s+skipped")
            .expect("static summary pattern is valid")
    })
}

impl TestSummary {
    /// Parses the last `N tests, E errors, F failures, S skipped` line.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let caps = summary_pattern().captures_iter(text).last()?;
        let field = |i: usize| caps[i].parse::<u32>().ok();
        Some(Self {
            tests: field(1)?,
            errors: field(2)?,
            failures: field(3)?,
            skipped: field(4)?,
        })
    }

    /// Returns true if any case failed or errored.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.errors > 0 || self.failures > 0
    }
}

/// Extracts the bundle at the sandbox root and runs the test runner.
#[derive(Debug, Clone)]
pub struct TestStage {
    name: String,
    config: TestConfig,
}

impl TestStage {
    /// Creates a test stage.
    #[must_use]
    pub fn new(name: impl Into<String>, config: TestConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// The stage configuration.
    #[must_use]
    pub fn config(&self) -> &TestConfig {
        &self.config
    }
}

#[async_trait]
impl Stage for TestStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Test
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let cfg = &self.config;
        let sandbox = ctx.sandbox();

        match ctx.inputs().artifact(&cfg.producer) {
            Ok(Some(artifact)) if artifact.file(&cfg.bundle_name).is_some() => {}
            Ok(_) => {
                return StageOutput::failed(StageFailure::test(
                    format!("bundle {} from '{}' is not available", cfg.bundle_name, cfg.producer),
                    None,
                ));
            }
            Err(err) => return StageOutput::failed(StageFailure::test(err.to_string(), None)),
        }

        let bundle = sandbox.workspace().join(&cfg.bundle_name);
        match extract_bundle(&bundle, sandbox.rootfs()) {
            Ok(extracted) => ctx.log_line(&format!("extracted {} ({} entries)", cfg.bundle_name, extracted.entries)),
            Err(err) => return error_output(StageKind::Test, "extract", &err),
        }

        let prefix = sandbox.visible_path(&cfg.install_prefix);
        let run = match run_step(
            ctx,
            StageKind::Test,
            "test",
            sandbox.command(&cfg.tool, ["test", "--merge-install", "--install-base", prefix.as_str()]),
        )
        .await
        {
            Step::Done(output) => Ok(output),
            Step::Stop(output) if output.is_failure() && output.exit_code.is_some() => Err(output),
            Step::Stop(output) => return output,
        };

        // The summary is produced even when the runner failed.
        let summary_cmd = sandbox.command(&cfg.tool, ["test-result", "--verbose"]);
        let summary_out = match ctx.exec(summary_cmd).await {
            Ok(out) => out,
            Err(err) => return error_output(StageKind::Test, "test-result", &err),
        };
        let results = sandbox.workspace().join(&cfg.results_file);
        if let Err(err) = std::fs::write(&results, summary_out.combined()) {
            tracing::warn!(stage = %self.name, error = %err, "cannot write test results");
        }

        let summary = TestSummary::parse(&summary_out.stdout).unwrap_or_default();
        tracing::info!(
            stage = %self.name,
            tests = summary.tests,
            failures = summary.failures,
            errors = summary.errors,
            skipped = summary.skipped,
            "test summary"
        );

        let output = match run {
            Err(failed) => failed,
            Ok(_) if summary.has_failures() => StageOutput::failed(StageFailure::test(
                format!("{} failures, {} errors in {} tests", summary.failures, summary.errors, summary.tests),
                Some(summary_out.exit_code),
            )),
            Ok(_) if !summary_out.success() => StageOutput::failed(StageFailure::test(
                format!("test-result exited with {}", summary_out.exit_code),
                Some(summary_out.exit_code),
            )),
            Ok(_) => StageOutput::succeeded(),
        };
        output.with_data("summary", serde_json::to_value(summary).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{archive_root, create_bundle, Collection};
    use crate::core::StageStatus;
    use crate::exec::{CommandOutput, MockCommandRunner};
    use crate::stages::test_support::stage_context;
    use crate::utils::now_utc;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::sync::Arc;

    #[test]
    fn test_summary_parse() {
        let text = "build/pkg/Testing/Test.xml: 3 tests, 0 errors, 0 failures, 0 skipped\n\
                    Summary: 12 tests, 1 error, 2 failures, 3 skipped\n";
        assert_eq!(
            TestSummary::parse(text),
            Some(TestSummary { tests: 12, errors: 1, failures: 2, skipped: 3 })
        );
        assert!(TestSummary::parse("no summary here").is_none());
    }

    fn publish_bundle(ctx: &StageContext, dir: &std::path::Path) {
        let prefix = dir.join("prefix");
        fs::create_dir_all(&prefix).unwrap();
        fs::write(prefix.join("LICENSE"), "MIT").unwrap();
        let producer_ws = dir.join("producer");
        create_bundle(&prefix, &archive_root("/opt/performance_test"), &producer_ws.join("opt.tar.gz")).unwrap();

        let store = ctx.pipeline_ctx().store();
        let spec = ArtifactSpec::new(["opt.tar.gz"]);
        store
            .collect(
                Collection {
                    run_id: ctx.pipeline_ctx().run_id(),
                    stage: "build",
                    workspace: &producer_ws,
                    spec: &spec,
                    status: StageStatus::Succeeded,
                    log: "",
                },
                now_utc(),
            )
            .unwrap();
        ctx.inputs().fetch_all(ctx.sandbox().workspace()).unwrap();
    }

    fn runner(summary: &'static str, summary_exit: i32) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|cmd, _| cmd.starts_with(&["colcon", "test", "--merge-install"]))
            .returning(|_, _| Ok(CommandOutput::ok("Finished <<< performance_test")));
        runner
            .expect_run()
            .withf(|cmd, _| cmd.starts_with(&["colcon", "test-result", "--verbose"]))
            .returning(move |_, _| {
                Ok(CommandOutput {
                    exit_code: summary_exit,
                    stdout: summary.to_string(),
                    stderr: String::new(),
                })
            });
        runner
    }

    #[tokio::test]
    async fn test_passing_suite() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context(dir.path(), "test", &["build"], Arc::new(runner("Summary: 5 tests, 0 errors, 0 failures, 1 skipped\n", 0)));
        publish_bundle(&ctx, dir.path());

        let output = TestStage::new("test", TestConfig::default()).execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Succeeded, "{:?}", output.failure);
        assert!(ctx.sandbox().host_path("/opt/performance_test/LICENSE").is_file());
        let results = fs::read_to_string(ctx.sandbox().workspace().join("test-results.txt")).unwrap();
        assert!(results.contains("5 tests"));
        assert_eq!(output.get("summary").unwrap()["skipped"], 1);
    }

    #[tokio::test]
    async fn test_failing_case_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context(dir.path(), "test", &["build"], Arc::new(runner("Summary: 5 tests, 0 errors, 1 failure, 0 skipped\n", 1)));
        publish_bundle(&ctx, dir.path());

        let output = TestStage::new("test", TestConfig::default()).execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Failed);
        assert_eq!(output.failure.as_ref().map(StageFailure::kind), Some("test"));
        assert!(ctx.sandbox().workspace().join("test-results.txt").is_file());
    }

    #[tokio::test]
    async fn test_undeclared_producer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context(dir.path(), "test", &[], Arc::new(MockCommandRunner::new()));

        let output = TestStage::new("test", TestConfig::default()).execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Failed);
        assert!(output.failure.unwrap().to_string().contains("Undeclared dependency"));
    }

    #[tokio::test]
    async fn test_missing_bundle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = stage_context(dir.path(), "test", &["build"], Arc::new(MockCommandRunner::new()));

        let output = TestStage::new("test", TestConfig::default()).execute(&ctx).await;
        assert!(output.failure.unwrap().to_string().contains("not available"));
    }
}
