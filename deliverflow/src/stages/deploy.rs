//! Deploy stage: package the bundle into a volume image and publish it.

use super::{run_step, Stage, Step};
use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::StageFailure;
use crate::image::{ContainerEngine, ImageDefinition, ImageTags, DEFAULT_BASE_IMAGE, DOCKERFILE, IGNORE_FILE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Settings for the deploy stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Engine used to build and push.
    pub engine: ContainerEngine,
    /// Base layer of the volume image.
    pub base_image: String,
    /// Bundle file name.
    pub bundle_name: String,
    /// Install prefix exported as the image volume.
    pub install_prefix: String,
    /// Stage that publishes the bundle.
    pub producer: String,
    /// Build context directory, relative to the workspace.
    pub context_dir: String,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            engine: ContainerEngine::default(),
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            bundle_name: "opt.tar.gz".to_string(),
            install_prefix: "/opt/performance_test".to_string(),
            producer: "build".to_string(),
            context_dir: "image".to_string(),
        }
    }
}

/// Builds, tags, and pushes the volume image.
///
/// Steps run in order and the first failure ends the stage, so nothing is
/// pushed unless the build, tag and login steps all succeeded.
///
/// The two pushes are not atomic. If the reference tag fails to push, the
/// commit tag is already published; the failure reason names it and the
/// output's `pushed` data lists it.
#[derive(Debug, Clone)]
pub struct DeployStage {
    name: String,
    config: DeployConfig,
}

impl DeployStage {
    /// Creates a deploy stage.
    #[must_use]
    pub fn new(name: impl Into<String>, config: DeployConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// The stage configuration.
    #[must_use]
    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    fn failed(step: &str, reason: impl Into<String>) -> StageOutput {
        StageOutput::failed(StageFailure::packaging(step, reason, None))
    }

    fn prepare_context(&self, workspace: &Path, definition: &ImageDefinition) -> std::io::Result<std::path::PathBuf> {
        let context = workspace.join(&self.config.context_dir);
        if context.exists() {
            fs::remove_dir_all(&context)?;
        }
        fs::create_dir_all(&context)?;
        fs::copy(workspace.join(&self.config.bundle_name), context.join(&self.config.bundle_name))?;
        fs::write(context.join(DOCKERFILE), definition.dockerfile())?;
        fs::write(context.join(IGNORE_FILE), definition.ignore_file())?;
        Ok(context)
    }
}

#[async_trait]
impl Stage for DeployStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Deploy
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let cfg = &self.config;
        let env = ctx.env();
        let workspace = ctx.sandbox().workspace();

        match ctx.inputs().artifact(&cfg.producer) {
            Ok(Some(artifact)) if artifact.file(&cfg.bundle_name).is_some() => {}
            Ok(_) => {
                return Self::failed(
                    "context",
                    format!("bundle {} from '{}' is not available", cfg.bundle_name, cfg.producer),
                );
            }
            Err(err) => return Self::failed("context", err.to_string()),
        }
        if env.registry_image.is_empty() {
            return Self::failed("tag", "registry image is not configured");
        }
        if env.ref_slug.is_empty() {
            return Self::failed(
                "tag",
                format!("ref '{}' has no characters usable in an image tag", env.ref_name),
            );
        }

        let definition = ImageDefinition::new(cfg.bundle_name.as_str(), cfg.install_prefix.as_str())
            .with_base_image(cfg.base_image.as_str())
            .with_commit_labels(&env.commit_sha, env.commit_tag.as_deref());
        let context = match self.prepare_context(workspace, &definition) {
            Ok(context) => context,
            Err(err) => return Self::failed("context", format!("cannot prepare build context: {err}")),
        };
        ctx.log_line(&format!("build context ready at {}", context.display()));

        let tags = ImageTags::for_run(env);
        let engine = &cfg.engine;

        if let Step::Stop(output) = run_step(
            ctx,
            StageKind::Deploy,
            "build",
            engine.build(&context, &definition, &tags.commit).cwd(workspace),
        )
        .await
        {
            return output;
        }
        if let Step::Stop(output) = run_step(
            ctx,
            StageKind::Deploy,
            "tag",
            engine.tag(&tags.commit, &tags.reference).cwd(workspace),
        )
        .await
        {
            return output;
        }

        if env.registry_token.is_empty() {
            return Self::failed("login", "registry token is not set");
        }
        if let Step::Stop(output) = run_step(
            ctx,
            StageKind::Deploy,
            "login",
            engine
                .login(&env.registry, &env.registry_user, env.registry_token.expose())
                .cwd(workspace),
        )
        .await
        {
            return output;
        }

        let mut pushed = Vec::new();
        for tag in tags.all() {
            if let Step::Stop(mut output) = run_step(ctx, StageKind::Deploy, "push", engine.push(tag).cwd(workspace)).await {
                if let Some(StageFailure::Packaging { reason, .. }) = output.failure.as_mut() {
                    if !pushed.is_empty() {
                        reason.push_str(&format!(" (already pushed: {})", pushed.join(", ")));
                    }
                }
                return output.with_data("pushed", serde_json::json!(pushed));
            }
            tracing::info!(stage = %self.name, tag, "image pushed");
            pushed.push(tag.to_string());
        }

        // Best effort: the push already succeeded.
        if let Ok(out) = ctx.exec(engine.logout(&env.registry).cwd(workspace)).await {
            if !out.success() {
                tracing::debug!(stage = %self.name, exit_code = out.exit_code, "registry logout failed");
            }
        }

        StageOutput::succeeded()
            .with_data("pushed", serde_json::json!(pushed))
            .with_data("labels", serde_json::json!(definition.labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{ArtifactSpec, Collection};
    use crate::context::RunEnvironment;
    use crate::core::StageStatus;
    use crate::exec::{CommandOutput, CommandSpec, MockCommandRunner};
    use crate::stages::test_support::stage_context_with;
    use crate::utils::now_utc;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn env() -> RunEnvironment {
        RunEnvironment::new("0123abcd", "main")
            .with_commit_tag("v1.0")
            .with_registry("registry.example.com", "registry.example.com/perf/volume")
            .with_credentials("gitlab-ci-token", "s3cret")
    }

    fn publish(ctx: &StageContext, dir: &Path) {
        let ws = dir.join("producer");
        fs::create_dir_all(&ws).unwrap();
        fs::write(ws.join("opt.tar.gz"), b"bundle").unwrap();
        let spec = ArtifactSpec::new(["opt.tar.gz"]);
        ctx.pipeline_ctx()
            .store()
            .collect(
                Collection {
                    run_id: ctx.pipeline_ctx().run_id(),
                    stage: "build",
                    workspace: &ws,
                    spec: &spec,
                    status: StageStatus::Succeeded,
                    log: "",
                },
                now_utc(),
            )
            .unwrap();
        ctx.inputs().fetch_all(ctx.sandbox().workspace()).unwrap();
    }

    fn recording_runner(calls: Arc<Mutex<Vec<CommandSpec>>>, fail: Option<&'static str>) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |cmd, _| {
            calls.lock().push(cmd.clone());
            if fail.is_some_and(|step| cmd.args.first().map(String::as_str) == Some(step)) {
                Ok(CommandOutput::failed(1, "denied"))
            } else {
                Ok(CommandOutput::ok(""))
            }
        });
        runner
    }

    #[tokio::test]
    async fn test_deploy_builds_tags_and_pushes() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let ctx = stage_context_with(dir.path(), "deploy", &["build"], Arc::new(recording_runner(calls.clone(), None)), env());
        publish(&ctx, dir.path());

        let output = DeployStage::new("deploy", DeployConfig::default()).execute(&ctx).await;
        assert_eq!(output.status, StageStatus::Succeeded, "{:?}", output.failure);

        let context = ctx.sandbox().workspace().join("image");
        let entries: Vec<String> = {
            let mut names: Vec<String> = fs::read_dir(&context)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        };
        assert_eq!(entries, vec![".dockerignore", "Dockerfile", "opt.tar.gz"]);

        let calls = calls.lock();
        let steps: Vec<&str> = calls.iter().map(|c| c.args[0].as_str()).collect();
        assert_eq!(steps, vec!["build", "tag", "login", "push", "push", "logout"]);
        assert!(calls[0].args.contains(&"ade_image_commit_sha=0123abcd".to_string()));
        assert!(calls[0].args.contains(&"ade_image_commit_tag=v1.0".to_string()));
        assert_eq!(calls[2].stdin.as_deref(), Some("s3cret"));
        assert_eq!(calls[3].args[1], "registry.example.com/perf/volume:commit-0123abcd");
        assert_eq!(calls[4].args[1], "registry.example.com/perf/volume:main");
    }

    #[tokio::test]
    async fn test_login_failure_pushes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let ctx = stage_context_with(dir.path(), "deploy", &["build"], Arc::new(recording_runner(calls.clone(), Some("login"))), env());
        publish(&ctx, dir.path());

        let output = DeployStage::new("deploy", DeployConfig::default()).execute(&ctx).await;

        assert!(matches!(output.failure, Some(StageFailure::Packaging { ref step, .. }) if step == "login"));
        assert!(!calls.lock().iter().any(|c| c.args[0] == "push"));
    }

    #[tokio::test]
    async fn test_build_failure_pushes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let ctx = stage_context_with(dir.path(), "deploy", &["build"], Arc::new(recording_runner(calls.clone(), Some("build"))), env());
        publish(&ctx, dir.path());

        let output = DeployStage::new("deploy", DeployConfig::default()).execute(&ctx).await;

        assert_eq!(output.status, StageStatus::Failed);
        assert_eq!(calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_ref_slug_fails_before_build() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let env = RunEnvironment::new("0123abcd", "///")
            .with_registry("registry.example.com", "registry.example.com/perf/volume")
            .with_credentials("gitlab-ci-token", "s3cret");
        let ctx = stage_context_with(dir.path(), "deploy", &["build"], Arc::new(recording_runner(calls.clone(), None)), env);
        publish(&ctx, dir.path());

        let output = DeployStage::new("deploy", DeployConfig::default()).execute(&ctx).await;

        assert!(matches!(output.failure, Some(StageFailure::Packaging { ref step, .. }) if step == "tag"));
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_partial_push_names_published_tag() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut runner = MockCommandRunner::new();
        {
            let calls = calls.clone();
            runner.expect_run().returning(move |cmd, _| {
                calls.lock().push(cmd.clone());
                if cmd.args.first().map(String::as_str) == Some("push") && cmd.args[1].ends_with(":main") {
                    Ok(CommandOutput::failed(1, "denied: quota exceeded"))
                } else {
                    Ok(CommandOutput::ok(""))
                }
            });
        }
        let ctx = stage_context_with(dir.path(), "deploy", &["build"], Arc::new(runner), env());
        publish(&ctx, dir.path());

        let output = DeployStage::new("deploy", DeployConfig::default()).execute(&ctx).await;

        let Some(StageFailure::Packaging { step, reason, .. }) = &output.failure else {
            panic!("expected a packaging failure, got {:?}", output.failure);
        };
        assert_eq!(step, "push");
        assert!(reason.ends_with("(already pushed: registry.example.com/perf/volume:commit-0123abcd)"), "{reason}");
        assert_eq!(
            output.data.get("pushed"),
            Some(&serde_json::json!(["registry.example.com/perf/volume:commit-0123abcd"]))
        );
    }

    #[tokio::test]
    async fn test_missing_token_fails_before_push() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let env = env().with_credentials("ci", "");
        let ctx = stage_context_with(dir.path(), "deploy", &["build"], Arc::new(recording_runner(calls.clone(), None)), env);
        publish(&ctx, dir.path());

        let output = DeployStage::new("deploy", DeployConfig::default()).execute(&ctx).await;

        assert!(matches!(output.failure, Some(StageFailure::Packaging { ref step, .. }) if step == "login"));
        assert!(!calls.lock().iter().any(|c| c.args[0] == "push"));
    }
}
