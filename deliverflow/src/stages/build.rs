//! Build stage: compile and install, then bundle the install prefix.

use super::{run_step, Stage, Step};
use crate::artifacts::{archive_root, create_bundle, ArtifactSpec};
use crate::context::StageContext;
use crate::core::{StageKind, StageOutput};
use crate::errors::StageFailure;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;

/// Settings for the build stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Build tool binary.
    pub tool: String,
    /// Absolute install prefix inside the sandbox.
    pub install_prefix: String,
    /// CMake build type.
    pub build_type: String,
    /// License file, relative to the workspace, copied into the prefix.
    pub license_file: String,
    /// Bundle file name written to the workspace.
    pub bundle_name: String,
    /// Extra arguments passed to the build tool before `--cmake-args`.
    pub extra_args: Vec<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            tool: "colcon".to_string(),
            install_prefix: "/opt/performance_test".to_string(),
            build_type: "Release".to_string(),
            license_file: "LICENSE".to_string(),
            bundle_name: "opt.tar.gz".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl BuildConfig {
    /// The artifact spec this stage publishes: the bundle, kept one day
    /// regardless of outcome.
    #[must_use]
    pub fn artifact_spec(&self) -> ArtifactSpec {
        ArtifactSpec::new([self.bundle_name.clone()]).always()
    }
}

/// Invokes the build tool, copies the license into the prefix and archives it.
#[derive(Debug, Clone)]
pub struct BuildStage {
    name: String,
    config: BuildConfig,
}

impl BuildStage {
    /// Creates a build stage.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BuildConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// The stage configuration.
    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    fn failed(reason: impl Into<String>) -> StageOutput {
        StageOutput::failed(StageFailure::build(reason, None))
    }
}

#[async_trait]
impl Stage for BuildStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Build
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let sandbox = ctx.sandbox();
        let cfg = &self.config;
        let prefix = sandbox.host_path(&cfg.install_prefix);
        if let Err(err) = fs::create_dir_all(&prefix) {
            return Self::failed(format!("cannot create install prefix: {err}"));
        }

        let mut args = vec![
            "build".to_string(),
            "--merge-install".to_string(),
            "--install-base".to_string(),
            sandbox.visible_path(&cfg.install_prefix),
        ];
        args.extend(cfg.extra_args.iter().cloned());
        args.push("--cmake-args".to_string());
        args.push(format!("-DCMAKE_BUILD_TYPE={}", cfg.build_type));

        if let Step::Stop(output) = run_step(ctx, StageKind::Build, "build", sandbox.command(&cfg.tool, args)).await {
            return output;
        }

        let license = sandbox.workspace().join(&cfg.license_file);
        let Some(license_name) = license.file_name() else {
            return Self::failed(format!("invalid license path '{}'", cfg.license_file));
        };
        if let Err(err) = fs::copy(&license, prefix.join(license_name)) {
            return Self::failed(format!("cannot copy {}: {err}", cfg.license_file));
        }
        ctx.log_line(&format!("copied {} into {}", cfg.license_file, cfg.install_prefix));

        let output = sandbox.workspace().join(&cfg.bundle_name);
        match create_bundle(&prefix, &archive_root(&cfg.install_prefix), &output) {
            Ok(bundle) => {
                ctx.log_line(&format!("archived {} into {} ({} bytes)", cfg.install_prefix, cfg.bundle_name, bundle.size_bytes));
                tracing::info!(stage = %self.name, sha256 = %bundle.sha256, "bundle ready");
                StageOutput::succeeded()
                    .with_data("bundle", serde_json::json!(cfg.bundle_name))
                    .with_data("sha256", serde_json::json!(bundle.sha256))
                    .with_data("size_bytes", serde_json::json!(bundle.size_bytes))
                    .with_data("entries", serde_json::json!(bundle.entries))
            }
            Err(err) => Self::failed(format!("bundling failed: {err}")),
        }
    }
}
