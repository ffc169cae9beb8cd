//! YAML pipeline definitions.
//!
//! The shape follows common CI files:
//!
//! ```yaml
//! name: performance_test
//! variables:
//!   ROS_DISTRO: humble
//! before_script:
//!   - rosdep install --from-paths src -y
//! stages:
//!   build:
//!     kind: build
//!     image: ros:humble
//!   test:
//!     kind: test
//!     needs: [build]
//!   deploy:
//!     kind: deploy
//!     needs: [build]
//! ```
//!
//! Stage order in the file is kept; it breaks ties in the schedule.

use super::{PipelineBuilder, StageGraph, StageSpec, DEFAULT_IMAGE};
use crate::artifacts::ArtifactSpec;
use crate::context::RunEnvironment;
use crate::core::StageKind;
use crate::errors::{DeliverError, Result};
use crate::stages::{BuildConfig, BuildStage, DeployConfig, DeployStage, ScriptStage, Stage, TestConfig, TestStage};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Image the deploy stage runs in when none is configured.
pub const DEPLOY_IMAGE: &str = "docker:stable";

/// One stage entry of a pipeline file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Role of the stage.
    pub kind: StageKind,
    /// Execution image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Stages whose artifacts this stage consumes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    /// Shell lines; replaces the built-in steps of build, test and deploy stages.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub script: Vec<String>,
    /// Declared outputs; build and test stages have defaults.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactSpec>,
    /// Build stage settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    /// Test stage settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<TestConfig>,
    /// Deploy stage settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,
}

impl StageConfig {
    /// A stage of the given kind with default settings.
    #[must_use]
    pub fn of_kind(kind: StageKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_needs<I, S>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.needs = needs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Sets the script lines.
    #[must_use]
    pub fn with_script<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the declared outputs.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: ArtifactSpec) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    fn producer(&self) -> Option<String> {
        match self.kind {
            StageKind::Test => Some(self.test.clone().unwrap_or_default().producer),
            StageKind::Deploy => Some(self.deploy.clone().unwrap_or_default().producer),
            StageKind::Build | StageKind::Script => None,
        }
    }

    fn to_spec(&self, name: &str, extra_needs: &[String]) -> Result<StageSpec> {
        let (runner, default_artifacts): (Arc<dyn Stage>, ArtifactSpec) = if self.script.is_empty() {
            match self.kind {
                StageKind::Build => {
                    let cfg = self.build.clone().unwrap_or_default();
                    let artifacts = cfg.artifact_spec();
                    (Arc::new(BuildStage::new(name, cfg)), artifacts)
                }
                StageKind::Test => {
                    let cfg = self.test.clone().unwrap_or_default();
                    let artifacts = cfg.artifact_spec();
                    (Arc::new(TestStage::new(name, cfg)), artifacts)
                }
                StageKind::Deploy => {
                    let cfg = self.deploy.clone().unwrap_or_default();
                    (Arc::new(DeployStage::new(name, cfg)), ArtifactSpec::default())
                }
                StageKind::Script => {
                    return Err(DeliverError::Config(format!("stage '{name}' has no script")));
                }
            }
        } else {
            let stage = ScriptStage::new(name, self.script.iter().cloned()).with_kind(self.kind);
            (Arc::new(stage), ArtifactSpec::default())
        };

        let mut needs: Vec<String> = self.needs.clone();
        if needs.is_empty() {
            needs.extend(self.producer());
        }
        needs.extend(extra_needs.iter().filter(|n| n.as_str() != name).cloned());

        let image = self.image.clone().unwrap_or_else(|| match self.kind {
            StageKind::Deploy => DEPLOY_IMAGE.to_string(),
            _ => DEFAULT_IMAGE.to_string(),
        });

        Ok(StageSpec::new(name, runner)
            .with_kind(self.kind)
            .with_dependencies(needs)
            .with_image(image)
            .with_artifacts(self.artifacts.clone().unwrap_or(default_artifacts)))
    }
}

/// A pipeline file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Variables exported into every sandbox.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    /// Setup lines run in every sandbox before the stage, as one shell
    /// session whose exports and working directory the stage inherits.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub before_script: Vec<String>,
    /// Make deploy stages also need every test stage.
    #[serde(default)]
    pub gate_deploy_on_tests: bool,
    /// Stages in file order.
    #[serde(with = "ordered_stages")]
    pub stages: Vec<(String, StageConfig)>,
}

fn default_name() -> String {
    "pipeline".to_string()
}

impl PipelineConfig {
    /// An empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            variables: BTreeMap::new(),
            before_script: Vec::new(),
            gate_deploy_on_tests: false,
            stages: Vec::new(),
        }
    }

    /// The reference delivery pipeline: build, then test and deploy, both
    /// fed by the build bundle. Deploy does not wait for the tests.
    #[must_use]
    pub fn reference() -> Self {
        Self::new("performance_test")
            .with_stage("build", StageConfig::of_kind(StageKind::Build))
            .with_stage("test", StageConfig::of_kind(StageKind::Test).with_needs(["build"]))
            .with_stage("deploy", StageConfig::of_kind(StageKind::Deploy).with_needs(["build"]))
    }

    /// Parses a pipeline from YAML.
    ///
    /// # Errors
    ///
    /// Returns a YAML error for malformed input.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Loads a pipeline file.
    ///
    /// # Errors
    ///
    /// Returns an IO or YAML error.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml_str(&text)?;
        tracing::debug!(path = %path.display(), stages = config.stages.len(), "pipeline loaded");
        Ok(config)
    }

    /// Renders the pipeline as YAML.
    ///
    /// # Errors
    ///
    /// Returns a YAML error if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Appends a stage.
    #[must_use]
    pub fn with_stage(mut self, name: impl Into<String>, stage: StageConfig) -> Self {
        self.stages.push((name.into(), stage));
        self
    }

    /// Adds a variable.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Sets the setup lines.
    #[must_use]
    pub fn with_before_script<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.before_script = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Makes deploy stages wait for test stages.
    #[must_use]
    pub fn with_gate_deploy_on_tests(mut self, gate: bool) -> Self {
        self.gate_deploy_on_tests = gate;
        self
    }

    /// Looks up a stage entry.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    /// Adds the pipeline variables to a run environment; CI values win.
    #[must_use]
    pub fn apply_variables(&self, mut env: RunEnvironment) -> RunEnvironment {
        for (key, value) in &self.variables {
            env.variables.entry(key.clone()).or_insert_with(|| value.clone());
        }
        env
    }

    /// Builds the validated stage graph.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown dependencies, cycles,
    /// duplicates or an empty pipeline, and a config error for a script
    /// stage without lines.
    pub fn to_graph(&self) -> Result<StageGraph> {
        let tests: Vec<String> = if self.gate_deploy_on_tests {
            self.stages
                .iter()
                .filter(|(_, s)| s.kind == StageKind::Test)
                .map(|(n, _)| n.clone())
                .collect()
        } else {
            Vec::new()
        };

        let mut builder = PipelineBuilder::new(&self.name).before_script(self.before_script.iter().cloned());
        for (name, stage) in &self.stages {
            let extra: &[String] = if stage.kind == StageKind::Deploy { &tests } else { &[] };
            builder.add_stage_spec(stage.to_spec(name, extra)?)?;
        }
        Ok(builder.build()?)
    }
}

/// (De)serializes the stage list as a YAML mapping, keeping file order.
mod ordered_stages {
    use super::{fmt, Deserializer, MapAccess, SerializeMap, Serializer, StageConfig, Visitor};

    pub(super) fn serialize<S>(stages: &[(String, StageConfig)], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(stages.len()))?;
        for (name, stage) in stages {
            map.serialize_entry(name, stage)?;
        }
        map.end()
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Vec<(String, StageConfig)>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StagesVisitor;

        impl<'de> Visitor<'de> for StagesVisitor {
            type Value = Vec<(String, StageConfig)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of stage names to stage definitions")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut stages = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, stage)) = access.next_entry::<String, StageConfig>()? {
                    stages.push((name, stage));
                }
                Ok(stages)
            }
        }

        deserializer.deserialize_map(StagesVisitor)
    }
}
