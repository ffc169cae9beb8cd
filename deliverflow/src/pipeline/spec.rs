//! Stage specifications.

use crate::artifacts::ArtifactSpec;
use crate::core::StageKind;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::stages::Stage;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Image used when a stage does not declare one.
pub const DEFAULT_IMAGE: &str = "ros:humble";

/// Specification for a single stage in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The unique name of the stage.
    pub name: String,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
    /// Names of stages this stage depends on.
    pub dependencies: BTreeSet<String>,
    /// Execution environment image.
    pub image: String,
    /// Declared outputs.
    pub artifacts: ArtifactSpec,
    /// The kind of stage.
    pub kind: StageKind,
}

impl StageSpec {
    /// Creates a new stage specification, taking the kind from the runner.
    #[must_use]
    pub fn new(name: impl Into<String>, runner: Arc<dyn Stage>) -> Self {
        let kind = runner.kind();
        Self {
            name: name.into(),
            runner,
            dependencies: BTreeSet::new(),
            image: DEFAULT_IMAGE.to_string(),
            artifacts: ArtifactSpec::default(),
            kind,
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    /// Sets the execution image.
    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Sets the declared outputs.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: ArtifactSpec) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Validates the stage specification.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or the stage depends on itself.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty or whitespace-only"));
        }
        if self.dependencies.contains(&self.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ContractErrorInfo::new("PIPELINE-SELF_DEP", format!("Stage '{}' lists itself in needs", self.name))
                    .with_fix_hint("Remove the stage from its own `needs`."),
            ));
        }
        Ok(())
    }
}
