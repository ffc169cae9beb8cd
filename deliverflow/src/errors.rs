//! Error types for the deliverflow pipeline.
//!
//! Validation problems are reported before anything runs; stage failures are
//! classified by the stage that produced them so the orchestrator can decide
//! what to skip.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for deliverflow operations.
#[derive(Debug, Error)]
pub enum DeliverError {
    /// A pipeline validation error occurred.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// A cycle was detected in the pipeline.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// A stage read artifacts of a stage it does not depend on.
    #[error("{0}")]
    UndeclaredDependency(#[from] UndeclaredDependencyError),

    /// A second writer tried to publish an artifact.
    #[error("{0}")]
    ArtifactConflict(#[from] ArtifactConflictError),

    /// A stage reported a failure.
    #[error("{0}")]
    Stage(#[from] StageFailure),

    /// The run was aborted.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bundle creation or extraction failed.
    #[error("Archive error at {path}: {message}")]
    Archive {
        /// Archive or directory involved.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// An external tool could not be started.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// YAML (de)serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeliverError {
    /// Builds an archive error.
    #[must_use]
    pub fn archive(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Archive {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T, E = DeliverError> = std::result::Result<T, E>;

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "PIPELINE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the contract code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "PIPELINE-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the `needs` edges in the cycle.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Error raised when a stage reads artifacts it did not declare a dependency on.
#[derive(Debug, Clone, Error)]
#[error("Undeclared dependency: stage '{stage}' attempted to read artifacts of '{producer}' which it does not need")]
pub struct UndeclaredDependencyError {
    /// The stage attempting access.
    pub stage: String,
    /// The producing stage.
    pub producer: String,
}

impl UndeclaredDependencyError {
    /// Creates a new undeclared dependency error.
    #[must_use]
    pub fn new(stage: impl Into<String>, producer: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            producer: producer.into(),
        }
    }
}

/// Error raised when an artifact already exists for a stage in a run.
#[derive(Debug, Clone, Error)]
#[error("Artifact conflict for stage '{stage}': {message}")]
pub struct ArtifactConflictError {
    /// The owning stage.
    pub stage: String,
    /// Additional message.
    pub message: String,
}

impl ArtifactConflictError {
    /// Creates a new artifact conflict error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Classified stage failures.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageFailure {
    /// The external build tool returned non-zero.
    #[error("Build failed: {reason}")]
    Build {
        /// Why the build failed.
        reason: String,
        /// Exit code of the failing command.
        exit_code: Option<i32>,
    },

    /// The test runner reported failing cases.
    #[error("Tests failed: {reason}")]
    Test {
        /// Why the tests failed.
        reason: String,
        /// Exit code of the failing command.
        exit_code: Option<i32>,
    },

    /// Image build, tag, login, or push failed.
    #[error("Packaging failed during {step}: {reason}")]
    Packaging {
        /// Deploy step that failed (build, tag, login, push).
        step: String,
        /// Why it failed.
        reason: String,
        /// Exit code of the failing command.
        exit_code: Option<i32>,
    },

    /// A configured script line returned non-zero.
    #[error("Script failed: {reason}")]
    Script {
        /// Why the script failed.
        reason: String,
        /// Exit code of the failing command.
        exit_code: Option<i32>,
    },
}

impl StageFailure {
    /// Creates a build failure.
    #[must_use]
    pub fn build(reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Build {
            reason: reason.into(),
            exit_code,
        }
    }

    /// Creates a test failure.
    #[must_use]
    pub fn test(reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Test {
            reason: reason.into(),
            exit_code,
        }
    }

    /// Creates a packaging failure.
    #[must_use]
    pub fn packaging(step: impl Into<String>, reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Packaging {
            step: step.into(),
            reason: reason.into(),
            exit_code,
        }
    }

    /// Creates a script failure.
    #[must_use]
    pub fn script(reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Script {
            reason: reason.into(),
            exit_code,
        }
    }

    /// Exit code of the command that caused the failure.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Build { exit_code, .. }
            | Self::Test { exit_code, .. }
            | Self::Packaging { exit_code, .. }
            | Self::Script { exit_code, .. } => *exit_code,
        }
    }

    /// Short classification used in reports ("build", "test", "packaging", "script").
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build { .. } => "build",
            Self::Test { .. } => "test",
            Self::Packaging { .. } => "packaging",
            Self::Script { .. } => "script",
        }
    }
}
