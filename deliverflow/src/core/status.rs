//! Stage and run status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a stage plays in the delivery topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Compiles and installs the workspace, then bundles the prefix.
    Build,
    /// Installs the bundle and runs the test suite.
    Test,
    /// Packages the bundle into a volume image and pushes it.
    Deploy,
    /// A configured sequence of shell lines.
    #[default]
    Script,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Test => write!(f, "test"),
            Self::Deploy => write!(f, "deploy"),
            Self::Script => write!(f, "script"),
        }
    }
}

/// The execution status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Waiting for dependencies.
    #[default]
    Pending,
    /// Currently executing.
    Running,
    /// Script exited zero.
    Succeeded,
    /// Script exited non-zero or the stage reported a failure.
    Failed,
    /// Not executed because a dependency did not succeed.
    Skipped,
    /// Interrupted by an external abort.
    Cancelled,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Returns true if dependents may run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

/// The aggregate status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, nothing scheduled yet.
    #[default]
    Pending,
    /// At least one stage has started.
    Running,
    /// Every stage succeeded.
    Succeeded,
    /// At least one stage failed.
    Failed,
    /// The run was aborted.
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl RunStatus {
    /// Returns true once the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Aggregates final stage statuses into a run status.
    ///
    /// Cancellation dominates failure, failure dominates success. Skipped
    /// stages only appear downstream of a failure or cancellation, so they
    /// never decide the outcome on their own.
    #[must_use]
    pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a StageStatus>) -> Self {
        let mut result = Self::Succeeded;
        for status in statuses {
            match status {
                StageStatus::Cancelled => return Self::Cancelled,
                StageStatus::Failed => result = Self::Failed,
                StageStatus::Pending | StageStatus::Running if result == Self::Succeeded => {
                    result = Self::Running;
                }
                _ => {}
            }
        }
        result
    }
}
