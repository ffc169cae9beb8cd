//! Orchestrator settings.
//!
//! Defaults are overridden by `DELIVERFLOW_*` environment variables, and
//! the CLI layers its flags on top.

use crate::errors::{DeliverError, Result};
use crate::exec::Isolation;
use crate::observability::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How ready stages are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One stage at a time, in schedule order.
    #[default]
    Sequential,
    /// Independent ready stages run concurrently.
    Parallel {
        /// Upper bound on concurrently running stages.
        max_concurrency: usize,
    },
}

impl ExecutionMode {
    /// Number of stages allowed to run at once.
    #[must_use]
    pub fn concurrency(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Parallel { max_concurrency } => max_concurrency.max(1),
        }
    }
}

/// Settings for the orchestrator itself, independent of any pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Where stage sandboxes are created.
    pub work_root: PathBuf,
    /// Where artifacts are stored.
    pub artifact_root: PathBuf,
    /// Scheduling mode.
    pub mode: ExecutionMode,
    /// Stage isolation.
    pub isolation: Isolation,
    /// Source tree copied into every sandbox workspace.
    pub source_dir: Option<PathBuf>,
    /// Keep sandboxes after the run.
    pub keep_sandboxes: bool,
    /// Where to write the JSON run report.
    pub report_path: Option<PathBuf>,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("deliverflow").join("work"),
            artifact_root: PathBuf::from(".deliverflow").join("artifacts"),
            mode: ExecutionMode::Sequential,
            isolation: Isolation::Process,
            source_dir: None,
            keep_sandboxes: false,
            report_path: None,
            log_format: LogFormat::Text,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by `DELIVERFLOW_*` variables from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`DeliverError::Config`] for malformed values.
    pub fn from_env() -> Result<Self> {
        Self::default().apply_lookup(|key| std::env::var(key).ok())
    }

    /// Applies overrides read through `lookup`.
    ///
    /// Recognised keys: `DELIVERFLOW_WORK_ROOT`, `DELIVERFLOW_ARTIFACT_ROOT`,
    /// `DELIVERFLOW_MAX_CONCURRENCY`, `DELIVERFLOW_ISOLATION` (`process`,
    /// `docker`, `podman`), `DELIVERFLOW_SOURCE_DIR`,
    /// `DELIVERFLOW_KEEP_SANDBOXES`, `DELIVERFLOW_REPORT` and
    /// `DELIVERFLOW_LOG_FORMAT`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliverError::Config`] for malformed values.
    pub fn apply_lookup<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("DELIVERFLOW_WORK_ROOT") {
            self.work_root = PathBuf::from(v);
        }
        if let Some(v) = get("DELIVERFLOW_ARTIFACT_ROOT") {
            self.artifact_root = PathBuf::from(v);
        }
        if let Some(v) = get("DELIVERFLOW_MAX_CONCURRENCY") {
            let n: usize = v
                .parse()
                .map_err(|_| DeliverError::Config(format!("DELIVERFLOW_MAX_CONCURRENCY must be a number, got '{v}'")))?;
            self.mode = if n <= 1 {
                ExecutionMode::Sequential
            } else {
                ExecutionMode::Parallel { max_concurrency: n }
            };
        }
        if let Some(v) = get("DELIVERFLOW_ISOLATION") {
            self.isolation = parse_isolation(&v)?;
        }
        if let Some(v) = get("DELIVERFLOW_SOURCE_DIR") {
            self.source_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DELIVERFLOW_KEEP_SANDBOXES") {
            self.keep_sandboxes = parse_bool(&v)?;
        }
        if let Some(v) = get("DELIVERFLOW_REPORT") {
            self.report_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DELIVERFLOW_LOG_FORMAT") {
            self.log_format = v.parse()?;
        }
        Ok(self)
    }

    /// Sets the sandbox root.
    #[must_use]
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = root.into();
        self
    }

    /// Sets the artifact root.
    #[must_use]
    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    /// Sets the execution mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the isolation mode.
    #[must_use]
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Sets the source tree seeded into each sandbox.
    #[must_use]
    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    /// Sets the report path.
    #[must_use]
    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }

    /// Keeps sandboxes after each stage.
    #[must_use]
    pub fn with_keep_sandboxes(mut self, keep: bool) -> Self {
        self.keep_sandboxes = keep;
        self
    }
}

/// Parses `process`, `docker` or `podman` (any other value is taken as an engine binary).
///
/// # Errors
///
/// Returns [`DeliverError::Config`] for an empty value.
pub fn parse_isolation(value: &str) -> Result<Isolation> {
    match value.trim() {
        "" => Err(DeliverError::Config("isolation must not be empty".to_string())),
        "process" | "host" => Ok(Isolation::Process),
        engine => Ok(Isolation::container(engine)),
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(DeliverError::Config(format!("expected a boolean, got '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(ToString::to_string)
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.mode, ExecutionMode::Sequential);
        assert_eq!(config.mode.concurrency(), 1);
        assert_eq!(config.isolation, Isolation::Process);
    }

    #[test]
    fn test_env_overrides() {
        let config = OrchestratorConfig::default()
            .apply_lookup(lookup(&[
                ("DELIVERFLOW_WORK_ROOT", "/tmp/work"),
                ("DELIVERFLOW_MAX_CONCURRENCY", "4"),
                ("DELIVERFLOW_ISOLATION", "podman"),
                ("DELIVERFLOW_KEEP_SANDBOXES", "yes"),
                ("DELIVERFLOW_LOG_FORMAT", "json"),
            ]))
            .unwrap();

        assert_eq!(config.work_root, PathBuf::from("/tmp/work"));
        assert_eq!(config.mode, ExecutionMode::Parallel { max_concurrency: 4 });
        assert_eq!(config.isolation, Isolation::container("podman"));
        assert!(config.keep_sandboxes);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_malformed_overrides() {
        assert!(OrchestratorConfig::default()
            .apply_lookup(lookup(&[("DELIVERFLOW_MAX_CONCURRENCY", "many")]))
            .is_err());
        assert!(OrchestratorConfig::default()
            .apply_lookup(lookup(&[("DELIVERFLOW_KEEP_SANDBOXES", "maybe")]))
            .is_err());
    }

    #[test]
    fn test_parallel_mode_floor() {
        assert_eq!(ExecutionMode::Parallel { max_concurrency: 0 }.concurrency(), 1);
    }
}
