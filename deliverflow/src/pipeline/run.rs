//! Run state and the final run report.

use crate::core::{RunStatus, StageKind, StageOutput, StageStatus};
use crate::errors::Result;
use crate::utils::{format_iso8601, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

/// The recorded outcome of one stage in a run.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Stage name.
    pub name: String,
    /// Stage kind.
    pub kind: StageKind,
    /// What the stage produced.
    pub output: StageOutput,
    /// When the stage started; `None` if it never ran.
    pub started_at: Option<Timestamp>,
    /// When the stage reached its final status.
    pub finished_at: Timestamp,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
    /// Files collected into the artifact store.
    pub artifacts: Vec<String>,
}

impl StageResult {
    /// A result for a stage that never started.
    #[must_use]
    pub fn not_run(name: impl Into<String>, kind: StageKind, output: StageOutput) -> Self {
        Self {
            name: name.into(),
            kind,
            output,
            started_at: None,
            finished_at: now_utc(),
            duration_ms: 0.0,
            artifacts: Vec::new(),
        }
    }

    /// The final stage status.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        self.output.status
    }
}

/// One execution of a pipeline.
///
/// Created when the run starts, updated only by the scheduler as stages
/// finish, and terminal once every stage has a final status.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    /// Run id.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Topological schedule.
    pub schedule: Vec<String>,
    /// Aggregate status.
    pub status: RunStatus,
    /// Finished stages, in schedule order once the run is terminal.
    pub stages: Vec<StageResult>,
    /// Run start.
    pub started_at: Timestamp,
    /// Run end.
    pub finished_at: Option<Timestamp>,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

impl PipelineRun {
    /// Creates a pending run.
    #[must_use]
    pub fn new(run_id: Uuid, pipeline: impl Into<String>, schedule: Vec<String>) -> Self {
        Self {
            run_id,
            pipeline: pipeline.into(),
            schedule,
            status: RunStatus::Pending,
            stages: Vec::new(),
            started_at: now_utc(),
            finished_at: None,
            duration_ms: 0.0,
        }
    }

    /// Marks the run as started.
    pub fn mark_running(&mut self) {
        if self.status == RunStatus::Pending {
            self.status = RunStatus::Running;
        }
    }

    /// Records a finished stage.
    pub fn record(&mut self, result: StageResult) {
        self.stages.push(result);
    }

    /// Status of a stage; `Pending` for a scheduled stage without a result.
    #[must_use]
    pub fn stage_status(&self, name: &str) -> Option<StageStatus> {
        self.result(name)
            .map(StageResult::status)
            .or_else(|| self.schedule.iter().any(|s| s == name).then_some(StageStatus::Pending))
    }

    /// The recorded result of a stage.
    #[must_use]
    pub fn result(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|r| r.name == name)
    }

    /// Names of stages with the given status, in schedule order.
    #[must_use]
    pub fn stages_with_status(&self, status: StageStatus) -> Vec<&str> {
        self.schedule
            .iter()
            .filter(|name| self.stage_status(name) == Some(status))
            .map(String::as_str)
            .collect()
    }

    /// Returns true once the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Closes the run: orders results, aggregates the status and stamps the end.
    ///
    /// `cancelled` forces [`RunStatus::Cancelled`] even if the abort landed
    /// between stages and nothing was interrupted.
    pub fn finish(&mut self, cancelled: bool, duration_ms: f64) {
        let position = |name: &str| self.schedule.iter().position(|s| s == name).unwrap_or(usize::MAX);
        let mut stages = std::mem::take(&mut self.stages);
        stages.sort_by_key(|r| position(&r.name));
        self.stages = stages;

        let aggregate = RunStatus::aggregate(self.stages.iter().map(|r| &r.output.status));
        self.status = if cancelled { RunStatus::Cancelled } else { aggregate };
        self.finished_at = Some(now_utc());
        self.duration_ms = duration_ms;
    }

    /// Builds the serializable report.
    #[must_use]
    pub fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id.to_string(),
            pipeline: self.pipeline.clone(),
            status: self.status,
            started_at: format_iso8601(&self.started_at),
            finished_at: self.finished_at.as_ref().map(format_iso8601),
            duration_ms: self.duration_ms,
            stages: self.stages.iter().map(StageReport::from).collect(),
        }
    }
}

/// Per-stage entry of a [`RunReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Stage name.
    pub name: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Final status.
    pub status: StageStatus,
    /// Exit code of the last command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Why the stage was skipped or cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Collected artifact files.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Structured stage results.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
    /// Captured job log.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log: String,
}

impl From<&StageResult> for StageReport {
    fn from(result: &StageResult) -> Self {
        let output = &result.output;
        Self {
            name: result.name.clone(),
            kind: result.kind,
            status: output.status,
            exit_code: output.exit_code,
            duration_ms: result.duration_ms,
            failure: output.failure.as_ref().map(ToString::to_string),
            reason: output.skip_reason.clone().or_else(|| output.cancel_reason.clone()),
            artifacts: result.artifacts.clone(),
            data: output.data.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            log: output.log.clone(),
        }
    }
}

/// What a finished run publishes: final status, per-stage status, exit
/// codes and logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Run id.
    pub run_id: String,
    /// Pipeline name.
    pub pipeline: String,
    /// Final status.
    pub status: RunStatus,
    /// Run start (ISO 8601).
    pub started_at: String,
    /// Run end (ISO 8601).
    #[serde(default)]
    pub finished_at: Option<String>,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
    /// Stage entries in schedule order.
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// Looks up a stage entry.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// The report as a JSON value.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if serialization fails.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Writes the report as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an IO or JSON error.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}
