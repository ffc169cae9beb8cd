//! Stage output type with factory methods.

use super::StageStatus;
use crate::errors::StageFailure;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The outcome of one stage execution.
///
/// Stages build one of these through the factory methods; the orchestrator
/// never mutates it except to append the captured setup log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the stage execution.
    pub status: StageStatus,

    /// Exit code of the last command run by the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Structured results (test summary, pushed tags, bundle digest...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,

    /// Captured stdout/stderr of every command, in order.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log: String,

    /// Classified failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StageFailure>,

    /// Skip reason (for skipped stages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Cancel reason (for aborted stages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl Default for StageOutput {
    fn default() -> Self {
        Self::succeeded()
    }
}

impl StageOutput {
    fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            exit_code: None,
            data: HashMap::new(),
            log: String::new(),
            failure: None,
            skip_reason: None,
            cancel_reason: None,
        }
    }

    /// Creates a successful output.
    #[must_use]
    pub fn succeeded() -> Self {
        let mut output = Self::with_status(StageStatus::Succeeded);
        output.exit_code = Some(0);
        output
    }

    /// Creates a failed output.
    #[must_use]
    pub fn failed(failure: StageFailure) -> Self {
        let mut output = Self::with_status(StageStatus::Failed);
        output.exit_code = failure.exit_code();
        output.failure = Some(failure);
        output
    }

    /// Creates a skipped output.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        let mut output = Self::with_status(StageStatus::Skipped);
        output.skip_reason = Some(reason.into());
        output
    }

    /// Creates a cancelled output.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        let mut output = Self::with_status(StageStatus::Cancelled);
        output.cancel_reason = Some(reason.into());
        output
    }

    /// Adds a data entry.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Replaces the captured log.
    #[must_use]
    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }

    /// Sets the exit code.
    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    /// Prepends text to the captured log.
    pub fn prepend_log(&mut self, prefix: &str) {
        if prefix.is_empty() {
            return;
        }
        let mut log = String::with_capacity(prefix.len() + self.log.len());
        log.push_str(prefix);
        log.push_str(&self.log);
        self.log = log;
    }

    /// Gets a data value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the stage failed or was cancelled.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeded_has_zero_exit() {
        let output = StageOutput::succeeded().with_data("bundle", serde_json::json!("opt.tar.gz"));
        assert!(output.is_success());
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.get("bundle"), Some(&serde_json::json!("opt.tar.gz")));
    }

    #[test]
    fn test_failed_carries_exit_code() {
        let output = StageOutput::failed(StageFailure::build("boom", Some(2)));
        assert!(output.is_failure());
        assert_eq!(output.exit_code, Some(2));
        assert_eq!(output.failure.as_ref().map(StageFailure::kind), Some("build"));
    }

    #[test]
    fn test_prepend_log() {
        let mut output = StageOutput::succeeded().with_log("script\n");
        output.prepend_log("setup\n");
        assert_eq!(output.log, "setup\nscript\n");
    }

    #[test]
    fn test_skipped_serialization_omits_empty_fields() {
        let output = StageOutput::skipped("dependency 'build' failed");
        let json = serde_json::to_value(&output).unwrap();
        assert_eq!(json["status"], "skipped");
        assert!(json.get("log").is_none());
        assert!(json.get("failure").is_none());
    }
}
