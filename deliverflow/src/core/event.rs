//! Lifecycle events emitted while a run progresses.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An event emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageEvent {
    /// The event type (e.g., "stage.started", "stage.completed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The event payload data.
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl StageEvent {
    /// Creates a new event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            data: BTreeMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Returns the payload as a JSON object.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        serde_json::Value::Object(self.data.clone().into_iter().collect())
    }

    /// Creates a "run.started" event.
    #[must_use]
    pub fn run_started(run_id: &str, schedule: &[String]) -> Self {
        Self::new("run.started")
            .add_data("run_id", serde_json::json!(run_id))
            .add_data("schedule", serde_json::json!(schedule))
    }

    /// Creates a "run.completed" event.
    #[must_use]
    pub fn run_completed(run_id: &str, status: &str, duration_ms: f64) -> Self {
        Self::new("run.completed")
            .add_data("run_id", serde_json::json!(run_id))
            .add_data("status", serde_json::json!(status))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn started(stage_name: &str, image: &str) -> Self {
        Self::new("stage.started")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("image", serde_json::json!(image))
    }

    /// Creates a "stage.completed" event.
    #[must_use]
    pub fn completed(stage_name: &str, duration_ms: f64) -> Self {
        Self::new("stage.completed")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn failed(stage_name: &str, error: &str, exit_code: Option<i32>) -> Self {
        Self::new("stage.failed")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("error", serde_json::json!(error))
            .add_data("exit_code", serde_json::json!(exit_code))
    }

    /// Creates a "stage.skipped" event.
    #[must_use]
    pub fn skipped(stage_name: &str, reason: &str) -> Self {
        Self::new("stage.skipped")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("reason", serde_json::json!(reason))
    }

    /// Creates a "stage.cancelled" event.
    #[must_use]
    pub fn cancelled(stage_name: &str, reason: &str) -> Self {
        Self::new("stage.cancelled")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("reason", serde_json::json!(reason))
    }

    /// Creates an "artifact.collected" event.
    #[must_use]
    pub fn artifact_collected(stage_name: &str, files: usize, expires_at: &str) -> Self {
        Self::new("artifact.collected")
            .add_data("stage", serde_json::json!(stage_name))
            .add_data("files", serde_json::json!(files))
            .add_data("expires_at", serde_json::json!(expires_at))
    }
}
