//! Test assertions for stage outputs and runs.

use crate::core::{RunStatus, StageOutput, StageStatus};
use crate::pipeline::PipelineRun;

/// Asserts that the output indicates success.
pub fn assert_output_succeeded(output: &StageOutput) {
    assert!(
        output.is_success(),
        "Expected success, got status: {:?} ({:?})",
        output.status,
        output.failure
    );
}

/// Asserts that the output indicates failure.
pub fn assert_output_failed(output: &StageOutput) {
    assert!(
        output.is_failure(),
        "Expected failure, got status: {:?}",
        output.status
    );
}

/// Asserts that the output has the expected status.
pub fn assert_output_status(output: &StageOutput, expected: StageStatus) {
    assert_eq!(
        output.status, expected,
        "Expected status {:?}, got {:?}",
        expected, output.status
    );
}

/// Asserts that the output contains a specific key.
pub fn assert_output_contains(output: &StageOutput, key: &str) {
    assert!(
        output.get(key).is_some(),
        "Expected output to contain key '{}', but it doesn't. Keys: {:?}",
        key,
        output.data.keys().collect::<Vec<_>>()
    );
}

/// Asserts the status of one stage in a run.
pub fn assert_stage_status(run: &PipelineRun, stage: &str, expected: StageStatus) {
    assert_eq!(
        run.stage_status(stage),
        Some(expected),
        "Expected stage '{stage}' to be {expected:?}; run statuses: {:?}",
        run.stages.iter().map(|r| (r.name.as_str(), r.status())).collect::<Vec<_>>()
    );
}

/// Asserts the aggregate status of a run.
pub fn assert_run_status(run: &PipelineRun, expected: RunStatus) {
    assert_eq!(
        run.status, expected,
        "Expected run status {expected:?}; stages: {:?}",
        run.stages.iter().map(|r| (r.name.as_str(), r.status())).collect::<Vec<_>>()
    );
}
