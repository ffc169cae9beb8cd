//! Testing utilities for delivery pipelines.
//!
//! This module provides:
//! - A scripted command runner standing in for external tools
//! - Mock stages
//! - Assertions for stage outputs and runs

mod assertions;
mod mocks;

pub use assertions::{
    assert_output_contains, assert_output_failed, assert_output_status, assert_output_succeeded,
    assert_run_status, assert_stage_status,
};
pub use mocks::{FailingStage, RecordedExecution, RecordingStage, ScriptedRunner, SlowStage};
