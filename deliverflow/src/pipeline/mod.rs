//! Pipeline building and execution.
//!
//! This module provides:
//! - Stage specifications
//! - Pipeline builder with validation
//! - The DAG scheduler and run state
//! - YAML pipeline definitions

mod builder;
mod config;
mod dag;
mod run;
mod spec;

pub use builder::PipelineBuilder;
pub use config::{PipelineConfig, StageConfig, DEPLOY_IMAGE};
pub use dag::StageGraph;
pub use run::{PipelineRun, RunReport, StageReport, StageResult};
pub use spec::{StageSpec, DEFAULT_IMAGE};
