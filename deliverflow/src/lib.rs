//! # Deliverflow
//!
//! A continuous-delivery pipeline that builds a workspace, tests the
//! resulting install and packages the build into a container image used as
//! a read-only data volume.
//!
//! Deliverflow provides:
//!
//! - **DAG scheduling**: stages run in dependency order; dependents of a
//!   failed stage are skipped
//! - **Artifact handoff**: a store with one writer per artifact, readable
//!   only by stages that declare the dependency
//! - **Isolated sandboxes**: a fresh workspace per stage, on the host or in
//!   a container
//! - **Built-in stages**: build and bundle, test, and image packaging that
//!   drive external tools as processes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deliverflow::prelude::*;
//!
//! let graph = PipelineConfig::reference().to_graph()?;
//! let env = Arc::new(RunEnvironment::from_env()?);
//! let store = Arc::new(ArtifactStore::open(".deliverflow/artifacts")?);
//! let ctx = Arc::new(PipelineContext::new(env, store, Arc::new(ProcessRunner::new())));
//!
//! let run = graph.execute(ctx, &OrchestratorConfig::from_env()?).await?;
//! println!("{}", run.status);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    missing_docs,
    rust_2018_idioms
)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod artifacts;
pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod exec;
pub mod image;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::artifacts::{Artifact, ArtifactSpec, ArtifactStore, ArtifactWhen};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{ExecutionMode, OrchestratorConfig};
    pub use crate::context::{PipelineContext, RunEnvironment, StageContext, StageInputs};
    pub use crate::core::{RunStatus, StageEvent, StageKind, StageOutput, StageStatus};
    pub use crate::errors::{
        ContractErrorInfo, CycleDetectedError, DeliverError, PipelineValidationError, StageFailure,
        UndeclaredDependencyError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::exec::{CommandOutput, CommandRunner, CommandSpec, Isolation, ProcessRunner};
    pub use crate::pipeline::{PipelineBuilder, PipelineConfig, PipelineRun, RunReport, StageGraph, StageSpec};
    pub use crate::stages::{BuildStage, DeployStage, ScriptStage, Stage, TestStage};
    pub use crate::utils::{iso_timestamp, Timestamp};
}
