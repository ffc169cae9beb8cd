//! Run-scoped environment and execution contexts.
//!
//! This module provides:
//! - The immutable run environment shared by all stages
//! - Pipeline and stage execution contexts
//! - Dependency-restricted access to upstream artifacts

mod environment;
mod execution;
mod inputs;

pub use environment::{ref_slug, RegistryToken, RunEnvironment, REF_SLUG_MAX_LEN};
pub use execution::{PipelineContext, StageContext};
pub use inputs::StageInputs;
