//! Core domain model types for deliverflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage kind, stage status and run status enums
//! - Stage output type with factory methods
//! - Lifecycle events

mod event;
mod output;
mod status;

pub use event::StageEvent;
pub use output::StageOutput;
pub use status::{RunStatus, StageKind, StageStatus};
