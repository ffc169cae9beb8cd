//! Event sink system for observability.
//!
//! The orchestrator reports every lifecycle transition through an
//! [`EventSink`]; runs without a configured sink use [`NoOpEventSink`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
