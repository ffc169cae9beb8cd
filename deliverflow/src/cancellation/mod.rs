//! Cooperative cancellation for pipeline runs.
//!
//! An external abort flips the run's [`CancellationToken`]; the command
//! runner kills the in-flight process and the scheduler stops dispatching.

mod token;

pub use token::CancellationToken;
