//! Process execution and per-stage sandboxes.

mod command;
mod sandbox;

#[cfg(test)]
pub use command::MockCommandRunner;
pub use command::{CommandOutput, CommandRunner, CommandSpec, ProcessRunner};
pub use sandbox::{Isolation, Sandbox, CONTAINER_WORKDIR, SESSION_DIR};
