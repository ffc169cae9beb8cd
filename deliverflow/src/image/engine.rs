//! Container engine command lines.

use super::ImageDefinition;
use crate::exec::CommandSpec;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the Dockerfile written into the build context.
pub const DOCKERFILE: &str = "Dockerfile";

/// Name of the ignore file written into the build context.
pub const IGNORE_FILE: &str = ".dockerignore";

/// A Docker-compatible engine CLI (`docker`, `podman`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerEngine {
    program: String,
}

impl Default for ContainerEngine {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerEngine {
    /// Uses `program` as the engine binary.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// The engine binary.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// `build` of `context` into `tag`, applying the definition's labels.
    #[must_use]
    pub fn build(&self, context: &Path, definition: &ImageDefinition, tag: &str) -> CommandSpec {
        CommandSpec::new(self.program.as_str())
            .arg("build")
            .arg("--file")
            .arg(context.join(DOCKERFILE).display().to_string())
            .args(definition.label_args())
            .args(["--tag", tag])
            .arg(context.display().to_string())
    }

    /// `tag source target`.
    #[must_use]
    pub fn tag(&self, source: &str, target: &str) -> CommandSpec {
        CommandSpec::new(self.program.as_str()).args(["tag", source, target])
    }

    /// `login` with the token fed through stdin.
    #[must_use]
    pub fn login(&self, registry: &str, user: &str, token: &str) -> CommandSpec {
        CommandSpec::new(self.program.as_str())
            .args(["login", "--username", user, "--password-stdin"])
            .arg(registry)
            .stdin(token)
    }

    /// `push tag`.
    #[must_use]
    pub fn push(&self, tag: &str) -> CommandSpec {
        CommandSpec::new(self.program.as_str()).args(["push", tag])
    }

    /// `logout registry`.
    #[must_use]
    pub fn logout(&self, registry: &str) -> CommandSpec {
        CommandSpec::new(self.program.as_str()).args(["logout", registry])
    }
}
