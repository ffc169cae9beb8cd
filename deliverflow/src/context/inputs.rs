//! Dependency-restricted access to upstream artifacts.

use crate::artifacts::{Artifact, ArtifactStore};
use crate::errors::{Result, UndeclaredDependencyError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// A stage's view of the artifact store.
///
/// Only artifacts of stages listed in `needs` are visible; anything else
/// raises [`UndeclaredDependencyError`].
#[derive(Debug, Clone)]
pub struct StageInputs {
    store: Arc<ArtifactStore>,
    run_id: Uuid,
    stage_name: String,
    declared_dependencies: BTreeSet<String>,
}

impl StageInputs {
    /// Creates the view for `stage_name` in `run_id`.
    #[must_use]
    pub fn new<I, S>(store: Arc<ArtifactStore>, run_id: Uuid, stage_name: impl Into<String>, needs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store,
            run_id,
            stage_name: stage_name.into(),
            declared_dependencies: needs.into_iter().map(Into::into).collect(),
        }
    }

    /// Declared dependencies, sorted.
    #[must_use]
    pub fn needs(&self) -> &BTreeSet<String> {
        &self.declared_dependencies
    }

    fn check(&self, producer: &str) -> std::result::Result<(), UndeclaredDependencyError> {
        if self.declared_dependencies.contains(producer) {
            Ok(())
        } else {
            Err(UndeclaredDependencyError::new(&self.stage_name, producer))
        }
    }

    /// Returns the artifact published by `producer`, if any.
    ///
    /// # Errors
    ///
    /// Returns `UndeclaredDependencyError` if `producer` is not in `needs`.
    pub fn artifact(&self, producer: &str) -> std::result::Result<Option<Artifact>, UndeclaredDependencyError> {
        self.check(producer)?;
        Ok(self.store.get(self.run_id, producer))
    }

    /// Stored location of one of `producer`'s files.
    ///
    /// # Errors
    ///
    /// Returns `UndeclaredDependencyError` if `producer` is not in `needs`.
    pub fn locate(&self, producer: &str, file: &str) -> std::result::Result<Option<PathBuf>, UndeclaredDependencyError> {
        Ok(self.artifact(producer)?.and_then(|artifact| {
            artifact
                .file(file)
                .map(|entry| self.store.stored_path(&artifact, entry))
        }))
    }

    /// Copies `producer`'s files into `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if `producer` is undeclared or the copy fails.
    pub fn fetch_into(&self, producer: &str, dest: &Path) -> Result<Option<Artifact>> {
        self.check(producer)?;
        self.store.fetch_into(self.run_id, producer, dest)
    }

    /// Copies every declared dependency's files into `dest`, in name order.
    ///
    /// # Errors
    ///
    /// Returns an error if any copy fails.
    pub fn fetch_all(&self, dest: &Path) -> Result<Vec<Artifact>> {
        let mut fetched = Vec::new();
        for producer in &self.declared_dependencies {
            if let Some(artifact) = self.store.fetch_into(self.run_id, producer, dest)? {
                fetched.push(artifact);
            }
        }
        Ok(fetched)
    }
}
