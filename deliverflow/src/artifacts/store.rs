//! Run-scoped artifact storage.
//!
//! Each `(run, stage)` pair owns at most one artifact record. Collection is
//! the only write path and refuses a second writer; dependents read through
//! [`crate::context::StageInputs`], which enforces declared dependencies.

use super::bundle::sha256_file;
use super::spec::ArtifactSpec;
use crate::core::StageStatus;
use crate::errors::{ArtifactConflictError, DeliverError, Result};
use crate::utils::{format_duration, format_iso8601, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

const MANIFEST: &str = "manifest.json";
const FILES_DIR: &str = "files";
const LOG_FILE: &str = "job.log";

/// One collected file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the producing stage's workspace, `/`-separated.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Hex SHA-256 of the contents.
    pub sha256: String,
}

/// The outputs published by one stage of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Run that produced the artifact.
    pub run_id: Uuid,
    /// Owning stage.
    pub stage: String,
    /// Status of the stage when the artifact was collected.
    pub stage_status: StageStatus,
    /// Collected files.
    pub files: Vec<ArtifactFile>,
    /// Whether the stage's job log was stored alongside the files.
    #[serde(default)]
    pub has_log: bool,
    /// Collected regardless of the stage outcome.
    pub always_keep: bool,
    /// Collection time.
    pub created_at: Timestamp,
    /// Time after which the artifact is purged.
    pub expires_at: Timestamp,
}

impl Artifact {
    /// Returns true once the retention window has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }

    /// Looks up a collected file by its relative path.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<&ArtifactFile> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Total size of all collected files.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Everything the orchestrator knows when a stage finishes.
#[derive(Debug, Clone, Copy)]
pub struct Collection<'a> {
    /// Current run.
    pub run_id: Uuid,
    /// Finished stage.
    pub stage: &'a str,
    /// Stage workspace the declared paths are relative to.
    pub workspace: &'a Path,
    /// Declared outputs.
    pub spec: &'a ArtifactSpec,
    /// Final stage status.
    pub status: StageStatus,
    /// Captured job log.
    pub log: &'a str,
}

type Key = (Uuid, String);

/// Filesystem-backed artifact store with an in-memory index.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    index: DashMap<Key, Artifact>,
}

impl ArtifactStore {
    /// Opens (or creates) a store rooted at `root`, loading existing manifests.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the root cannot be created or listed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Self {
            root,
            index: DashMap::new(),
        };
        store.load_manifests()?;
        Ok(store)
    }

    /// The store's root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_dir(&self, run_id: Uuid, stage: &str) -> PathBuf {
        self.root.join(run_id.to_string()).join(stage)
    }

    /// Location of a collected file inside the store.
    #[must_use]
    pub fn stored_path(&self, artifact: &Artifact, file: &ArtifactFile) -> PathBuf {
        self.record_dir(artifact.run_id, &artifact.stage)
            .join(FILES_DIR)
            .join(&file.path)
    }

    fn load_manifests(&self) -> Result<()> {
        for run in fs::read_dir(&self.root)? {
            let run = run?;
            if !run.file_type()?.is_dir() {
                continue;
            }
            for stage in fs::read_dir(run.path())? {
                let manifest = stage?.path().join(MANIFEST);
                if !manifest.is_file() {
                    continue;
                }
                match fs::read(&manifest).map_err(DeliverError::from).and_then(|bytes| {
                    serde_json::from_slice::<Artifact>(&bytes).map_err(DeliverError::from)
                }) {
                    Ok(artifact) => {
                        self.index
                            .insert((artifact.run_id, artifact.stage.clone()), artifact);
                    }
                    Err(err) => {
                        tracing::warn!(manifest = %manifest.display(), error = %err, "skipping unreadable artifact manifest");
                    }
                }
            }
        }
        Ok(())
    }

    /// Collects a finished stage's declared outputs and job log.
    ///
    /// Files are copied only when the spec's policy applies to the stage
    /// status; the log is stored for every stage that ran. Declared paths
    /// that do not exist are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactConflictError`] if the stage already published an
    /// artifact in this run, [`DeliverError::Config`] for a declared path
    /// that escapes the workspace, or an IO error.
    pub fn collect(&self, request: Collection<'_>, now: Timestamp) -> Result<Artifact> {
        let key = (request.run_id, request.stage.to_string());
        let vacant = match self.index.entry(key) {
            Entry::Occupied(_) => {
                return Err(ArtifactConflictError::new(
                    request.stage,
                    format!("artifact already published in run {}", request.run_id),
                )
                .into());
            }
            Entry::Vacant(vacant) => vacant,
        };

        let expires_at = chrono::Duration::from_std(request.spec.expire_in)
            .ok()
            .and_then(|expire_in| now.checked_add_signed(expire_in))
            .ok_or_else(|| {
                DeliverError::Config(format!(
                    "retention of {} for stage '{}' is out of range",
                    format_duration(request.spec.expire_in),
                    request.stage
                ))
            })?;

        let dir = self.record_dir(request.run_id, request.stage);
        if dir.join(MANIFEST).exists() {
            return Err(ArtifactConflictError::new(request.stage, "artifact manifest already on disk").into());
        }
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)?;

        let mut files = Vec::new();
        if request.spec.should_collect(request.status) {
            for declared in &request.spec.paths {
                let relative = checked_relative(declared)?;
                let source = request.workspace.join(&relative);
                if !source.exists() {
                    tracing::warn!(stage = request.stage, path = %declared, "declared artifact path not found");
                    continue;
                }
                copy_collect(&source, &relative, &files_dir, &mut files)?;
            }
        } else {
            tracing::debug!(
                stage = request.stage,
                status = %request.status,
                "artifact policy does not apply, storing log only"
            );
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        files.dedup_by(|a, b| a.path == b.path);

        let has_log = !request.log.is_empty();
        if has_log {
            fs::write(dir.join(LOG_FILE), request.log)?;
        }

        let artifact = Artifact {
            run_id: request.run_id,
            stage: request.stage.to_string(),
            stage_status: request.status,
            files,
            has_log,
            always_keep: request.spec.always_keep(),
            created_at: now,
            expires_at,
        };
        fs::write(dir.join(MANIFEST), serde_json::to_vec_pretty(&artifact)?)?;

        tracing::info!(
            stage = request.stage,
            files = artifact.files.len(),
            bytes = artifact.total_bytes(),
            expires_at = %format_iso8601(&artifact.expires_at),
            "artifact collected"
        );
        vacant.insert(artifact.clone());
        Ok(artifact)
    }

    /// Returns the artifact a stage published in a run.
    #[must_use]
    pub fn get(&self, run_id: Uuid, stage: &str) -> Option<Artifact> {
        self.index
            .get(&(run_id, stage.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Lists all artifacts, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<Artifact> {
        let mut all: Vec<Artifact> = self.index.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.stage.cmp(&b.stage)));
        all
    }

    /// Lists the artifacts of one run, oldest first.
    #[must_use]
    pub fn list_run(&self, run_id: Uuid) -> Vec<Artifact> {
        self.list().into_iter().filter(|a| a.run_id == run_id).collect()
    }

    /// Reads a stage's stored job log.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the log exists but cannot be read.
    pub fn read_log(&self, run_id: Uuid, stage: &str) -> Result<Option<String>> {
        let path = self.record_dir(run_id, stage).join(LOG_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?))
    }

    /// Copies a stage's files into `dest`, preserving relative paths.
    ///
    /// Every stored file is re-hashed first; a digest mismatch aborts the
    /// fetch. Returns `None` if the stage published nothing in this run.
    ///
    /// # Errors
    ///
    /// Returns [`DeliverError::Archive`] on a digest mismatch or an IO error.
    pub fn fetch_into(&self, run_id: Uuid, stage: &str, dest: &Path) -> Result<Option<Artifact>> {
        let Some(artifact) = self.get(run_id, stage) else {
            return Ok(None);
        };

        for file in &artifact.files {
            let stored = self.stored_path(&artifact, file);
            let digest = sha256_file(&stored)?;
            if digest != file.sha256 {
                return Err(DeliverError::archive(
                    stored,
                    format!("digest mismatch: expected {}, found {digest}", file.sha256),
                ));
            }
            let target = dest.join(&file.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&stored, &target)?;
        }

        tracing::debug!(stage, files = artifact.files.len(), dest = %dest.display(), "artifact fetched");
        Ok(Some(artifact))
    }

    /// Removes every artifact whose retention elapsed at `now`.
    ///
    /// Always-keep artifacts expire like any other. Returns the purged records.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a record directory cannot be removed.
    pub fn purge_expired(&self, now: Timestamp) -> Result<Vec<Artifact>> {
        let expired: Vec<Key> = self
            .index
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();

        let mut purged = Vec::with_capacity(expired.len());
        for key in expired {
            let Some((_, artifact)) = self.index.remove(&key) else {
                continue;
            };
            let dir = self.record_dir(artifact.run_id, &artifact.stage);
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            let run_dir = self.root.join(artifact.run_id.to_string());
            if fs::read_dir(&run_dir).is_ok_and(|mut entries| entries.next().is_none()) {
                fs::remove_dir(&run_dir)?;
            }
            tracing::info!(run_id = %artifact.run_id, stage = %artifact.stage, "artifact purged");
            purged.push(artifact);
        }
        Ok(purged)
    }

    /// Number of artifacts in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if no artifacts are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn checked_relative(declared: &str) -> Result<PathBuf> {
    let path = Path::new(declared);
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => {
                return Err(DeliverError::Config(format!(
                    "artifact path '{declared}' must stay inside the workspace"
                )));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(DeliverError::Config(format!("artifact path '{declared}' is empty")));
    }
    Ok(relative)
}

fn copy_collect(source: &Path, relative: &Path, files_dir: &Path, out: &mut Vec<ArtifactFile>) -> Result<()> {
    let metadata = fs::metadata(source)?;
    if metadata.is_dir() {
        let mut children: Vec<_> = fs::read_dir(source)?.collect::<std::io::Result<_>>()?;
        children.sort_by_key(fs::DirEntry::file_name);
        for child in children {
            copy_collect(&child.path(), &relative.join(child.file_name()), files_dir, out)?;
        }
        return Ok(());
    }

    let target = files_dir.join(relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(source, &target)?;
    out.push(ArtifactFile {
        path: relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        size_bytes: metadata.len(),
        sha256: sha256_file(&target)?,
    });
    Ok(())
}
