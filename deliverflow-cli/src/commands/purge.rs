//! `deliverflow purge`: drop artifacts past their retention.

use anyhow::Context;
use clap::Args;
use deliverflow::artifacts::ArtifactStore;
use deliverflow::config::OrchestratorConfig;
use deliverflow::utils::{format_iso8601, now_utc, parse_timestamp};
use std::path::PathBuf;

/// Arguments for the `purge` command.
#[derive(Args, Debug)]
pub struct PurgeArgs {
    /// Artifact store directory; `DELIVERFLOW_ARTIFACT_ROOT` or the default otherwise.
    #[arg(long)]
    pub artifact_root: Option<PathBuf>,

    /// Purge as of this RFC 3339 time instead of now.
    #[arg(long, value_name = "TIMESTAMP")]
    pub at: Option<String>,
}

/// Executes the `purge` command.
///
/// # Errors
///
/// Returns an error if the store cannot be opened or a record cannot be removed.
pub fn execute(args: &PurgeArgs) -> anyhow::Result<i32> {
    let root = match &args.artifact_root {
        Some(root) => root.clone(),
        None => OrchestratorConfig::from_env()?.artifact_root,
    };
    let store = ArtifactStore::open(&root).with_context(|| format!("cannot open artifact store at {}", root.display()))?;
    let now = match &args.at {
        Some(at) => parse_timestamp(at)?,
        None => now_utc(),
    };
    let purged = store.purge_expired(now)?;
    for artifact in &purged {
        println!(
            "purged {} {} (expired {})",
            artifact.run_id,
            artifact.stage,
            format_iso8601(&artifact.expires_at)
        );
    }
    tracing::info!(purged = purged.len(), remaining = store.len(), "artifact store purged");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purge_empty_store_in_the_future() {
        let dir = tempfile::tempdir().unwrap();
        let args = PurgeArgs {
            artifact_root: Some(dir.path().join("artifacts")),
            at: Some("2099-01-01T00:00:00Z".to_string()),
        };
        assert_eq!(execute(&args).unwrap(), 0);
    }

    #[test]
    fn test_rejects_bad_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let args = PurgeArgs {
            artifact_root: Some(dir.path().to_path_buf()),
            at: Some("tomorrow".to_string()),
        };
        assert!(execute(&args).is_err());
    }
}
