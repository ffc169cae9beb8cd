//! Volume image definitions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Default base layer for volume images.
pub const DEFAULT_BASE_IMAGE: &str = "alpine";

/// Label recording the commit the image was built from.
pub const COMMIT_SHA_LABEL: &str = "ade_image_commit_sha";

/// Label recording the tag the image was built from (empty for branches).
pub const COMMIT_TAG_LABEL: &str = "ade_image_commit_tag";

/// Entry point that blocks until the container is stopped.
const BLOCKING_CMD: &str = r#"CMD ["/bin/sh", "-c", "trap 'exit 147' TERM; tail -f /dev/null & wait ${!}"]"#;

/// A data-volume image: one base layer plus the decompressed bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDefinition {
    /// Base image reference.
    pub base_image: String,
    /// Bundle file name inside the build context.
    pub bundle: String,
    /// Path exported as a volume; the bundle's install prefix.
    pub volume: String,
    /// Image labels.
    pub labels: BTreeMap<String, String>,
}

impl ImageDefinition {
    /// Creates a definition embedding `bundle` and exposing `volume`.
    #[must_use]
    pub fn new(bundle: impl Into<String>, volume: impl Into<String>) -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            bundle: bundle.into(),
            volume: volume.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Sets the base image.
    #[must_use]
    pub fn with_base_image(mut self, base: impl Into<String>) -> Self {
        self.base_image = base.into();
        self
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds the commit SHA and commit tag labels.
    #[must_use]
    pub fn with_commit_labels(self, sha: &str, tag: Option<&str>) -> Self {
        self.with_label(COMMIT_SHA_LABEL, sha)
            .with_label(COMMIT_TAG_LABEL, tag.unwrap_or_default())
    }

    /// Renders the Dockerfile.
    ///
    /// `ADD` of a local `tar.gz` decompresses it at `/`, so the bundle's
    /// prefix lands at its original absolute path.
    #[must_use]
    pub fn dockerfile(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "FROM {}", self.base_image);
        let _ = writeln!(out, "ADD {} /", self.bundle);
        let _ = writeln!(out, "VOLUME {}", self.volume);
        let _ = writeln!(out, "{BLOCKING_CMD}");
        out
    }

    /// Renders the ignore file: everything but the bundle is excluded.
    #[must_use]
    pub fn ignore_file(&self) -> String {
        format!("*\n!{}\n", self.bundle)
    }

    /// `--label key=value` pairs for the image build, in key order.
    #[must_use]
    pub fn label_args(&self) -> Vec<String> {
        self.labels
            .iter()
            .flat_map(|(k, v)| ["--label".to_string(), format!("{k}={v}")])
            .collect()
    }
}
