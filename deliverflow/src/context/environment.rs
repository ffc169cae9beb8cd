//! Run-scoped environment shared read-only by every stage.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

/// Maximum length of a ref slug, matching registry tag limits.
pub const REF_SLUG_MAX_LEN: usize = 63;

#[allow(clippy::expect_used)]
fn non_alphanumeric() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("[^a-z0-9]").expect("static slug pattern is valid"))
}

/// Derives a registry-safe slug from a branch or tag name.
///
/// Lowercases, replaces every character outside `[a-z0-9]` with `-`,
/// truncates to 63 bytes and trims leading and trailing dashes.
///
/// ```
/// use deliverflow::context::ref_slug;
///
/// assert_eq!(ref_slug("feature/Add_Volume"), "feature-add-volume");
/// assert_eq!(ref_slug("v1.2.0"), "v1-2-0");
/// ```
#[must_use]
pub fn ref_slug(ref_name: &str) -> String {
    let lowered = ref_name.to_lowercase();
    let replaced = non_alphanumeric().replace_all(&lowered, "-");
    let truncated: String = replaced.chars().take(REF_SLUG_MAX_LEN).collect();
    truncated.trim_matches('-').to_string()
}

/// A registry credential that never appears in logs or reports.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryToken(String);

impl RegistryToken {
    /// Wraps a token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token, for feeding the registry login's stdin.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if no token was provided.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("RegistryToken(<empty>)")
        } else {
            f.write_str("RegistryToken(<redacted>)")
        }
    }
}

/// Immutable metadata for one pipeline run.
///
/// Built once when the run is triggered and shared through an `Arc`;
/// nothing mutates it afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunEnvironment {
    /// Full commit SHA that triggered the run.
    pub commit_sha: String,
    /// Tag name when the run was triggered by a tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_tag: Option<String>,
    /// Branch or tag name.
    pub ref_name: String,
    /// Registry-safe slug of `ref_name`.
    pub ref_slug: String,
    /// Registry endpoint used for login (e.g. `registry.example.com`).
    #[serde(default)]
    pub registry: String,
    /// Image path inside the registry (e.g. `registry.example.com/group/project`).
    #[serde(default)]
    pub registry_image: String,
    /// Registry login user.
    #[serde(default)]
    pub registry_user: String,
    /// Short-lived registry credential.
    #[serde(skip)]
    pub registry_token: RegistryToken,
    /// Additional pipeline variables exported to every stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
}

impl RunEnvironment {
    /// Creates an environment for a commit on a ref; the slug is derived.
    #[must_use]
    pub fn new(commit_sha: impl Into<String>, ref_name: impl Into<String>) -> Self {
        let ref_name = ref_name.into();
        Self {
            commit_sha: commit_sha.into(),
            ref_slug: ref_slug(&ref_name),
            ref_name,
            ..Self::default()
        }
    }

    /// Loads the environment from CI variables in the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if `CI_COMMIT_SHA` is missing.
    pub fn from_env() -> Result<Self, crate::errors::DeliverError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the environment through an arbitrary variable lookup.
    ///
    /// Reads `CI_COMMIT_SHA`, `CI_COMMIT_TAG`, `CI_COMMIT_REF_NAME`,
    /// `CI_COMMIT_REF_SLUG`, `CI_REGISTRY`, `CI_REGISTRY_IMAGE`,
    /// `CI_REGISTRY_USER` and `CI_JOB_TOKEN` (falling back to
    /// `CI_REGISTRY_PASSWORD`). A missing slug is derived from the ref name.
    ///
    /// # Errors
    ///
    /// Returns an error if `CI_COMMIT_SHA` is missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, crate::errors::DeliverError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let commit_sha = non_empty("CI_COMMIT_SHA").ok_or_else(|| {
            crate::errors::DeliverError::Config("CI_COMMIT_SHA is not set".to_string())
        })?;
        let commit_tag = non_empty("CI_COMMIT_TAG");
        let ref_name = non_empty("CI_COMMIT_REF_NAME")
            .or_else(|| commit_tag.clone())
            .unwrap_or_else(|| "detached".to_string());
        let slug = non_empty("CI_COMMIT_REF_SLUG").unwrap_or_else(|| ref_slug(&ref_name));
        let token = non_empty("CI_JOB_TOKEN")
            .or_else(|| non_empty("CI_REGISTRY_PASSWORD"))
            .unwrap_or_default();

        Ok(Self {
            commit_sha,
            commit_tag,
            ref_name,
            ref_slug: slug,
            registry: non_empty("CI_REGISTRY").unwrap_or_default(),
            registry_image: non_empty("CI_REGISTRY_IMAGE").unwrap_or_default(),
            registry_user: non_empty("CI_REGISTRY_USER").unwrap_or_else(|| "gitlab-ci-token".to_string()),
            registry_token: RegistryToken::new(token),
            variables: BTreeMap::new(),
        })
    }

    /// Sets the commit tag.
    #[must_use]
    pub fn with_commit_tag(mut self, tag: impl Into<String>) -> Self {
        self.commit_tag = Some(tag.into());
        self
    }

    /// Sets the registry endpoint and image path.
    #[must_use]
    pub fn with_registry(mut self, registry: impl Into<String>, image: impl Into<String>) -> Self {
        self.registry = registry.into();
        self.registry_image = image.into();
        self
    }

    /// Sets the registry credentials.
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, token: impl Into<String>) -> Self {
        self.registry_user = user.into();
        self.registry_token = RegistryToken::new(token);
        self
    }

    /// Adds a pipeline variable.
    #[must_use]
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Returns the first eight characters of the commit SHA.
    #[must_use]
    pub fn short_sha(&self) -> &str {
        let end = self
            .commit_sha
            .char_indices()
            .nth(8)
            .map_or(self.commit_sha.len(), |(i, _)| i);
        &self.commit_sha[..end]
    }

    /// Variables exported into every stage sandbox.
    ///
    /// The registry token is deliberately absent; only the deploy stage
    /// receives it, through the login command's stdin.
    #[must_use]
    pub fn exported_vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.variables.clone();
        vars.insert("CI_COMMIT_SHA".to_string(), self.commit_sha.clone());
        vars.insert(
            "CI_COMMIT_TAG".to_string(),
            self.commit_tag.clone().unwrap_or_default(),
        );
        vars.insert("CI_COMMIT_REF_NAME".to_string(), self.ref_name.clone());
        vars.insert("CI_COMMIT_REF_SLUG".to_string(), self.ref_slug.clone());
        vars.insert("CI_REGISTRY".to_string(), self.registry.clone());
        vars.insert("CI_REGISTRY_IMAGE".to_string(), self.registry_image.clone());
        vars
    }
}
