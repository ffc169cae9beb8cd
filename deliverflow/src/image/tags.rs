//! Registry tags for a delivered image.

use crate::context::RunEnvironment;
use serde::{Deserialize, Serialize};

/// The two references an image is published under.
///
/// The commit tag is immutable; the ref tag moves with the branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTags {
    /// `<image>:commit-<sha>`.
    pub commit: String,
    /// `<image>:<ref_slug>`.
    pub reference: String,
}

impl ImageTags {
    /// Derives the tags for `image` from a commit SHA and ref slug.
    #[must_use]
    pub fn new(image: &str, commit_sha: &str, ref_slug: &str) -> Self {
        Self {
            commit: format!("{image}:commit-{commit_sha}"),
            reference: format!("{image}:{ref_slug}"),
        }
    }

    /// Derives the tags from the run environment.
    #[must_use]
    pub fn for_run(env: &RunEnvironment) -> Self {
        Self::new(&env.registry_image, &env.commit_sha, &env.ref_slug)
    }

    /// Both tags, commit tag first.
    #[must_use]
    pub fn all(&self) -> [&str; 2] {
        [&self.commit, &self.reference]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_tags_for_run() {
        let env = RunEnvironment::new("0123abcd", "feature/Fast-Path")
            .with_registry("registry.example.com", "registry.example.com/perf/volume");
        let tags = ImageTags::for_run(&env);

        assert_eq!(tags.commit, "registry.example.com/perf/volume:commit-0123abcd");
        assert_eq!(tags.reference, "registry.example.com/perf/volume:feature-fast-path");
    }

    #[test]
    fn test_tags_are_stable() {
        let env = RunEnvironment::new("0123abcd", "main").with_registry("r", "r/i");
        assert_eq!(ImageTags::for_run(&env), ImageTags::for_run(&env));
        assert_eq!(ImageTags::for_run(&env).all(), ["r/i:commit-0123abcd", "r/i:main"]);
    }
}
