//! Declared artifact outputs of a stage.

use crate::core::StageStatus;
use crate::utils::{check_max, format_duration, parse_duration, DurationParseError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Default retention window for collected artifacts.
pub const DEFAULT_EXPIRE_IN: Duration = Duration::from_secs(86_400);

/// When a stage's declared outputs are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactWhen {
    /// Only after the stage succeeded.
    #[default]
    OnSuccess,
    /// Only after the stage failed.
    OnFailure,
    /// Regardless of the outcome (always-keep).
    Always,
}

impl ArtifactWhen {
    /// Returns true if outputs should be collected for a stage that ended in `status`.
    #[must_use]
    pub fn applies_to(self, status: StageStatus) -> bool {
        match self {
            Self::Always => true,
            Self::OnSuccess => status.is_success(),
            Self::OnFailure => status.is_failure(),
        }
    }
}

/// Which files a stage publishes and for how long they are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Paths relative to the stage workspace; directories are collected recursively.
    #[serde(default)]
    pub paths: Vec<String>,

    /// Retention window.
    #[serde(
        default = "default_expire_in",
        serialize_with = "serialize_retention",
        deserialize_with = "deserialize_retention"
    )]
    pub expire_in: Duration,

    /// Collection policy.
    #[serde(default)]
    pub when: ArtifactWhen,
}

fn default_expire_in() -> Duration {
    DEFAULT_EXPIRE_IN
}

impl Default for ArtifactSpec {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            expire_in: DEFAULT_EXPIRE_IN,
            when: ArtifactWhen::OnSuccess,
        }
    }
}

impl ArtifactSpec {
    /// Creates a spec for the given paths with the default retention.
    #[must_use]
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sets the retention window.
    #[must_use]
    pub fn with_expire_in(mut self, expire_in: Duration) -> Self {
        self.expire_in = expire_in;
        self
    }

    /// Sets the collection policy.
    #[must_use]
    pub fn with_when(mut self, when: ArtifactWhen) -> Self {
        self.when = when;
        self
    }

    /// Marks the artifact as always-keep.
    #[must_use]
    pub fn always(self) -> Self {
        self.with_when(ArtifactWhen::Always)
    }

    /// Returns true if outputs are collected even when the stage fails.
    #[must_use]
    pub fn always_keep(&self) -> bool {
        self.when == ArtifactWhen::Always
    }

    /// Returns true if declared outputs should be collected for `status`.
    ///
    /// Skipped stages never ran, so nothing is collected for them.
    #[must_use]
    pub fn should_collect(&self, status: StageStatus) -> bool {
        status != StageStatus::Skipped && self.when.applies_to(status)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRetention {
    Seconds(u64),
    Text(String),
}

fn serialize_retention<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(*value))
}

fn deserialize_retention<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    match RawRetention::deserialize(deserializer)? {
        RawRetention::Seconds(seconds) => check_max(Duration::from_secs(seconds))
            .ok_or_else(|| serde::de::Error::custom(DurationParseError::TooLong(seconds.to_string()))),
        RawRetention::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}
