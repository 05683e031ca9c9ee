//! Identity, fitness and artifact types shared by the cache and the engine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Maximum length of an identity in bytes (a single path component).
pub const MAX_IDENTITY_LEN: usize = 255;

/// Canonical identity of a genotype.
///
/// Used both as the cache key and as a directory name under the evaluator's
/// work directory, so the character set is restricted to ASCII alphanumerics,
/// `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    /// Validate and wrap an identity string.
    pub fn new(value: impl Into<String>) -> Result<Self, IdentityError> {
        let value = value.into();
        if value.is_empty() {
            return Err(IdentityError::Empty);
        }
        if value.len() > MAX_IDENTITY_LEN {
            return Err(IdentityError::TooLong { len: value.len() });
        }
        if let Some(ch) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(IdentityError::InvalidChar { ch, value });
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<Path> for Identity {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

/// Identity validation errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity must be non-empty")]
    Empty,
    #[error("Identity is {len} bytes, limit is {MAX_IDENTITY_LEN}")]
    TooLong { len: usize },
    #[error("Identity {value:?} contains disallowed character {ch:?}")]
    InvalidChar { ch: char, value: String },
}

/// Fitness of one evaluated identity.
///
/// `fitness` is the scalar used for selection. When the record is built from
/// per-target sub-scores it is the minimum (best) sub-score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessRecord {
    pub fitness: f32,
    #[serde(default)]
    pub sub_scores: BTreeMap<String, f32>,
}

impl FitnessRecord {
    /// Fitness substituted for failed evaluations under
    /// [`FailurePolicy::AssignWorst`](super::FailurePolicy::AssignWorst).
    pub const WORST_FITNESS: f32 = 0.0;

    /// A record with a scalar fitness and no sub-scores.
    pub fn scalar(fitness: f32) -> Self {
        Self {
            fitness,
            sub_scores: BTreeMap::new(),
        }
    }

    /// A record whose fitness is the minimum of `sub_scores`.
    ///
    /// Returns `None` when no sub-score is given.
    pub fn from_sub_scores<K, I>(sub_scores: I) -> Option<Self>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, f32)>,
    {
        let sub_scores: BTreeMap<String, f32> = sub_scores
            .into_iter()
            .map(|(key, score)| (key.into(), score))
            .collect();
        let fitness = sub_scores.values().copied().reduce(f32::min)?;
        Some(Self {
            fitness,
            sub_scores,
        })
    }

    /// The record used in place of a failed evaluation.
    pub fn worst() -> Self {
        Self::scalar(Self::WORST_FITNESS)
    }
}

/// Handle to artifacts stored by an evaluator.
///
/// The cache keeps the handle next to the fitness and gives it back to the
/// evaluator for refinement and cleanup. It never touches the files itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHandle {
    /// Directory owned by this identity, removed on cleanup.
    pub root: Option<PathBuf>,
    /// Most recent artifact, input to the next refinement.
    pub latest: Option<PathBuf>,
}

impl ArtifactHandle {
    /// Handle for evaluators that store nothing.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn at(root: impl Into<PathBuf>, latest: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            latest: Some(latest.into()),
        }
    }
}
