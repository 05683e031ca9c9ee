//! The evaluator capability and its failure types.

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::schema::{ArtifactHandle, FitnessRecord, Identity};

/// Shared, cloneable error cause.
pub type StageCause = Arc<dyn Error + Send + Sync>;

/// Output of one successful evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub record: FitnessRecord,
    pub artifact: ArtifactHandle,
}

/// Point in time after which an evaluation counts as failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// No deadline.
    pub fn none() -> Self {
        Self { at: None }
    }

    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    /// Deadline after `timeout` if one is given.
    pub fn from_timeout(timeout: Option<Duration>) -> Self {
        timeout.map_or_else(Self::none, Self::after)
    }

    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }
}

/// Stage of the evaluation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Structure synthesis from the identity.
    Synthesize,
    /// Iterative physical refinement.
    Refine,
    /// Scoring against the reference targets.
    Score,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Synthesize => "synthesize",
            Stage::Refine => "refine",
            Stage::Score => "score",
        };
        f.write_str(name)
    }
}

/// A pipeline stage failed for one identity.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{stage} stage failed for {identity}: {cause}")]
pub struct PipelineStageError {
    pub stage: Stage,
    pub identity: Identity,
    #[source]
    pub cause: StageCause,
}

impl PipelineStageError {
    pub fn new<E>(stage: Stage, identity: &Identity, cause: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self {
            stage,
            identity: identity.clone(),
            cause: Arc::from(cause.into()),
        }
    }
}

/// The cache's view of its own state contradicts an operation that just
/// completed. Always a bug, never recoverable by retrying.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Cache consistency violated for {identity}: {detail}")]
pub struct CacheConsistencyError {
    pub identity: Identity,
    pub detail: &'static str,
}

/// Failure of a fitness request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Stage(#[from] PipelineStageError),
    #[error("Evaluation of {identity} exceeded its deadline")]
    DeadlineExceeded { identity: Identity },
    #[error("Evaluation of {identity} was abandoned by the computing thread")]
    Aborted { identity: Identity },
    #[error(transparent)]
    Consistency(#[from] CacheConsistencyError),
}

impl EvalError {
    /// Identity the failure refers to.
    pub fn identity(&self) -> &Identity {
        match self {
            EvalError::Stage(err) => &err.identity,
            EvalError::DeadlineExceeded { identity } | EvalError::Aborted { identity } => identity,
            EvalError::Consistency(err) => &err.identity,
        }
    }

    /// Whether the failure indicates a bug rather than a failed evaluation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EvalError::Consistency(_))
    }
}

/// Computes fitness for an identity.
///
/// Implementations are called concurrently for distinct identities and may
/// take arbitrarily long. A failed call must not leave artifacts behind that
/// a later `cleanup` would need to know about.
pub trait Evaluator: Send + Sync {
    /// Evaluate an identity from scratch.
    fn evaluate(&self, identity: &Identity, deadline: Deadline) -> Result<Evaluation, EvalError>;

    /// Evaluate again starting from the artifact of a previous evaluation.
    fn refine(
        &self,
        identity: &Identity,
        previous: &ArtifactHandle,
        deadline: Deadline,
    ) -> Result<Evaluation, EvalError> {
        let _ = previous;
        self.evaluate(identity, deadline)
    }

    /// Release the artifacts of an evicted entry.
    fn cleanup(&self, identity: &Identity, artifact: &ArtifactHandle) -> io::Result<()> {
        let _ = (identity, artifact);
        Ok(())
    }
}

impl<E: Evaluator + ?Sized> Evaluator for Arc<E> {
    fn evaluate(&self, identity: &Identity, deadline: Deadline) -> Result<Evaluation, EvalError> {
        (**self).evaluate(identity, deadline)
    }

    fn refine(
        &self,
        identity: &Identity,
        previous: &ArtifactHandle,
        deadline: Deadline,
    ) -> Result<Evaluation, EvalError> {
        (**self).refine(identity, previous, deadline)
    }

    fn cleanup(&self, identity: &Identity, artifact: &ArtifactHandle) -> io::Result<()> {
        (**self).cleanup(identity, artifact)
    }
}
