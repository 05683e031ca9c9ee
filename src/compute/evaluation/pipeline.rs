//! Three-stage evaluation inside per-identity artifact directories.

use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::schema::{ArtifactHandle, FitnessRecord, Identity};

use super::evaluator::{Deadline, EvalError, Evaluation, Evaluator, PipelineStageError, Stage};

/// Error returned by a single stage.
pub type StageFailure = Box<dyn Error + Send + Sync>;

/// The three ordered stages of an expensive evaluation.
///
/// Every stage works inside `dir`, a directory owned by the identity for the
/// duration of the call.
pub trait Pipeline: Send + Sync {
    /// Build an initial structure for `identity`, returning its path.
    fn synthesize(
        &self,
        identity: &Identity,
        dir: &Path,
        deadline: Deadline,
    ) -> Result<PathBuf, StageFailure>;

    /// Refine `input`, returning the path of the refined structure.
    fn refine(
        &self,
        identity: &Identity,
        input: &Path,
        dir: &Path,
        deadline: Deadline,
    ) -> Result<PathBuf, StageFailure>;

    /// Score `refined` against every reference target.
    fn score(
        &self,
        identity: &Identity,
        refined: &Path,
        dir: &Path,
        deadline: Deadline,
    ) -> Result<BTreeMap<String, f32>, StageFailure>;
}

/// Evaluator running a [`Pipeline`] under `work_dir/<identity>/`.
///
/// A fresh evaluation starts from an empty directory and removes it on any
/// failure. A refinement runs in a new `refine-<k>` subdirectory, removed on
/// failure so the previous artifacts stay intact.
pub struct StagedEvaluator<P> {
    work_dir: PathBuf,
    pipeline: P,
}

impl<P: Pipeline> StagedEvaluator<P> {
    /// Create the evaluator, creating `work_dir` if needed.
    pub fn new(work_dir: impl Into<PathBuf>, pipeline: P) -> io::Result<Self> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir)?;
        Ok(Self { work_dir, pipeline })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    /// Directory owned by `identity`.
    pub fn identity_dir(&self, identity: &Identity) -> PathBuf {
        self.work_dir.join(identity)
    }

    fn stage_error(stage: Stage, identity: &Identity, cause: StageFailure) -> EvalError {
        PipelineStageError::new(stage, identity, cause).into()
    }

    /// Run refine and score on `input`, all inside `dir`.
    fn refine_and_score(
        &self,
        identity: &Identity,
        input: &Path,
        dir: &Path,
        deadline: Deadline,
    ) -> Result<(PathBuf, FitnessRecord), EvalError> {
        check_deadline(identity, deadline)?;
        let refined = self
            .pipeline
            .refine(identity, input, dir, deadline)
            .map_err(|cause| Self::stage_error(Stage::Refine, identity, cause))?;

        check_deadline(identity, deadline)?;
        let scores = self
            .pipeline
            .score(identity, &refined, dir, deadline)
            .map_err(|cause| Self::stage_error(Stage::Score, identity, cause))?;
        let record = FitnessRecord::from_sub_scores(scores).ok_or_else(|| {
            Self::stage_error(Stage::Score, identity, "no reference target scored".into())
        })?;

        Ok((refined, record))
    }

    fn run_fresh(
        &self,
        identity: &Identity,
        dir: &Path,
        deadline: Deadline,
    ) -> Result<(PathBuf, FitnessRecord), EvalError> {
        fs::create_dir_all(dir)
            .map_err(|err| Self::stage_error(Stage::Synthesize, identity, err.into()))?;

        check_deadline(identity, deadline)?;
        let structure = self
            .pipeline
            .synthesize(identity, dir, deadline)
            .map_err(|cause| Self::stage_error(Stage::Synthesize, identity, cause))?;

        self.refine_and_score(identity, &structure, dir, deadline)
    }
}

fn check_deadline(identity: &Identity, deadline: Deadline) -> Result<(), EvalError> {
    if deadline.is_expired() {
        Err(EvalError::DeadlineExceeded {
            identity: identity.clone(),
        })
    } else {
        Ok(())
    }
}

/// Remove a directory left by a failed attempt.
fn discard(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("Could not remove {} after failure: {err}", dir.display()),
    }
}

/// Next free `refine-<k>` subdirectory of `root`.
fn next_refinement_dir(root: &Path) -> io::Result<PathBuf> {
    let mut next = 0usize;
    for entry in fs::read_dir(root)? {
        let name = entry?.file_name();
        if let Some(k) = name
            .to_str()
            .and_then(|name| name.strip_prefix("refine-"))
            .and_then(|k| k.parse::<usize>().ok())
        {
            next = next.max(k + 1);
        }
    }
    Ok(root.join(format!("refine-{next}")))
}

impl<P: Pipeline> Evaluator for StagedEvaluator<P> {
    fn evaluate(&self, identity: &Identity, deadline: Deadline) -> Result<Evaluation, EvalError> {
        let dir = self.identity_dir(identity);
        // Leftovers from an evicted or crashed run must not leak into this one.
        discard(&dir);

        match self.run_fresh(identity, &dir, deadline) {
            Ok((refined, record)) => {
                debug!("{identity} scored {}", record.fitness);
                Ok(Evaluation {
                    record,
                    artifact: ArtifactHandle::at(dir, refined),
                })
            }
            Err(err) => {
                discard(&dir);
                Err(err)
            }
        }
    }

    fn refine(
        &self,
        identity: &Identity,
        previous: &ArtifactHandle,
        deadline: Deadline,
    ) -> Result<Evaluation, EvalError> {
        let (Some(root), Some(input)) = (&previous.root, &previous.latest) else {
            return self.evaluate(identity, deadline);
        };

        let dir = next_refinement_dir(root)
            .and_then(|dir| fs::create_dir(&dir).map(|()| dir))
            .map_err(|err| Self::stage_error(Stage::Refine, identity, err.into()))?;

        match self.refine_and_score(identity, input, &dir, deadline) {
            Ok((refined, record)) => Ok(Evaluation {
                record,
                artifact: ArtifactHandle::at(root, refined),
            }),
            Err(err) => {
                discard(&dir);
                Err(err)
            }
        }
    }

    fn cleanup(&self, _identity: &Identity, artifact: &ArtifactHandle) -> io::Result<()> {
        match &artifact.root {
            Some(root) => match fs::remove_dir_all(root) {
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes small text files and scores by sequence length.
    #[derive(Default)]
    struct FilePipeline {
        fail_at: Option<Stage>,
        refinements: AtomicUsize,
    }

    impl Pipeline for FilePipeline {
        fn synthesize(
            &self,
            identity: &Identity,
            dir: &Path,
            _deadline: Deadline,
        ) -> Result<PathBuf, StageFailure> {
            let path = dir.join(format!("{identity}.pdb"));
            fs::write(&path, identity.as_str())?;
            if self.fail_at == Some(Stage::Synthesize) {
                return Err("structure builder crashed".into());
            }
            Ok(path)
        }

        fn refine(
            &self,
            _identity: &Identity,
            input: &Path,
            dir: &Path,
            _deadline: Deadline,
        ) -> Result<PathBuf, StageFailure> {
            let round = self.refinements.fetch_add(1, Ordering::SeqCst);
            let path = dir.join("topcluster.pdb");
            let previous = fs::read_to_string(input)?;
            fs::write(&path, format!("{previous}\nround {round}"))?;
            if self.fail_at == Some(Stage::Refine) {
                return Err("relaxation diverged".into());
            }
            Ok(path)
        }

        fn score(
            &self,
            _identity: &Identity,
            refined: &Path,
            _dir: &Path,
            _deadline: Deadline,
        ) -> Result<BTreeMap<String, f32>, StageFailure> {
            if self.fail_at == Some(Stage::Score) {
                return Err("docking failed".into());
            }
            let lines = fs::read_to_string(refined)?.lines().count() as f32;
            Ok(BTreeMap::from([
                ("rec_a".to_string(), -lines),
                ("rec_b".to_string(), -2.0 * lines),
            ]))
        }
    }

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_evaluate_creates_identity_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let evaluator = StagedEvaluator::new(tmp.path().join("pool"), FilePipeline::default())
            .unwrap();
        let a = id("GAVL");

        let eval = evaluator.evaluate(&a, Deadline::none()).unwrap();
        let root = evaluator.identity_dir(&a);
        assert_eq!(eval.artifact.root.as_deref(), Some(root.as_path()));
        assert_eq!(
            eval.artifact.latest.as_deref(),
            Some(root.join("topcluster.pdb").as_path())
        );
        assert!(root.join("GAVL.pdb").exists());
        assert_eq!(eval.record.fitness, -4.0);
        assert_eq!(eval.record.sub_scores["rec_a"], -2.0);

        evaluator.cleanup(&a, &eval.artifact).unwrap();
        assert!(!root.exists());
        // Already gone is fine.
        evaluator.cleanup(&a, &eval.artifact).unwrap();
    }

    #[test]
    fn test_stage_failure_rolls_back() {
        for stage in [Stage::Synthesize, Stage::Refine, Stage::Score] {
            let tmp = tempfile::tempdir().unwrap();
            let evaluator = StagedEvaluator::new(
                tmp.path(),
                FilePipeline {
                    fail_at: Some(stage),
                    ..Default::default()
                },
            )
            .unwrap();
            let a = id("GAVL");

            match evaluator.evaluate(&a, Deadline::none()) {
                Err(EvalError::Stage(err)) => {
                    assert_eq!(err.stage, stage);
                    assert_eq!(err.identity, a);
                }
                other => panic!("expected stage error, got {other:?}"),
            }
            assert!(!evaluator.identity_dir(&a).exists());
        }
    }

    #[test]
    fn test_expired_deadline_fails_before_work() {
        let tmp = tempfile::tempdir().unwrap();
        let evaluator = StagedEvaluator::new(tmp.path(), FilePipeline::default()).unwrap();
        let a = id("GAVL");

        let result = evaluator.evaluate(&a, Deadline::after(std::time::Duration::ZERO));
        assert!(matches!(result, Err(EvalError::DeadlineExceeded { .. })));
        assert!(!evaluator.identity_dir(&a).exists());
        assert_eq!(evaluator.pipeline().refinements.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refine_builds_on_previous_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let evaluator = StagedEvaluator::new(tmp.path(), FilePipeline::default()).unwrap();
        let a = id("GAVL");

        let first = evaluator.evaluate(&a, Deadline::none()).unwrap();
        let second = evaluator
            .refine(&a, &first.artifact, Deadline::none())
            .unwrap();
        let root = evaluator.identity_dir(&a);

        assert_eq!(second.artifact.root, first.artifact.root);
        assert_eq!(
            second.artifact.latest.as_deref(),
            Some(root.join("refine-0").join("topcluster.pdb").as_path())
        );
        // One more line per refinement round.
        assert_eq!(first.record.fitness, -4.0);
        assert_eq!(second.record.fitness, -6.0);

        let third = evaluator
            .refine(&a, &second.artifact, Deadline::none())
            .unwrap();
        assert!(
            third
                .artifact
                .latest
                .as_deref()
                .is_some_and(|p| p.starts_with(root.join("refine-1")))
        );
    }

    #[test]
    fn test_failed_refine_keeps_previous_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let a = id("GAVL");
        let good = StagedEvaluator::new(tmp.path(), FilePipeline::default()).unwrap();
        let first = good.evaluate(&a, Deadline::none()).unwrap();

        let bad = StagedEvaluator::new(
            tmp.path(),
            FilePipeline {
                fail_at: Some(Stage::Refine),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(bad.refine(&a, &first.artifact, Deadline::none()).is_err());

        let root = good.identity_dir(&a);
        assert!(root.join("topcluster.pdb").exists());
        assert!(!root.join("refine-0").exists());
    }
}
