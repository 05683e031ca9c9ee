//! Evaluator backed by a fixed identity → fitness table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::schema::{ArtifactHandle, FitnessRecord, Identity};

use super::evaluator::{Deadline, EvalError, Evaluation, Evaluator, PipelineStageError, Stage};

/// Looks fitness up in a table and counts invocations.
///
/// Identities missing from the table fail in the scoring stage, or receive
/// `default_fitness` when one is set.
#[derive(Debug, Default)]
pub struct TableEvaluator {
    table: HashMap<Identity, FitnessRecord>,
    default_fitness: Option<f32>,
    invocations: AtomicUsize,
}

impl TableEvaluator {
    pub fn new(table: HashMap<Identity, FitnessRecord>) -> Self {
        Self {
            table,
            default_fitness: None,
            invocations: AtomicUsize::new(0),
        }
    }

    /// Build from scalar fitness values.
    pub fn from_scalars<I>(values: I) -> Self
    where
        I: IntoIterator<Item = (Identity, f32)>,
    {
        Self::new(
            values
                .into_iter()
                .map(|(identity, fitness)| (identity, FitnessRecord::scalar(fitness)))
                .collect(),
        )
    }

    /// Fitness for identities missing from the table.
    pub fn with_default_fitness(mut self, fitness: f32) -> Self {
        self.default_fitness = Some(fitness);
        self
    }

    /// Number of `evaluate`/`refine` calls so far.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Evaluator for TableEvaluator {
    fn evaluate(&self, identity: &Identity, _deadline: Deadline) -> Result<Evaluation, EvalError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);

        let record = match (self.table.get(identity), self.default_fitness) {
            (Some(record), _) => record.clone(),
            (None, Some(fitness)) => FitnessRecord::scalar(fitness),
            (None, None) => {
                return Err(PipelineStageError::new(
                    Stage::Score,
                    identity,
                    format!("no table entry for {identity}"),
                )
                .into());
            }
        };

        Ok(Evaluation {
            record,
            artifact: ArtifactHandle::none(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lookup() {
        let a = Identity::new("A").unwrap();
        let b = Identity::new("B").unwrap();
        let evaluator = TableEvaluator::from_scalars([(a.clone(), 3.0)]);

        let eval = evaluator.evaluate(&a, Deadline::none()).unwrap();
        assert_eq!(eval.record.fitness, 3.0);
        assert!(matches!(
            evaluator.evaluate(&b, Deadline::none()),
            Err(EvalError::Stage(PipelineStageError {
                stage: Stage::Score,
                ..
            }))
        ));
        assert_eq!(evaluator.invocations(), 2);

        let evaluator = evaluator.with_default_fitness(0.5);
        assert_eq!(
            evaluator.evaluate(&b, Deadline::none()).unwrap().record.fitness,
            0.5
        );
    }
}
