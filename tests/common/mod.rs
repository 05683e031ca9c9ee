//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use evopool::compute::evaluation::{EvaluationCache, TableEvaluator};
use evopool::compute::evolution::{Genome, GenomeRng};
use evopool::schema::{
    EvolutionConfig, Identity, IdentityError, OperatorConfig, PopulationConfig,
};

/// Crossover returns the first parent, mutation appends a marker.
pub struct FirstParent;

impl Genome for FirstParent {
    type Genotype = String;

    fn cross_over(&self, a: &String, _b: &String, _rng: &mut GenomeRng) -> String {
        a.clone()
    }

    fn mutate(&self, a: &String, _rng: &mut GenomeRng) -> String {
        format!("{a}m")
    }

    fn identity(&self, a: &String) -> Result<Identity, IdentityError> {
        Identity::new(a.as_str())
    }
}

pub fn id(s: &str) -> Identity {
    Identity::new(s).unwrap()
}

/// `s0`..`s{n-1}`.
pub fn seeds(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("s{i}")).collect()
}

/// Cache over a table scoring `s<i>` with `fitness(i)`.
pub fn table_cache(
    n: usize,
    fitness: impl Fn(usize) -> f32,
) -> Arc<EvaluationCache<TableEvaluator>> {
    let table = (0..n).map(|i| (id(&format!("s{i}")), fitness(i)));
    Arc::new(EvaluationCache::new(TableEvaluator::from_scalars(table)))
}

pub fn config(
    size: usize,
    generations: usize,
    mutate_prob: f32,
    copy_fraction: f32,
    seed: u64,
) -> EvolutionConfig {
    EvolutionConfig {
        population: PopulationConfig { size, generations },
        operators: OperatorConfig {
            mutate_prob,
            copy_fraction,
        },
        random_seed: Some(seed),
        ..Default::default()
    }
}
