//! Generational search: evaluate, select, recombine, mutate, diagnose.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::compute::evaluation::{
    CacheConsistencyError, Deadline, EvalError, EvaluationCache, Evaluator,
};
use crate::schema::{
    EvolutionConfig, EvolutionConfigError, EvolutionHistory, EvolutionPhase, EvolutionProgress,
    EvolutionStats, FailurePolicy, FitnessRecord, GenerationDiagnostics, Identity, IdentityError,
    StopReason,
};

use super::diagnostics::{FitnessSummary, ParentSampler, diversity};
use super::genome::{Genome, GenomeRng};

/// Outcome of a run.
#[derive(Debug, Clone)]
pub struct EvolutionResult<T> {
    /// Population after the last generation.
    pub population: Vec<T>,
    /// Best evaluated individual seen during the run.
    pub best: Option<(T, FitnessRecord)>,
    pub history: EvolutionHistory,
    pub stats: EvolutionStats,
}

/// Errors that stop a run.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] EvolutionConfigError),
    #[error("Genotype has no valid identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("Evaluation failed: {0}")]
    Evaluation(#[source] EvalError),
    #[error(transparent)]
    Consistency(CacheConsistencyError),
}

impl From<EvalError> for EngineError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::Consistency(err) => EngineError::Consistency(err),
            err => EngineError::Evaluation(err),
        }
    }
}

/// Evolution engine that runs the search.
///
/// Fitness comes from a shared [`EvaluationCache`], so identities revisited
/// across generations are evaluated once while their entry lives.
pub struct EvolutionEngine<G: Genome, E> {
    config: EvolutionConfig,
    genome: G,
    cache: Arc<EvaluationCache<E>>,
    pool: rayon::ThreadPool,
    rng: GenomeRng,
    population: Vec<G::Genotype>,
    history: EvolutionHistory,
    generation: usize,
    best: Option<(G::Genotype, FitnessRecord)>,
    fitness_requests: u64,
    phase: EvolutionPhase,
    cancelled: Arc<AtomicBool>,
}

impl<G, E> EvolutionEngine<G, E>
where
    G: Genome,
    E: Evaluator,
{
    /// Create a new evolution engine starting from `seed_population`.
    pub fn new(
        config: EvolutionConfig,
        genome: G,
        cache: Arc<EvaluationCache<E>>,
        seed_population: Vec<G::Genotype>,
    ) -> Result<Self, EvolutionConfigError> {
        config.validate()?;
        if seed_population.is_empty() {
            return Err(EvolutionConfigError::EmptySeedPopulation);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.evaluation.parallel_workers)
            .thread_name(|i| format!("evopool-worker-{i}"))
            .build()?;

        let rng = match config.random_seed {
            Some(seed) => GenomeRng::new(seed),
            None => GenomeRng::random(),
        };

        Ok(Self {
            config,
            genome,
            cache,
            pool,
            rng,
            population: seed_population,
            history: EvolutionHistory::default(),
            generation: 0,
            best: None,
            fitness_requests: 0,
            phase: EvolutionPhase::Initializing,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get cancellation handle.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn cache(&self) -> &Arc<EvaluationCache<E>> {
        &self.cache
    }

    pub fn genome(&self) -> &G {
        &self.genome
    }

    pub fn population(&self) -> &[G::Genotype] {
        &self.population
    }

    /// Generations completed.
    pub fn generation(&self) -> usize {
        self.generation
    }

    pub fn history(&self) -> &EvolutionHistory {
        &self.history
    }

    pub fn best(&self) -> Option<&(G::Genotype, FitnessRecord)> {
        self.best.as_ref()
    }

    fn identities(&self, population: &[G::Genotype]) -> Result<Vec<Identity>, IdentityError> {
        population
            .iter()
            .map(|individual| self.genome.identity(individual))
            .collect()
    }

    /// Fitness for every member, each distinct identity requested once.
    ///
    /// Returns the records in population order and the number of failed
    /// evaluations that received the worst fitness.
    fn evaluate(
        &mut self,
        identities: &[Identity],
    ) -> Result<(Vec<FitnessRecord>, usize), EngineError> {
        let mut seen = HashSet::with_capacity(identities.len());
        let unique: Vec<&Identity> = identities
            .iter()
            .filter(|identity| seen.insert(*identity))
            .collect();
        self.fitness_requests += unique.len() as u64;

        let timeout = self.config.evaluation.timeout();
        let refine_on_revisit = self.config.evaluation.refine_on_revisit;
        let cache = &self.cache;
        let outcomes: Vec<_> = self.pool.install(|| {
            unique
                .par_iter()
                .map(|&identity| {
                    let deadline = Deadline::from_timeout(timeout);
                    if refine_on_revisit && cache.contains(identity) {
                        cache.refresh(identity, deadline)
                    } else {
                        cache.lookup_or_compute(identity, deadline)
                    }
                })
                .collect()
        });

        let mut failed = 0;
        let mut by_identity = HashMap::with_capacity(unique.len());
        for (identity, outcome) in unique.into_iter().zip(outcomes) {
            let record = match outcome {
                Ok(record) if record.fitness.is_finite() => record,
                Ok(record) => {
                    warn!(
                        "{identity} scored non-finite fitness {}, using worst",
                        record.fitness
                    );
                    FitnessRecord::worst()
                }
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => match self.config.evaluation.failure_policy {
                    FailurePolicy::Abort => return Err(err.into()),
                    FailurePolicy::AssignWorst => {
                        warn!("{err}; assigning worst fitness");
                        failed += 1;
                        FitnessRecord::worst()
                    }
                },
            };
            by_identity.insert(identity, record);
        }

        let records = identities
            .iter()
            .map(|identity| {
                by_identity
                    .get(identity)
                    .cloned()
                    .unwrap_or_else(FitnessRecord::worst)
            })
            .collect();
        Ok((records, failed))
    }

    /// `count` children, parents drawn in proportion to `fitness`.
    ///
    /// Parent indices and child seeds come from the master generator in child
    /// order; crossover then runs in parallel.
    fn recombine(&mut self, fitness: &[f32], count: usize) -> Vec<G::Genotype> {
        let Some(sampler) = ParentSampler::new(fitness) else {
            return Vec::new();
        };
        if count > 0 && sampler.is_uniform() {
            debug!("No positive fitness, sampling parents uniformly");
        }

        let plans: Vec<(usize, usize, u64)> = (0..count)
            .map(|_| {
                let a = sampler.sample(&mut self.rng);
                let b = sampler.sample(&mut self.rng);
                (a, b, self.rng.next_seed())
            })
            .collect();

        let genome = &self.genome;
        let population = &self.population;
        self.pool.install(|| {
            plans
                .into_par_iter()
                .map(|(a, b, seed)| {
                    let mut rng = GenomeRng::new(seed);
                    genome.cross_over(&population[a], &population[b], &mut rng)
                })
                .collect()
        })
    }

    /// Replace each individual, elites included, with a mutant with
    /// probability `mutate_prob`.
    fn mutate(&mut self, next: &mut [G::Genotype]) -> usize {
        let probability = f64::from(self.config.operators.mutate_prob);
        let mut mutated = 0;
        for individual in next.iter_mut() {
            if self.rng.unit() < probability {
                *individual = self.genome.mutate(individual, &mut self.rng);
                mutated += 1;
            }
        }
        mutated
    }

    /// Run one generation and replace the population with its successor.
    pub fn step(&mut self) -> Result<GenerationDiagnostics, EngineError> {
        let size = self.config.population.size;
        self.phase = EvolutionPhase::Running;

        // EVALUATE
        let identities = self.identities(&self.population)?;
        let (records, failed) = self.evaluate(&identities)?;
        let fitness: Vec<f32> = records.iter().map(|record| record.fitness).collect();
        let summary = FitnessSummary::of(&fitness);

        // SELECT: stable, so ties keep population order.
        let mut order: Vec<usize> = (0..fitness.len()).collect();
        order.sort_by(|&a, &b| fitness[b].total_cmp(&fitness[a]));
        if let Some(&top) = order.first() {
            let improved = self
                .best
                .as_ref()
                .is_none_or(|(_, best)| fitness[top] > best.fitness);
            if improved {
                self.best = Some((self.population[top].clone(), records[top].clone()));
            }
        }

        let elites = self
            .config
            .operators
            .elite_count(size)
            .min(self.population.len());
        let mut next: Vec<G::Genotype> = order[..elites]
            .iter()
            .map(|&i| self.population[i].clone())
            .collect();

        // RECOMBINE
        let children = self.recombine(&fitness, size - elites);
        next.extend(children);

        // MUTATE
        let mutated = self.mutate(&mut next);

        // DIAGNOSE
        let diversity = diversity(&next);

        // MARK_USED
        let next_identities = self.identities(&next)?;
        self.cache.mark_used(&next_identities);
        let evicted = match self.config.cache.max_age {
            Some(max_age) => {
                let report = self.cache.evict_stale(max_age);
                for failure in &report.failures {
                    warn!("{failure}");
                }
                report.evicted.len()
            }
            None => 0,
        };

        let diagnostics = GenerationDiagnostics {
            generation: self.generation,
            diversity,
            best_fitness: summary.best,
            mean_fitness: summary.mean,
            fitness_std: summary.std,
            failed_evaluations: failed,
            evicted,
        };
        info!(
            "Generation {}: best {:.3}, mean {:.3}, diversity {}/{}, {} mutated, {} failed, {} evicted, {} cached",
            self.generation + 1,
            summary.best,
            summary.mean,
            diversity,
            next.len(),
            mutated,
            failed,
            evicted,
            self.cache.len()
        );

        self.population = next;
        self.generation += 1;
        self.history.push(diagnostics.clone());
        Ok(diagnostics)
    }

    /// Get current progress.
    pub fn progress(&self) -> EvolutionProgress {
        EvolutionProgress {
            generation: self.generation,
            total_generations: self.config.population.generations,
            latest: self.history.generations.last().cloned(),
            best_fitness: self
                .best
                .as_ref()
                .map_or(FitnessRecord::WORST_FITNESS, |(_, record)| record.fitness),
            cached_entries: self.cache.len(),
            phase: self.phase,
        }
    }

    /// Run evolution with progress callback.
    ///
    /// Runs until `population.generations` generations are complete or the
    /// cancel handle is set; the handle is checked between generations.
    pub fn run_with_callback<F>(
        &mut self,
        mut callback: F,
    ) -> Result<EvolutionResult<G::Genotype>, EngineError>
    where
        F: FnMut(&EvolutionProgress),
    {
        let start_time = Instant::now();
        let baseline = self.cache.stats();
        let requests_before = self.fitness_requests;
        callback(&self.progress());

        let stop_reason = loop {
            if self.cancelled.load(Ordering::Relaxed) {
                self.phase = EvolutionPhase::Stopped;
                break StopReason::Cancelled;
            }
            if self.generation >= self.config.population.generations {
                self.phase = EvolutionPhase::Complete;
                break StopReason::MaxGenerations;
            }

            self.step()?;
            callback(&self.progress());
        };
        callback(&self.progress());

        let stats = self.cache.stats();
        let stats = EvolutionStats {
            generations: self.generation,
            fitness_requests: self.fitness_requests - requests_before,
            cache_hits: stats.hits - baseline.hits,
            cache_misses: stats.misses - baseline.misses,
            elapsed_seconds: start_time.elapsed().as_secs_f64(),
            stop_reason,
        };
        info!(
            "Evolution stopped ({:?}) after {} generations in {:.1}s",
            stats.stop_reason, stats.generations, stats.elapsed_seconds
        );

        Ok(EvolutionResult {
            population: self.population.clone(),
            best: self.best.clone(),
            history: self.history.clone(),
            stats,
        })
    }

    /// Run evolution (blocking).
    pub fn run(&mut self) -> Result<EvolutionResult<G::Genotype>, EngineError> {
        self.run_with_callback(|_| {})
    }
}
