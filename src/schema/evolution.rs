//! Evolution configuration types.
//!
//! Everything the engine needs to know before generation 0: population and
//! generation counts, operator probabilities, evaluation parallelism and
//! failure policy, and the cache staleness threshold.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for an evolutionary search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Population and generation settings.
    #[serde(default)]
    pub population: PopulationConfig,
    /// Selection and variation settings.
    #[serde(default)]
    pub operators: OperatorConfig,
    /// Evaluation settings (parallelism, deadlines, failure handling).
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Evaluation cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

/// Population and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Number of individuals in every generation after the seed (N).
    #[serde(default = "default_population_size")]
    pub size: usize,
    /// Number of generations to run (n). There is no early exit.
    #[serde(default = "default_generations")]
    pub generations: usize,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            size: default_population_size(),
            generations: default_generations(),
        }
    }
}

fn default_population_size() -> usize {
    50
}
fn default_generations() -> usize {
    100
}

/// Selection and variation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Probability that an individual of the next generation is mutated
    /// (0.0-1.0). Elite copies are not exempt.
    #[serde(default = "default_mutate_prob")]
    pub mutate_prob: f32,
    /// Fraction of the population copied unchanged, best first (0.0-1.0).
    #[serde(default = "default_copy_fraction")]
    pub copy_fraction: f32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            mutate_prob: default_mutate_prob(),
            copy_fraction: default_copy_fraction(),
        }
    }
}

impl OperatorConfig {
    /// Number of elites for a population of `size`: `floor(copy_fraction * size)`.
    ///
    /// Taken in f64 with one f32 epsilon of slack per member, so `0.53` of
    /// 100 is 53.
    pub fn elite_count(&self, size: usize) -> usize {
        let n = size as f64;
        let product = f64::from(self.copy_fraction) * n + n * f64::from(f32::EPSILON);
        (product.floor() as usize).min(size)
    }
}

fn default_mutate_prob() -> f32 {
    0.1
}
fn default_copy_fraction() -> f32 {
    0.2
}

/// How the engine reacts to a failed evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Use [`FitnessRecord::worst`](super::FitnessRecord::worst) and continue.
    #[default]
    AssignWorst,
    /// Stop the run and return the error.
    Abort,
}

/// Evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Number of parallel evaluations (0 = auto-detect).
    #[serde(default)]
    pub parallel_workers: usize,
    /// Deadline for a single evaluation, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// Reaction to failed evaluations.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Re-run refinement and scoring for identities that are already cached
    /// instead of reusing the stored fitness.
    #[serde(default)]
    pub refine_on_revisit: bool,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            parallel_workers: 0,
            timeout_secs: None,
            failure_policy: FailurePolicy::default(),
            refine_on_revisit: false,
        }
    }
}

impl EvaluationConfig {
    /// Per-evaluation timeout, if configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}

/// Evaluation cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Evict entries unused for more than this many generations.
    /// `None` disables eviction.
    #[serde(default = "default_max_age")]
    pub max_age: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: default_max_age(),
        }
    }
}

fn default_max_age() -> Option<usize> {
    Some(3)
}

// ============================================================================
// Progress and Result Types
// ============================================================================

/// Diagnostics recorded for one generation.
///
/// `generation`, `diversity` and `best_fitness` form the diagnostics stream;
/// the remaining fields are extra context for progress reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationDiagnostics {
    /// Zero-based generation index.
    pub generation: usize,
    /// Individuals of the next population with no equal counterpart in it.
    pub diversity: usize,
    /// Best fitness of the evaluated generation.
    pub best_fitness: f32,
    /// Mean fitness of the evaluated generation.
    pub mean_fitness: f32,
    /// Standard deviation of fitness in the evaluated generation.
    pub fitness_std: f32,
    /// Evaluations that failed and were substituted.
    pub failed_evaluations: usize,
    /// Entries evicted from the cache at the end of this generation.
    pub evicted: usize,
}

/// Evolution history for plotting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvolutionHistory {
    pub generations: Vec<GenerationDiagnostics>,
}

impl EvolutionHistory {
    pub fn push(&mut self, diagnostics: GenerationDiagnostics) {
        self.generations.push(diagnostics);
    }

    pub fn len(&self) -> usize {
        self.generations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    /// Best fitness per generation.
    pub fn best_fitness(&self) -> Vec<f32> {
        self.generations.iter().map(|d| d.best_fitness).collect()
    }

    /// Diversity per generation.
    pub fn diversity(&self) -> Vec<usize> {
        self.generations.iter().map(|d| d.diversity).collect()
    }
}

/// Current phase of evolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EvolutionPhase {
    /// Seed population installed, nothing evaluated.
    #[default]
    Initializing,
    /// Generations in progress.
    Running,
    /// All generations done.
    Complete,
    /// Cancelled before the last generation.
    Stopped,
}

/// Progress update sent after every generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionProgress {
    /// Generations completed so far.
    pub generation: usize,
    /// Total generations planned.
    pub total_generations: usize,
    /// Diagnostics of the generation just completed.
    pub latest: Option<GenerationDiagnostics>,
    /// Best fitness seen so far.
    pub best_fitness: f32,
    /// Entries currently held by the evaluation cache.
    pub cached_entries: usize,
    /// Current phase.
    pub phase: EvolutionPhase,
}

/// Statistics from an evolution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionStats {
    /// Generations run.
    pub generations: usize,
    /// Fitness requests issued by the engine (one per unique identity per
    /// generation).
    pub fitness_requests: u64,
    /// Requests answered from the cache.
    pub cache_hits: u64,
    /// Requests that ran the evaluator.
    pub cache_misses: u64,
    /// Time taken (in seconds).
    pub elapsed_seconds: f64,
    /// Reason for stopping.
    pub stop_reason: StopReason,
}

/// Reason evolution stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Ran the configured number of generations.
    MaxGenerations,
    /// Cancelled through the cancel handle.
    Cancelled,
}

// ============================================================================
// Validation
// ============================================================================

/// Evolution configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionConfigError {
    #[error("Population size must be at least 1")]
    PopulationTooSmall,
    #[error("Seed population must not be empty")]
    EmptySeedPopulation,
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f32 },
    #[error("Evaluation timeout must be positive and finite, got {0}")]
    InvalidTimeout(f64),
    #[error("Could not build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl EvolutionConfig {
    /// Validate evolution configuration.
    pub fn validate(&self) -> Result<(), EvolutionConfigError> {
        if self.population.size == 0 {
            return Err(EvolutionConfigError::PopulationTooSmall);
        }

        let check_unit = |value: f32, name: &'static str| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(EvolutionConfigError::OutOfUnitRange { name, value })
            }
        };
        check_unit(self.operators.mutate_prob, "mutate_prob")?;
        check_unit(self.operators.copy_fraction, "copy_fraction")?;

        if let Some(secs) = self.evaluation.timeout_secs
            && !(secs > 0.0 && Duration::try_from_secs_f64(secs).is_ok())
        {
            return Err(EvolutionConfigError::InvalidTimeout(secs));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = EvolutionConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = EvolutionConfig::default();
        config.population.size = 0;
        assert!(matches!(
            config.validate(),
            Err(EvolutionConfigError::PopulationTooSmall)
        ));

        let mut config = EvolutionConfig::default();
        config.operators.mutate_prob = 1.5;
        assert!(matches!(
            config.validate(),
            Err(EvolutionConfigError::OutOfUnitRange {
                name: "mutate_prob",
                ..
            })
        ));

        let mut config = EvolutionConfig::default();
        config.operators.copy_fraction = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = EvolutionConfig::default();
        config.operators.copy_fraction = -0.1;
        assert!(config.validate().is_err());

        let mut config = EvolutionConfig::default();
        config.evaluation.timeout_secs = Some(0.0);
        assert!(matches!(
            config.validate(),
            Err(EvolutionConfigError::InvalidTimeout(_))
        ));
    }

    #[test]
    fn test_rejects_timeout_beyond_duration_range() {
        let mut config = EvolutionConfig::default();
        config.evaluation.timeout_secs = Some(1e20);
        assert!(matches!(
            config.validate(),
            Err(EvolutionConfigError::InvalidTimeout(_))
        ));

        config.evaluation.timeout_secs = Some(f64::INFINITY);
        assert!(config.validate().is_err());

        config.evaluation.timeout_secs = Some(2.5);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.evaluation.timeout(),
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_elite_count() {
        let ops = OperatorConfig {
            mutate_prob: 0.0,
            copy_fraction: 0.2,
        };
        assert_eq!(ops.elite_count(10), 2);
        assert_eq!(ops.elite_count(4), 0);
        assert_eq!(ops.elite_count(1), 0);

        let all = OperatorConfig {
            mutate_prob: 0.0,
            copy_fraction: 1.0,
        };
        assert_eq!(all.elite_count(7), 7);
    }

    #[test]
    fn test_elite_count_of_decimal_fractions() {
        let count = |copy_fraction: f32, size| {
            OperatorConfig {
                mutate_prob: 0.0,
                copy_fraction,
            }
            .elite_count(size)
        };
        assert_eq!(count(0.53, 100), 53);
        assert_eq!(count(0.59, 100), 59);
        assert_eq!(count(0.42, 150), 63);
        assert_eq!(count(0.25, 7), 1);
        assert_eq!(count(0.0, 100), 0);

        for k in 0..=100u32 {
            let fraction = k as f32 / 100.0;
            for size in 1..=200usize {
                assert_eq!(
                    count(fraction, size),
                    (k as usize * size) / 100,
                    "{fraction} x {size}"
                );
            }
        }
    }

    #[test]
    fn test_serialization() {
        let json = r#"{
            "population": { "size": 12, "generations": 4 },
            "operators": { "mutate_prob": 0.05 },
            "evaluation": { "failure_policy": "Abort", "timeout_secs": 30.0 },
            "cache": { "max_age": null },
            "random_seed": 7
        }"#;
        let parsed: EvolutionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.population.size, 12);
        assert_eq!(parsed.operators.copy_fraction, 0.2);
        assert_eq!(parsed.evaluation.failure_policy, FailurePolicy::Abort);
        assert_eq!(parsed.evaluation.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(parsed.cache.max_age, None);
        assert_eq!(parsed.random_seed, Some(7));

        let roundtrip: EvolutionConfig =
            serde_json::from_str(&serde_json::to_string(&EvolutionConfig::default()).unwrap())
                .unwrap();
        assert_eq!(roundtrip.cache.max_age, Some(3));
    }
}
