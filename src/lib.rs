//! evopool - Generational evolutionary search over a pool of cached,
//! expensively evaluated candidates.
//!
//! Candidate fitness comes from a slow external pipeline (structure
//! synthesis, physical refinement, docking against reference targets). The
//! evaluation cache memoizes each result by the candidate's canonical
//! identity, runs at most one evaluation per identity at a time, and evicts
//! entries that no population has used for a configurable number of
//! generations, cleaning up their artifacts.
//!
//! # Architecture
//!
//! - `schema`: Configuration, identities and fitness records
//! - `compute::evaluation`: Evaluator capability, evaluation cache, staged
//!   and command-line pipelines
//! - `compute::evolution`: Genome capability, sequence genome, diagnostics
//!   and the evolution engine
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use evopool::{
//!     compute::evaluation::{CommandPipeline, EvaluationCache, StagedEvaluator},
//!     compute::evolution::{EvolutionEngine, SequenceGenome},
//!     schema::RunConfig,
//! };
//!
//! let config = RunConfig::default();
//! config.validate()?;
//!
//! let evaluator = StagedEvaluator::new(
//!     &config.pipeline.work_dir,
//!     CommandPipeline::new(&config.pipeline),
//! )?;
//! let cache = Arc::new(EvaluationCache::new(evaluator));
//! let genome = SequenceGenome::new(&config.genome);
//!
//! let mut engine =
//!     EvolutionEngine::new(config.evolution, genome, cache, config.seed_population)?;
//! let result = engine.run()?;
//!
//! if let Some((best, record)) = result.best {
//!     println!("Best: {best} ({})", record.fitness);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod compute;
pub mod schema;

// Re-export commonly used types
pub use compute::evaluation::{EvaluationCache, Evaluator};
pub use compute::evolution::{EvolutionEngine, Genome, GenomeRng};
pub use schema::{EvolutionConfig, FitnessRecord, Identity, RunConfig};
