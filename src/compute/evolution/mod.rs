//! Generational evolutionary search over cached fitness.
//!
//! # Overview
//!
//! - **Genome** (`genome`): the crossover, mutation and identity capability,
//!   plus the seeded [`GenomeRng`] handed to every operator
//! - **Sequence genome** (`sequence`): a ready-made genome over symbol strings
//! - **Diagnostics** (`diagnostics`): diversity, fitness-proportionate parent
//!   sampling and the tab-separated diagnostics stream
//! - **Search** (`search`): the [`EvolutionEngine`] driving generations
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use evopool::compute::evaluation::{EvaluationCache, TableEvaluator};
//! use evopool::compute::evolution::{EvolutionEngine, SequenceGenome};
//! use evopool::schema::{EvolutionConfig, SequenceGenomeConfig};
//!
//! let genome = SequenceGenome::new(&SequenceGenomeConfig::default());
//! let cache = Arc::new(EvaluationCache::new(
//!     TableEvaluator::default().with_default_fitness(1.0),
//! ));
//! let seeds = vec!["GIGAVLKVLTTG".to_string(), "FLPLIGRVLSGIL".to_string()];
//!
//! let mut engine = EvolutionEngine::new(EvolutionConfig::default(), genome, cache, seeds)?;
//! let result = engine.run_with_callback(|progress| {
//!     println!("Generation {}: best fitness = {:.3}",
//!         progress.generation, progress.best_fitness);
//! })?;
//! println!("Final diversity: {:?}", result.history.diversity().last());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod diagnostics;
mod genome;
mod search;
mod sequence;

pub use diagnostics::{DiagnosticsWriter, FitnessSummary, ParentSampler, diversity};
pub use genome::{Genome, GenomeRng};
pub use search::{EngineError, EvolutionEngine, EvolutionResult};
pub use sequence::SequenceGenome;
