//! Fitness evaluation: the evaluator capability, the shared evaluation
//! cache and the staged external pipeline.

mod cache;
mod command;
mod evaluator;
mod latch;
mod pipeline;
mod table;

pub use cache::{
    CacheEntry, CacheStats, CacheSummary, EntrySummary, EvaluationCache, EvictionIoError,
    EvictionReport,
};
pub use command::{CommandError, CommandPipeline};
pub use evaluator::{
    CacheConsistencyError, Deadline, EvalError, Evaluation, Evaluator, PipelineStageError, Stage,
    StageCause,
};
pub use pipeline::{Pipeline, StageFailure, StagedEvaluator};
pub use table::TableEvaluator;
