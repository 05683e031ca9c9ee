//! Compute module - Fitness evaluation and the evolutionary search driving it.

pub mod evaluation;
pub mod evolution;
