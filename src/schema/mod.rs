//! Schema module - Configuration and data types for evolutionary search.

mod config;
mod evolution;
mod record;

pub use config::*;
pub use evolution::*;
pub use record::*;
