//! Genome capability and the random source handed to its operators.

use std::fmt::Debug;

use rand::prelude::*;

use crate::schema::{Identity, IdentityError};

/// Random number generator wrapper for genome operations.
///
/// Every operator receives one explicitly; there is no global generator, so a
/// run is reproducible from its seed.
#[derive(Debug, Clone)]
pub struct GenomeRng {
    rng: StdRng,
}

impl GenomeRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create with random seed.
    pub fn random() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seed for a child generator.
    pub fn next_seed(&mut self) -> u64 {
        self.rng.r#gen()
    }

    /// Independent generator seeded from this one.
    pub fn fork(&mut self) -> Self {
        Self::new(self.next_seed())
    }

    /// Uniform draw in `[0, 1)`.
    pub fn unit(&mut self) -> f64 {
        self.rng.r#gen::<f64>()
    }
}

impl RngCore for GenomeRng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

/// Recombination, mutation and identity over a genotype.
///
/// Operators must be deterministic given the generator state.
pub trait Genome: Send + Sync {
    type Genotype: Clone + PartialEq + Send + Sync + Debug;

    /// Combine two parents into one child.
    fn cross_over(
        &self,
        a: &Self::Genotype,
        b: &Self::Genotype,
        rng: &mut GenomeRng,
    ) -> Self::Genotype;

    /// A mutated copy of `a`.
    fn mutate(&self, a: &Self::Genotype, rng: &mut GenomeRng) -> Self::Genotype;

    /// Canonical identity. Equal genotypes map to equal identities.
    fn identity(&self, a: &Self::Genotype) -> Result<Identity, IdentityError>;
}
