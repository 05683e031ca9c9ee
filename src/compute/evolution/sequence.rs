//! Genome over symbol sequences, e.g. peptides in one-letter code.

use rand::Rng;
use rand::seq::SliceRandom;

use crate::schema::{Identity, IdentityError, SequenceGenomeConfig};

use super::genome::{Genome, GenomeRng};

/// One-point crossover and point-substitution mutation over strings.
#[derive(Debug, Clone)]
pub struct SequenceGenome {
    alphabet: Vec<char>,
    min_length: usize,
    max_length: usize,
}

impl SequenceGenome {
    pub fn new(config: &SequenceGenomeConfig) -> Self {
        let mut alphabet: Vec<char> = config.alphabet.chars().collect();
        alphabet.sort_unstable();
        alphabet.dedup();
        Self {
            alphabet,
            min_length: config.min_length,
            max_length: config.max_length.max(config.min_length),
        }
    }

    pub fn alphabet(&self) -> &[char] {
        &self.alphabet
    }

    pub fn length_bounds(&self) -> (usize, usize) {
        (self.min_length, self.max_length)
    }
}

impl Genome for SequenceGenome {
    type Genotype = String;

    /// Head of `a` up to a random cut joined to the tail of `b` from another
    /// random cut, then fitted into the length bounds.
    fn cross_over(&self, a: &String, b: &String, rng: &mut GenomeRng) -> String {
        let a: Vec<char> = a.chars().collect();
        let b: Vec<char> = b.chars().collect();
        let cut_a = rng.gen_range(0..=a.len());
        let cut_b = rng.gen_range(0..=b.len());

        let mut child: Vec<char> = a[..cut_a].iter().chain(&b[cut_b..]).copied().collect();
        child.truncate(self.max_length);

        if child.len() < self.min_length {
            let missing = self.min_length - child.len();
            // Reuse parental material before inventing new symbols.
            let filler: Vec<char> = a[cut_a..].iter().chain(&b[..cut_b]).copied().collect();
            child.extend(filler.iter().take(missing));
            while child.len() < self.min_length {
                match self.alphabet.choose(rng) {
                    Some(&symbol) => child.push(symbol),
                    None => break,
                }
            }
        }

        child.into_iter().collect()
    }

    /// Replace one random position with a different alphabet symbol.
    fn mutate(&self, a: &String, rng: &mut GenomeRng) -> String {
        let mut symbols: Vec<char> = a.chars().collect();
        if symbols.is_empty() {
            return a.clone();
        }
        let position = rng.gen_range(0..symbols.len());
        let current = symbols[position];
        let choices: Vec<char> = self
            .alphabet
            .iter()
            .copied()
            .filter(|&symbol| symbol != current)
            .collect();
        if let Some(&symbol) = choices.choose(rng) {
            symbols[position] = symbol;
        }
        symbols.into_iter().collect()
    }

    fn identity(&self, a: &String) -> Result<Identity, IdentityError> {
        Identity::new(a.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genome(min_length: usize, max_length: usize) -> SequenceGenome {
        SequenceGenome::new(&SequenceGenomeConfig {
            alphabet: "ACDEFGHIKLMNPQRSTVWY".to_string(),
            min_length,
            max_length,
        })
    }

    #[test]
    fn test_crossover_respects_bounds() {
        let genome = genome(4, 8);
        let mut rng = GenomeRng::new(3);
        let a = "GIGAVLKVLTTGLPAL".to_string();
        let b = "FL".to_string();
        for _ in 0..500 {
            let child = genome.cross_over(&a, &b, &mut rng);
            assert!((4..=8).contains(&child.len()), "bad length: {child}");
            assert!(genome.identity(&child).is_ok());
        }
    }

    #[test]
    fn test_crossover_of_clones_uses_parent_symbols() {
        let genome = genome(1, 64);
        let mut rng = GenomeRng::new(11);
        let a = "KKKK".to_string();
        for _ in 0..100 {
            let child = genome.cross_over(&a, &a, &mut rng);
            assert!(child.chars().all(|c| c == 'K'));
        }
    }

    #[test]
    fn test_mutation_changes_one_position() {
        let genome = genome(1, 64);
        let mut rng = GenomeRng::new(5);
        let a = "GIGAVLKVLTTGLPAL".to_string();
        for _ in 0..100 {
            let mutant = genome.mutate(&a, &mut rng);
            assert_eq!(mutant.len(), a.len());
            let changed = a.chars().zip(mutant.chars()).filter(|(x, y)| x != y).count();
            assert_eq!(changed, 1);
        }
    }

    #[test]
    fn test_single_symbol_alphabet_cannot_mutate() {
        let genome = SequenceGenome::new(&SequenceGenomeConfig {
            alphabet: "AA".to_string(),
            min_length: 1,
            max_length: 4,
        });
        assert_eq!(genome.alphabet(), ['A']);
        let mut rng = GenomeRng::new(0);
        assert_eq!(genome.mutate(&"AAA".to_string(), &mut rng), "AAA");
    }

    #[test]
    fn test_operators_are_deterministic() {
        let genome = genome(1, 64);
        let (a, b) = ("GIGAVLKVLTTG".to_string(), "KWKLFKKIGAVL".to_string());
        let run = |seed| {
            let mut rng = GenomeRng::new(seed);
            let child = genome.cross_over(&a, &b, &mut rng);
            genome.mutate(&child, &mut rng)
        };
        assert_eq!(run(9), run(9));
    }
}
