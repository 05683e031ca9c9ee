//! Population diversity, parent sampling and the diagnostics stream.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};

use crate::schema::GenerationDiagnostics;

use super::genome::GenomeRng;

/// Number of individuals with no equal counterpart elsewhere in `population`.
///
/// Quadratic in the population size; genotypes only need `PartialEq`.
pub fn diversity<T: PartialEq>(population: &[T]) -> usize {
    population
        .iter()
        .enumerate()
        .filter(|&(i, individual)| {
            !population
                .iter()
                .enumerate()
                .any(|(j, other)| i != j && other == individual)
        })
        .count()
}

/// Best, mean and standard deviation of a generation's fitness values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitnessSummary {
    pub best: f32,
    pub mean: f32,
    pub std: f32,
}

impl FitnessSummary {
    pub fn of(fitness: &[f32]) -> Self {
        if fitness.is_empty() {
            return Self {
                best: 0.0,
                mean: 0.0,
                std: 0.0,
            };
        }
        let n = fitness.len() as f32;
        let best = fitness.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = fitness.iter().sum::<f32>() / n;
        let variance = fitness.iter().map(|f| (f - mean).powi(2)).sum::<f32>() / n;
        Self {
            best,
            mean,
            std: variance.sqrt(),
        }
    }
}

/// Fitness-proportionate choice of parent indices.
///
/// Negative and non-finite weights count as zero. When no weight is positive
/// every index is equally likely.
#[derive(Debug, Clone)]
pub struct ParentSampler {
    weighted: Option<WeightedIndex<f64>>,
    len: usize,
}

impl ParentSampler {
    /// `None` for an empty population.
    ///
    /// Weights are summed in f64, which cannot overflow for any population of
    /// finite f32 fitness values.
    pub fn new(fitness: &[f32]) -> Option<Self> {
        if fitness.is_empty() {
            return None;
        }
        let weights = fitness.iter().map(|&f| {
            if f.is_finite() && f > 0.0 {
                f64::from(f)
            } else {
                0.0
            }
        });
        Some(Self {
            weighted: WeightedIndex::new(weights).ok(),
            len: fitness.len(),
        })
    }

    pub fn is_uniform(&self) -> bool {
        self.weighted.is_none()
    }

    pub fn sample(&self, rng: &mut GenomeRng) -> usize {
        match &self.weighted {
            Some(weighted) => weighted.sample(rng),
            None => rng.gen_range(0..self.len),
        }
    }
}

/// Appends one tab-separated `generation diversity best_fitness` line per
/// generation.
pub struct DiagnosticsWriter<W: Write> {
    out: W,
}

impl DiagnosticsWriter<BufWriter<File>> {
    /// Open `path` for appending, creating it if needed.
    pub fn append_to(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> DiagnosticsWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Write and flush one record.
    pub fn record(&mut self, diagnostics: &GenerationDiagnostics) -> io::Result<()> {
        writeln!(
            self.out,
            "{}\t{}\t{}",
            diagnostics.generation, diagnostics.diversity, diagnostics.best_fitness
        )?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diversity_counts_unique_only() {
        assert_eq!(diversity(&["A", "A", "B", "C"]), 2);
        assert_eq!(diversity(&["A", "A"]), 0);
        assert_eq!(diversity(&["A"]), 1);
        assert_eq!(diversity::<&str>(&[]), 0);
    }

    #[test]
    fn test_fitness_summary() {
        let summary = FitnessSummary::of(&[1.0, 3.0]);
        assert_eq!(summary.best, 3.0);
        assert_eq!(summary.mean, 2.0);
        assert_eq!(summary.std, 1.0);
    }

    #[test]
    fn test_all_zero_weights_sample_uniformly() {
        let sampler = ParentSampler::new(&[0.0, 0.0, -1.0, f32::NAN]).unwrap();
        assert!(sampler.is_uniform());

        let mut rng = GenomeRng::new(17);
        let mut counts = [0usize; 4];
        for _ in 0..4000 {
            counts[sampler.sample(&mut rng)] += 1;
        }
        assert!(counts.iter().all(|&c| c > 800), "{counts:?}");
    }

    #[test]
    fn test_weighted_sampling_skips_zero_weights() {
        let sampler = ParentSampler::new(&[0.0, 5.0, -2.0, 1.0]).unwrap();
        assert!(!sampler.is_uniform());

        let mut rng = GenomeRng::new(23);
        let mut counts = [0usize; 4];
        for _ in 0..6000 {
            counts[sampler.sample(&mut rng)] += 1;
        }
        assert_eq!(counts[0], 0);
        assert_eq!(counts[2], 0);
        assert!(counts[1] > 3 * counts[3], "{counts:?}");
        assert!(ParentSampler::new(&[]).is_none());
    }

    #[test]
    fn test_huge_weights_do_not_overflow() {
        let sampler = ParentSampler::new(&[f32::MAX, f32::MAX, 0.0]).unwrap();
        assert!(!sampler.is_uniform());

        let mut rng = GenomeRng::new(1);
        let mut counts = [0usize; 3];
        for _ in 0..2000 {
            counts[sampler.sample(&mut rng)] += 1;
        }
        assert_eq!(counts[2], 0);
        assert!(counts[0] > 600 && counts[1] > 600, "{counts:?}");
    }

    #[test]
    fn test_writer_appends_tsv_lines() {
        let mut writer = DiagnosticsWriter::new(Vec::new());
        for generation in 1..=2 {
            writer
                .record(&GenerationDiagnostics {
                    generation,
                    diversity: 7,
                    best_fitness: 1.5,
                    ..Default::default()
                })
                .unwrap();
        }
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(text, "1\t7\t1.5\n2\t7\t1.5\n");
    }

    #[test]
    fn test_append_to_file_keeps_previous_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("diversity.tsv");
        for generation in [1, 2] {
            let mut writer = DiagnosticsWriter::append_to(&path).unwrap();
            writer
                .record(&GenerationDiagnostics {
                    generation,
                    ..Default::default()
                })
                .unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }
}
