//! Configuration types for a complete run: search settings, the sequence
//! genome, the external stage commands and the seed population.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{EvolutionConfig, EvolutionConfigError, Identity, IdentityError, MAX_IDENTITY_LEN};

/// Top-level run configuration, as read by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Search settings.
    #[serde(default)]
    pub evolution: EvolutionConfig,
    /// Sequence genome settings.
    #[serde(default)]
    pub genome: SequenceGenomeConfig,
    /// Initial population (generation 0).
    pub seed_population: Vec<String>,
    /// External evaluation pipeline.
    pub pipeline: CommandPipelineConfig,
    /// File the diagnostics stream is appended to.
    #[serde(default)]
    pub diagnostics_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            evolution: EvolutionConfig::default(),
            genome: SequenceGenomeConfig::default(),
            seed_population: vec![
                "GIGAVLKVLTTGLPALISWIKRKRQQ".to_string(),
                "GIGAVLKVLTTGLPALISWIKRKRQQ".to_string(),
                "KWKLFKKIGAVLKVLTTGLPALKLTK".to_string(),
                "FLPLIGRVLSGIL".to_string(),
            ],
            pipeline: CommandPipelineConfig::default(),
            diagnostics_path: Some(PathBuf::from("diversity.tsv")),
        }
    }
}

/// Sequence genome settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceGenomeConfig {
    /// Symbols a mutation may introduce.
    #[serde(default = "default_alphabet")]
    pub alphabet: String,
    /// Minimum sequence length after crossover.
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    /// Maximum sequence length after crossover.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
}

impl Default for SequenceGenomeConfig {
    fn default() -> Self {
        Self {
            alphabet: default_alphabet(),
            min_length: default_min_length(),
            max_length: default_max_length(),
        }
    }
}

/// The twenty proteinogenic amino acids, one-letter codes.
fn default_alphabet() -> String {
    "ACDEFGHIKLMNPQRSTVWY".to_string()
}
fn default_min_length() -> usize {
    1
}
fn default_max_length() -> usize {
    64
}

/// One external command.
///
/// `args` and `output` may contain the placeholders `{identity}`, `{dir}`,
/// `{input}`, `{output}` and `{target}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to run.
    pub program: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// File name (relative to the stage directory) the command writes.
    /// Ignored for the scoring stage, which reports on stdout.
    #[serde(default)]
    pub output: Option<String>,
}

/// External evaluation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPipelineConfig {
    /// Directory holding one subdirectory per identity.
    pub work_dir: PathBuf,
    /// Stage 1: build a structure from the identity.
    pub synthesize: CommandSpec,
    /// Stage 2: refine the structure.
    pub refine: CommandSpec,
    /// Stage 3: score the refined structure against one target.
    pub score: CommandSpec,
    /// Reference targets, one score run each.
    pub targets: Vec<String>,
    /// Poll interval while waiting for a child process, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for CommandPipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("pool"),
            synthesize: CommandSpec {
                program: "pymol".to_string(),
                args: vec![
                    "-kcQ".to_string(),
                    "-d".to_string(),
                    "fab {identity}, {identity}, ss=1; save {output}".to_string(),
                ],
                output: Some("{identity}.pdb".to_string()),
            },
            refine: CommandSpec {
                program: "./refine.sh".to_string(),
                args: vec!["{input}".to_string(), "{output}".to_string()],
                output: Some("topcluster.pdb".to_string()),
            },
            score: CommandSpec {
                program: "./dock.sh".to_string(),
                args: vec!["{target}".to_string(), "{input}".to_string()],
                output: None,
            },
            targets: vec!["receptor_a.pdbqt".to_string()],
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    50
}

/// Run configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum RunConfigError {
    #[error(transparent)]
    Evolution(#[from] EvolutionConfigError),
    #[error("Genome alphabet must not be empty")]
    EmptyAlphabet,
    #[error("Genome alphabet contains symbols not allowed in identities: {0}")]
    InvalidAlphabet(#[source] IdentityError),
    #[error(
        "Genome length bounds invalid: need 1 <= min ({min}) <= max ({max}) <= {}",
        MAX_IDENTITY_LEN
    )]
    InvalidLengthBounds { min: usize, max: usize },
    #[error("Seed sequence {index} is not a valid identity: {source}")]
    InvalidSeed {
        index: usize,
        #[source]
        source: IdentityError,
    },
    #[error("Pipeline needs at least one scoring target")]
    NoTargets,
    #[error("{stage} stage needs an output file name")]
    MissingOutput { stage: &'static str },
}

impl RunConfig {
    /// Validate the whole run configuration.
    pub fn validate(&self) -> Result<(), RunConfigError> {
        self.evolution.validate()?;

        if self.seed_population.is_empty() {
            return Err(EvolutionConfigError::EmptySeedPopulation.into());
        }

        if self.genome.alphabet.is_empty() {
            return Err(RunConfigError::EmptyAlphabet);
        }
        let (min, max) = (self.genome.min_length, self.genome.max_length);
        if min == 0 || min > max || max > MAX_IDENTITY_LEN {
            return Err(RunConfigError::InvalidLengthBounds { min, max });
        }
        // Mutation may place any alphabet symbol into an identity.
        Identity::new(self.genome.alphabet.clone()).map_err(RunConfigError::InvalidAlphabet)?;

        for (index, seq) in self.seed_population.iter().enumerate() {
            Identity::new(seq.clone())
                .map_err(|source| RunConfigError::InvalidSeed { index, source })?;
        }

        if self.pipeline.targets.is_empty() {
            return Err(RunConfigError::NoTargets);
        }
        if self.pipeline.synthesize.output.is_none() {
            return Err(RunConfigError::MissingOutput { stage: "synthesize" });
        }
        if self.pipeline.refine.output.is_none() {
            return Err(RunConfigError::MissingOutput { stage: "refine" });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_run_config_valid() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_unsafe_seed() {
        let mut config = RunConfig::default();
        config.seed_population.push("AC/GT".to_string());
        assert!(matches!(
            config.validate(),
            Err(RunConfigError::InvalidSeed { index: 4, .. })
        ));
    }

    #[test]
    fn test_rejects_empty_seed_population() {
        let config = RunConfig {
            seed_population: Vec::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RunConfigError::Evolution(
                EvolutionConfigError::EmptySeedPopulation
            ))
        ));
    }

    #[test]
    fn test_rejects_bad_length_bounds() {
        let mut config = RunConfig::default();
        config.genome.max_length = 300;
        assert!(matches!(
            config.validate(),
            Err(RunConfigError::InvalidLengthBounds { max: 300, .. })
        ));

        config.genome.max_length = 10;
        config.genome.min_length = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_roundtrip_json() {
        let json = serde_json::to_string_pretty(&RunConfig::default()).unwrap();
        let parsed: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pipeline.targets, vec!["receptor_a.pdbqt"]);
        assert_eq!(parsed.genome.alphabet.len(), 20);
    }
}
