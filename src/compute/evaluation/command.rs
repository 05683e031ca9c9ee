//! Pipeline stages backed by external programs.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use log::{debug, trace};
use rayon::prelude::*;

use crate::schema::{CommandPipelineConfig, CommandSpec, Identity};

use super::evaluator::Deadline;
use super::pipeline::{Pipeline, StageFailure};

/// External command failures.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} exited with {status}")]
    Exit { program: String, status: ExitStatus },
    #[error("{program} killed at deadline")]
    Timeout { program: String },
    #[error("{program} did not write {}", path.display())]
    MissingOutput { program: String, path: PathBuf },
    #[error("Could not parse score from {program} output line {line:?}")]
    Parse { program: String, line: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Values substituted into command templates.
#[derive(Debug, Clone, Copy)]
struct Bindings<'a> {
    identity: &'a Identity,
    dir: &'a Path,
    input: Option<&'a Path>,
    output: Option<&'a Path>,
    target: Option<&'a str>,
}

impl<'a> Bindings<'a> {
    fn new(identity: &'a Identity, dir: &'a Path) -> Self {
        Self {
            identity,
            dir,
            input: None,
            output: None,
            target: None,
        }
    }

    fn expand(&self, template: &str) -> String {
        let path = |p: Option<&Path>| p.map(|p| p.display().to_string()).unwrap_or_default();
        template
            .replace("{identity}", self.identity.as_str())
            .replace("{dir}", &self.dir.display().to_string())
            .replace("{input}", &path(self.input))
            .replace("{output}", &path(self.output))
            .replace("{target}", self.target.unwrap_or_default())
    }
}

/// Runs each stage as a child process inside the stage directory.
///
/// Child stdout and stderr go to `<stage>.log` files next to the artifacts.
/// The scoring command runs once per target and reports its score as the
/// last non-empty line of stdout. Selection maximizes fitness and fitness is
/// the minimum over targets, so energies must be reported negated.
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    synthesize: CommandSpec,
    refine: CommandSpec,
    score: CommandSpec,
    targets: Vec<String>,
    poll_interval: Duration,
}

impl CommandPipeline {
    pub fn new(config: &CommandPipelineConfig) -> Self {
        Self {
            synthesize: config.synthesize.clone(),
            refine: config.refine.clone(),
            score: config.score.clone(),
            targets: config.targets.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
        }
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    /// Where `spec` is expected to write, if it declares an output.
    fn output_path(spec: &CommandSpec, bindings: &Bindings<'_>) -> Option<PathBuf> {
        spec.output
            .as_deref()
            .map(|template| bindings.dir.join(bindings.expand(template)))
    }

    /// Run `spec` to completion, killing it at the deadline.
    ///
    /// Returns the path of the captured stdout.
    fn run(
        &self,
        spec: &CommandSpec,
        bindings: &Bindings<'_>,
        log_name: &str,
        deadline: Deadline,
    ) -> Result<PathBuf, CommandError> {
        let args: Vec<String> = spec.args.iter().map(|arg| bindings.expand(arg)).collect();
        let stdout_path = bindings.dir.join(format!("{log_name}.out"));
        let stderr_path = bindings.dir.join(format!("{log_name}.log"));

        debug!(
            "{}: {} {}",
            bindings.identity,
            spec.program,
            args.join(" ")
        );
        let mut child = Command::new(&spec.program)
            .args(&args)
            .current_dir(bindings.dir)
            .stdin(Stdio::null())
            .stdout(File::create(&stdout_path)?)
            .stderr(File::create(&stderr_path)?)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if deadline.is_expired() {
                // The child may exit between the poll and the kill.
                let _ = child.kill();
                child.wait()?;
                return Err(CommandError::Timeout {
                    program: spec.program.clone(),
                });
            }
            let nap = deadline
                .remaining()
                .map_or(self.poll_interval, |left| left.min(self.poll_interval));
            thread::sleep(nap);
        };
        trace!("{} finished with {status}", spec.program);

        if !status.success() {
            return Err(CommandError::Exit {
                program: spec.program.clone(),
                status,
            });
        }
        Ok(stdout_path)
    }

    /// Run a stage that produces a file.
    fn produce(
        &self,
        spec: &CommandSpec,
        bindings: Bindings<'_>,
        log_name: &str,
        deadline: Deadline,
    ) -> Result<PathBuf, CommandError> {
        let output = Self::output_path(spec, &bindings).ok_or_else(|| {
            CommandError::MissingOutput {
                program: spec.program.clone(),
                path: bindings.dir.to_path_buf(),
            }
        })?;
        let bindings = Bindings {
            output: Some(&output),
            ..bindings
        };
        self.run(spec, &bindings, log_name, deadline)?;

        if output.exists() {
            Ok(output)
        } else {
            Err(CommandError::MissingOutput {
                program: spec.program.clone(),
                path: output,
            })
        }
    }

    fn score_target(
        &self,
        bindings: Bindings<'_>,
        index: usize,
        deadline: Deadline,
    ) -> Result<f32, CommandError> {
        let stdout = self.run(&self.score, &bindings, &format!("score-{index}"), deadline)?;
        let text = fs::read_to_string(stdout)?;
        let line = text
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .unwrap_or_default();
        line.parse::<f32>().map_err(|_| CommandError::Parse {
            program: self.score.program.clone(),
            line: line.to_string(),
        })
    }
}

impl Pipeline for CommandPipeline {
    fn synthesize(
        &self,
        identity: &Identity,
        dir: &Path,
        deadline: Deadline,
    ) -> Result<PathBuf, StageFailure> {
        let bindings = Bindings::new(identity, dir);
        Ok(self.produce(&self.synthesize, bindings, "synthesize", deadline)?)
    }

    fn refine(
        &self,
        identity: &Identity,
        input: &Path,
        dir: &Path,
        deadline: Deadline,
    ) -> Result<PathBuf, StageFailure> {
        let bindings = Bindings {
            input: Some(input),
            ..Bindings::new(identity, dir)
        };
        Ok(self.produce(&self.refine, bindings, "refine", deadline)?)
    }

    fn score(
        &self,
        identity: &Identity,
        refined: &Path,
        dir: &Path,
        deadline: Deadline,
    ) -> Result<BTreeMap<String, f32>, StageFailure> {
        let scores = self
            .targets
            .par_iter()
            .enumerate()
            .map(|(index, target)| {
                let bindings = Bindings {
                    input: Some(refined),
                    target: Some(target.as_str()),
                    ..Bindings::new(identity, dir)
                };
                let score = self.score_target(bindings, index, deadline)?;
                Ok((target.clone(), score))
            })
            .collect::<Result<BTreeMap<_, _>, CommandError>>()?;
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::evaluation::{EvalError, Evaluator, Stage, StagedEvaluator};
    use std::time::Instant;

    fn sh(script: &str, output: Option<&str>) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            output: output.map(str::to_string),
        }
    }

    fn config(work_dir: &Path) -> CommandPipelineConfig {
        CommandPipelineConfig {
            work_dir: work_dir.to_path_buf(),
            synthesize: sh("echo {identity} > {output}", Some("{identity}.pdb")),
            refine: sh(
                "cat {input} > {output} && echo refined >> {output}",
                Some("topcluster.pdb"),
            ),
            score: sh("echo docking {target}; echo {target}", None),
            targets: vec!["-1.5".to_string(), "-4".to_string()],
            poll_interval_ms: 5,
        }
    }

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[test]
    fn test_expand_placeholders() {
        let identity = id("GAVL");
        let input = PathBuf::from("in.pdb");
        let bindings = Bindings {
            input: Some(&input),
            target: Some("rec"),
            ..Bindings::new(&identity, Path::new("/pool/GAVL"))
        };
        assert_eq!(
            bindings.expand("{identity}:{dir}:{input}:{output}:{target}"),
            "GAVL:/pool/GAVL:in.pdb::rec"
        );
    }

    #[test]
    fn test_full_pipeline_scores_every_target() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config(tmp.path());
        let evaluator =
            StagedEvaluator::new(&config.work_dir, CommandPipeline::new(&config)).unwrap();
        let a = id("GAVL");

        let eval = evaluator.evaluate(&a, Deadline::none()).unwrap();
        assert_eq!(eval.record.fitness, -4.0);
        assert_eq!(eval.record.sub_scores["-1.5"], -1.5);
        assert_eq!(eval.record.sub_scores.len(), 2);

        let refined = eval.artifact.latest.as_deref().unwrap();
        assert_eq!(fs::read_to_string(refined).unwrap(), "GAVL\nrefined\n");
        assert!(evaluator.identity_dir(&a).join("score-1.out").exists());
    }

    #[test]
    fn test_nonzero_exit_is_stage_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.refine = sh("echo broken >&2; exit 3", Some("topcluster.pdb"));
        let evaluator =
            StagedEvaluator::new(&config.work_dir, CommandPipeline::new(&config)).unwrap();
        let a = id("GAVL");

        match evaluator.evaluate(&a, Deadline::none()) {
            Err(EvalError::Stage(err)) => {
                assert_eq!(err.stage, Stage::Refine);
                assert!(err.cause.to_string().contains("exited"));
            }
            other => panic!("expected refine failure, got {other:?}"),
        }
        assert!(!evaluator.identity_dir(&a).exists());
    }

    #[test]
    fn test_missing_output_and_bad_score() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.synthesize = sh("true", Some("{identity}.pdb"));
        let evaluator =
            StagedEvaluator::new(&config.work_dir, CommandPipeline::new(&config)).unwrap();
        let err = evaluator.evaluate(&id("GAVL"), Deadline::none()).unwrap_err();
        assert!(err.to_string().contains("did not write"));

        let mut config = self::config(tmp.path());
        config.score = sh("echo not-a-number", None);
        let evaluator =
            StagedEvaluator::new(&config.work_dir, CommandPipeline::new(&config)).unwrap();
        match evaluator.evaluate(&id("GAVL"), Deadline::none()) {
            Err(EvalError::Stage(err)) => assert_eq!(err.stage, Stage::Score),
            other => panic!("expected score failure, got {other:?}"),
        }
    }

    #[test]
    fn test_child_killed_at_deadline() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = config(tmp.path());
        config.synthesize = sh("sleep 10", Some("{identity}.pdb"));
        let evaluator =
            StagedEvaluator::new(&config.work_dir, CommandPipeline::new(&config)).unwrap();

        let start = Instant::now();
        let result = evaluator.evaluate(&id("GAVL"), Deadline::after(Duration::from_millis(100)));
        assert!(start.elapsed() < Duration::from_secs(5));
        match result {
            Err(EvalError::Stage(err)) => {
                assert_eq!(err.stage, Stage::Synthesize);
                assert!(err.cause.to_string().contains("deadline"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
