//! evopool CLI - Run an evolutionary search from JSON configuration.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, warn};

use evopool::{
    compute::evaluation::{CommandPipeline, EvaluationCache, StagedEvaluator},
    compute::evolution::{DiagnosticsWriter, EvolutionEngine, SequenceGenome},
    schema::RunConfig,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <run.json>", args[0]);
        eprintln!();
        eprintln!("Run an evolutionary search described by a JSON configuration.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  run.json  Path to run configuration file");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        error!("Error reading config file {}: {e}", config_path.display());
        std::process::exit(1);
    });

    let config: RunConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        error!("Error parsing config: {e}");
        std::process::exit(1);
    });

    if let Err(e) = config.validate() {
        error!("Invalid config: {e}");
        std::process::exit(1);
    }

    println!("evopool search");
    println!("==============");
    println!(
        "Population: {} x {} generations",
        config.evolution.population.size, config.evolution.population.generations
    );
    println!(
        "Operators: mutate_prob={}, copy_fraction={}",
        config.evolution.operators.mutate_prob, config.evolution.operators.copy_fraction
    );
    println!("Seeds: {}", config.seed_population.len());
    println!("Targets: {}", config.pipeline.targets.join(", "));
    println!("Work dir: {}", config.pipeline.work_dir.display());
    println!();

    let evaluator = StagedEvaluator::new(
        &config.pipeline.work_dir,
        CommandPipeline::new(&config.pipeline),
    )
    .unwrap_or_else(|e| {
        error!(
            "Cannot create work dir {}: {e}",
            config.pipeline.work_dir.display()
        );
        std::process::exit(1);
    });
    let cache = Arc::new(EvaluationCache::new(evaluator));
    let genome = SequenceGenome::new(&config.genome);

    let mut diagnostics = config.diagnostics_path.as_ref().and_then(|path| {
        DiagnosticsWriter::append_to(path)
            .inspect_err(|e| warn!("Diagnostics disabled, cannot open {}: {e}", path.display()))
            .ok()
    });

    let mut engine = EvolutionEngine::new(
        config.evolution,
        genome,
        Arc::clone(&cache),
        config.seed_population,
    )
    .unwrap_or_else(|e| {
        error!("Cannot start search: {e}");
        std::process::exit(1);
    });

    let mut reported = 0;
    let result = engine
        .run_with_callback(|progress| {
            let Some(latest) = &progress.latest else {
                return;
            };
            if progress.generation == reported {
                return;
            }
            reported = progress.generation;

            if let Some(writer) = diagnostics.as_mut()
                && let Err(e) = writer.record(latest)
            {
                warn!("Could not write diagnostics: {e}");
            }
            println!(
                "  Generation {}/{}: best={:.4}, mean={:.4}, diversity={}, cached={}",
                progress.generation,
                progress.total_generations,
                latest.best_fitness,
                latest.mean_fitness,
                latest.diversity,
                progress.cached_entries
            );
        })
        .unwrap_or_else(|e| {
            error!("Search aborted: {e}");
            std::process::exit(1);
        });

    println!();
    match &result.best {
        Some((sequence, record)) => {
            println!("Best: {sequence} fitness={:.4}", record.fitness);
            for (target, score) in &record.sub_scores {
                println!("  {target}: {score:.4}");
            }
        }
        None => println!("Best: none evaluated"),
    }
    println!(
        "Generations: {} ({:?})",
        result.stats.generations, result.stats.stop_reason
    );
    println!(
        "Fitness requests: {} ({} cached, {} evaluated)",
        result.stats.fitness_requests, result.stats.cache_hits, result.stats.cache_misses
    );
    println!("Time: {:.2}s", result.stats.elapsed_seconds);
    println!("Cache: {}", cache.describe());
}

fn print_example_config() {
    let config = RunConfig::default();

    println!("Example configuration (run.json):");
    match serde_json::to_string_pretty(&config) {
        Ok(json) => println!("{json}"),
        Err(e) => error!("Cannot render example config: {e}"),
    }
}
