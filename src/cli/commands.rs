//! CLI command definitions for anonbench.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use clap::Parser;
use serde_yaml::{Mapping, Value};
use tracing::{info, warn};

use crate::cache::PipelineCache;
use crate::config::Settings;
use crate::dataset::{DatasetStore, DiffLevel, RetentionPolicy};
use crate::experiment::{load_run_file, ExperimentRunner, RunEntry};
use crate::registry::StrategyRegistry;
use crate::results::{self, ResultSet, SquashStrategy};
use crate::stage::{anonymize_derived, run_selector};

/// Biometric anonymization benchmark.
#[derive(Parser)]
#[command(name = "anonbench")]
#[command(about = "Run and cache biometric anonymization experiments")]
#[command(version)]
#[command(
    long_about = "anonbench derives, anonymizes, splits and evaluates biometric datasets.\n\nEvery stage output is a dataset recording its lineage, so repeated runs reuse earlier work.\n\nExample usage:\n  anonbench run experiments/noise.yaml --save-result"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Data root holding datasets and their metadata files.
    #[arg(long, global = true)]
    pub data_root: Option<PathBuf>,

    /// Number of concurrent workers per stage.
    #[arg(short = 'w', long, global = true)]
    pub workers: Option<usize>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run every experiment of a run file.
    Run(RunArgs),

    /// Anonymize a single dataset.
    #[command(alias = "anon")]
    Anonymize(AnonymizeArgs),

    /// Manage datasets in the data root.
    #[command(subcommand)]
    Dataset(DatasetCommand),

    /// Recompute a metric from a saved result file.
    RedoMetric(RedoMetricArgs),

    /// Inspect the pipeline cache.
    #[command(subcommand)]
    Cache(CacheCommand),
}

/// Arguments for `anonbench run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run file: a list of `{repeat, config}` entries, or a single config.
    pub config: PathBuf,

    /// Write per-datapoint result files. The summary is always appended.
    #[arg(long)]
    pub save_result: bool,

    /// Delete partial datasets when a stage fails.
    #[arg(long)]
    pub cleanup: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `anonbench anonymize`.
#[derive(Parser, Debug)]
pub struct AnonymizeArgs {
    /// Anonymization strategy name.
    pub method: String,

    /// Dataset to anonymize. It is copied first.
    pub dataset: String,

    /// Background dataset handed to the anonymizer.
    #[arg(short = 'b', long)]
    pub background: Option<String>,

    /// Name of the anonymized dataset.
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Strategy parameters as a JSON object.
    #[arg(short = 'p', long, default_value = "{}")]
    pub params: String,
}

/// Dataset subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum DatasetCommand {
    /// List datasets with their origin and lineage.
    List,

    /// Split a dataset into contiguous chunks of datapoints.
    Split {
        name: String,
        /// Number of parts.
        parts: usize,
    },

    /// Apply a selector to a dataset.
    Select {
        name: String,
        /// Selector strategy name.
        selector: String,
        /// Selector parameters as a JSON object.
        #[arg(short = 'p', long, default_value = "{}")]
        params: String,
    },

    /// Merge datasets of the same modality into a new dataset.
    Merge {
        #[arg(required = true, num_args = 2..)]
        names: Vec<String>,
        #[arg(short = 'o', long)]
        output: Option<String>,
    },

    /// Rename a dataset. Datasets derived from it keep the old name.
    Rename { old: String, new: String },

    /// Derive the part of `full` that is not in `part`.
    Diff {
        full: String,
        part: String,
        /// Compare whole identities instead of datapoints.
        #[arg(long)]
        identities: bool,
        #[arg(short = 'o', long)]
        output: Option<String>,
    },

    /// Turn a derived dataset into a new original dataset.
    Promote { name: String, new: String },

    /// Delete datasets not covered by the retention rules.
    Prune {
        /// Keep outputs of these anonymization or de-anonymization strategies.
        #[arg(short = 'k', long = "keep", value_delimiter = ',')]
        keep: Vec<String>,
        /// Keep datasets whose name contains one of these.
        #[arg(long = "keep-name", value_delimiter = ',')]
        keep_names: Vec<String>,
        /// Only print decisions.
        #[arg(long)]
        dry_run: bool,
    },
}

/// Arguments for `anonbench redo-metric`.
#[derive(Parser, Debug)]
pub struct RedoMetricArgs {
    /// Result file.
    pub file: PathBuf,

    /// Metric name.
    pub metric: String,

    /// Squash results per identity first (min or mean).
    #[arg(short = 's', long)]
    pub squash: Option<String>,
}

/// Cache subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum CacheCommand {
    /// Show why a dataset does or does not match a recipe query.
    Explain {
        dataset: String,
        /// YAML file holding the query document.
        query: PathBuf,
    },
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let settings = settings_for(&cli)?;
    match cli.command {
        Commands::Run(args) => run_experiments(settings, args).await,
        Commands::Anonymize(args) => run_anonymize(settings, args).await,
        Commands::Dataset(command) => run_dataset_command(&settings, command),
        Commands::RedoMetric(args) => run_redo_metric(args),
        Commands::Cache(command) => run_cache_command(&settings, command),
    }
}

fn settings_for(cli: &Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::from_env()?;
    if let Some(root) = &cli.data_root {
        settings = settings.with_data_root(root);
    }
    if let Some(workers) = cli.workers {
        settings = settings.with_workers(workers);
    }
    settings.validate()?;
    Ok(settings)
}

/// Parses a JSON object of strategy parameters.
fn parse_params(json: &str) -> anyhow::Result<Mapping> {
    serde_json::from_str(json)
        .map_err(|e| anyhow::anyhow!("Parameters must be a JSON object: {}", e))
}

/// Reads a run file holding either a list of entries or one config.
fn read_entries(path: &Path) -> anyhow::Result<Vec<RunEntry>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read run file {}: {}", path.display(), e))?;
    let value: Value = serde_yaml::from_str(&contents)?;
    if value.is_sequence() {
        Ok(load_run_file(path)?)
    } else {
        Ok(vec![RunEntry {
            repeat: 1,
            config: value,
        }])
    }
}

async fn run_experiments(settings: Settings, args: RunArgs) -> anyhow::Result<()> {
    let entries = read_entries(&args.config)?;
    let cleanup = settings.cleanup || args.cleanup;
    let save_results = settings.save_results || args.save_result;
    let settings = settings
        .with_save_results(save_results)
        .with_cleanup(cleanup);
    let runner = ExperimentRunner::new(settings)?;
    info!(entries = entries.len(), file = %args.config.display(), "Loaded run file");

    let runs = runner.run_batch(&entries).await;
    let failed = runs.iter().filter(|r| r.outcome.is_err()).count();

    if args.json {
        let mut summary = Vec::with_capacity(runs.len());
        for run in &runs {
            summary.push(match &run.outcome {
                Ok(outcome) => serde_json::json!({
                    "entry": run.entry,
                    "round": run.round,
                    "result_id": outcome.result_id,
                    "metrics": serde_json::to_value(&outcome.metrics)?,
                    "datasets": serde_json::to_value(&outcome.datasets)?,
                    "cache_hits": outcome.trace.cache_hits(),
                }),
                Err(e) => serde_json::json!({
                    "entry": run.entry,
                    "round": run.round,
                    "error": e.to_string(),
                }),
            });
        }
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for run in &runs {
            match &run.outcome {
                Ok(outcome) => {
                    println!(
                        "entry {} round {}: {} ({} cached stages)",
                        run.entry,
                        run.round,
                        outcome.result_id,
                        outcome.trace.cache_hits()
                    );
                    print!("{}", serde_yaml::to_string(&outcome.metrics)?);
                }
                Err(e) => println!("entry {} round {}: FAILED: {}", run.entry, run.round, e),
            }
        }
    }

    if failed > 0 {
        warn!(failed, total = runs.len(), "Some runs failed");
    }
    Ok(())
}

async fn run_anonymize(settings: Settings, args: AnonymizeArgs) -> anyhow::Result<()> {
    let store = DatasetStore::open_or_create(&settings.data_root)?;
    let registry = StrategyRegistry::with_builtins();
    let dataset = store.open(&args.dataset)?;
    let background = match &args.background {
        Some(name) => Some(store.open(name)?),
        None => None,
    };
    let params = parse_params(&args.params)?;
    let anonymizer = registry.anonymizer(&args.method, dataset.meta().modality, &params)?;

    let anonymized = anonymize_derived(
        &store,
        anonymizer.as_ref(),
        &settings.stage_context(),
        &dataset,
        background.as_ref(),
        args.output.as_deref(),
        true,
    )
    .await?;
    println!("{}", anonymized.name());
    Ok(())
}

fn run_dataset_command(settings: &Settings, command: DatasetCommand) -> anyhow::Result<()> {
    let store = DatasetStore::open_or_create(&settings.data_root)?;
    match command {
        DatasetCommand::List => {
            for (name, document) in store.list_metadata()? {
                let origin = document
                    .get("original")
                    .map(describe)
                    .unwrap_or_default();
                let stage = document
                    .get("lineage")
                    .and_then(|l| l.get("stage-name"))
                    .map(describe)
                    .unwrap_or_default();
                println!("{}\t{}\t{}", name, origin, stage);
            }
        }
        DatasetCommand::Split { name, parts } => {
            for part in store.split_into_parts(&name, parts)? {
                println!("{}", part.name());
            }
        }
        DatasetCommand::Select {
            name,
            selector,
            params,
        } => {
            let parent = store.open(&name)?;
            let registry = StrategyRegistry::with_builtins();
            let selector = registry.selector(&selector, &parse_params(&params)?)?;
            let selected = run_selector(&store, selector.as_ref(), &parent, true)?;
            println!("{}", selected.name());
        }
        DatasetCommand::Merge { names, output } => {
            let merged = store.merge(&names, output.as_deref())?;
            println!("{}", merged.name());
        }
        DatasetCommand::Rename { old, new } => {
            let renamed = store.rename(&old, &new)?;
            println!("{}", renamed.name());
        }
        DatasetCommand::Diff {
            full,
            part,
            identities,
            output,
        } => {
            let level = if identities {
                DiffLevel::Identity
            } else {
                DiffLevel::Point
            };
            let diff = store.difference(&full, &part, level, output.as_deref())?;
            println!("{}", diff.name());
        }
        DatasetCommand::Promote { name, new } => {
            let promoted = store.promote_to_original(&name, &new)?;
            println!("{}", promoted.name());
        }
        DatasetCommand::Prune {
            keep,
            keep_names,
            dry_run,
        } => {
            let policy = RetentionPolicy {
                keep_stage_names: keep.into_iter().collect::<BTreeSet<_>>(),
                keep_name_patterns: keep_names,
            };
            for decision in store.prune(&policy, dry_run)? {
                let action = if decision.keep { "keep" } else { "delete" };
                println!("{}\t{}\t{}", action, decision.name, decision.reason);
            }
        }
    }
    Ok(())
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn run_redo_metric(args: RedoMetricArgs) -> anyhow::Result<()> {
    let mut result_set = ResultSet::load(&args.file)?;
    if let Some(strategy) = &args.squash {
        let strategy: SquashStrategy = strategy.parse()?;
        result_set = result_set.to_squashed(strategy);
    }
    let metrics = results::compute(&args.metric, &result_set)?;

    let mut report = BTreeMap::new();
    report.insert(result_set.id().to_string(), Value::Mapping(metrics));
    print!("{}", serde_yaml::to_string(&report)?);
    Ok(())
}

fn run_cache_command(settings: &Settings, command: CacheCommand) -> anyhow::Result<()> {
    match command {
        CacheCommand::Explain { dataset, query } => {
            let contents = std::fs::read_to_string(&query)
                .map_err(|e| anyhow::anyhow!("Failed to read query {}: {}", query.display(), e))?;
            let query: Value = serde_yaml::from_str(&contents)?;
            let cache = PipelineCache::new(DatasetStore::open_or_create(&settings.data_root)?);
            match cache.explain(&dataset, &query)? {
                None => println!("{} matches", dataset),
                Some(mismatch) => println!("{} does not match: {}", dataset, mismatch),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from(["anonbench", "run", "exp.yaml", "--save-result"])
            .expect("should parse");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("exp.yaml"));
                assert!(args.save_result);
                assert!(!args.cleanup);
            }
            _ => panic!("Expected Run command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_anonymize_command_with_options() {
        let cli = Cli::try_parse_from([
            "anonbench",
            "anonymize",
            "noise_injection",
            "walks",
            "-b",
            "bg",
            "-o",
            "walks-noisy",
            "-p",
            r#"{"scaling": 0.5}"#,
        ])
        .expect("should parse");
        match cli.command {
            Commands::Anonymize(args) => {
                assert_eq!(args.method, "noise_injection");
                assert_eq!(args.background.as_deref(), Some("bg"));
                assert_eq!(args.output.as_deref(), Some("walks-noisy"));
                let params = parse_params(&args.params).unwrap();
                assert_eq!(params.get("scaling"), Some(&Value::from(0.5)));
            }
            _ => panic!("Expected Anonymize command"),
        }
    }

    #[test]
    fn test_dataset_subcommands() {
        let cli = Cli::try_parse_from(["anonbench", "dataset", "merge", "a", "b", "-o", "ab"])
            .expect("should parse");
        assert!(matches!(
            cli.command,
            Commands::Dataset(DatasetCommand::Merge { ref names, .. }) if names.len() == 2
        ));

        let cli = Cli::try_parse_from([
            "anonbench", "dataset", "prune", "--keep", "noop,external", "--dry-run",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Dataset(DatasetCommand::Prune { keep, dry_run, .. }) => {
                assert_eq!(keep, vec!["noop", "external"]);
                assert!(dry_run);
            }
            _ => panic!("Expected Prune command"),
        }

        assert!(Cli::try_parse_from(["anonbench", "dataset", "merge", "only-one"]).is_err());
    }

    #[test]
    fn test_params_must_be_an_object() {
        assert!(parse_params("[1, 2]").is_err());
        assert!(parse_params("{}").unwrap().is_empty());
    }

    #[test]
    fn test_single_config_run_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("single.yaml");
        std::fs::write(&path, "exp: anon\ndataset: faces\n").unwrap();
        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].repeat, 1);
    }
}
