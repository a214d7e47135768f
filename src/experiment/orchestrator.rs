//! Experiment orchestrator.
//!
//! Runs one of the fixed stage topologies over a root dataset. Every
//! stage is first looked up in the pipeline cache; only misses are
//! computed. Stages run strictly one after another, and each one only
//! sees the datasets its predecessors resolved.

use std::collections::BTreeMap;
use std::time::Instant;

use serde_yaml::{Mapping, Value};
use tracing::{error, info, warn};

use crate::cache::{PipelineCache, RecipeQuery};
use crate::config::Settings;
use crate::dataset::{Dataset, DatasetStore, Modality, StageKind};
use crate::error::{PipelineError, StageError};
use crate::registry::StrategyRegistry;
use crate::results::{self, ResultSet, ResultsManager};
use crate::stage::splitter::{AnonbgSplitter, Interid1to3Splitter};
use crate::stage::{
    anonymize_derived, deanonymize_derived, run_selector, run_splitter, Anonymizer, Deanonymizer,
    Evaluation, Selector, Splitter, StageContext,
};

use super::config::{substitute_round, ExperimentConfig, RunEntry, StageSpec, Topology};
use super::state::RunTrace;

/// Seed of the partition split that carves background and attacker
/// identities off the root. Fixed so every run over a root shares them.
const PARTITION_SEED: u64 = 0;

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct ExperimentOutcome {
    pub result_id: String,
    /// Metrics of every metric name, merged flat.
    pub metrics: Mapping,
    /// Dataset names by role.
    pub datasets: BTreeMap<String, String>,
    pub trace: RunTrace,
}

/// One run of a batch.
#[derive(Debug)]
pub struct BatchRun {
    /// Index of the run file entry.
    pub entry: usize,
    pub round: u32,
    pub outcome: Result<ExperimentOutcome, PipelineError>,
}

/// Strategies of one run, built and validated before any stage runs.
struct Strategies {
    anonymizer: Box<dyn Anonymizer>,
    selector: Box<dyn Selector>,
    splitter: Box<dyn Splitter>,
    deanonymizer: Option<Box<dyn Deanonymizer>>,
    evaluation: Box<dyn Evaluation>,
}

/// Runs experiment configurations against a dataset store.
pub struct ExperimentRunner {
    store: DatasetStore,
    cache: PipelineCache,
    registry: StrategyRegistry,
    settings: Settings,
    ctx: StageContext,
    results: ResultsManager,
}

impl ExperimentRunner {
    /// Creates a runner with the built-in strategies.
    pub fn new(settings: Settings) -> Result<Self, PipelineError> {
        Self::with_registry(settings, StrategyRegistry::with_builtins())
    }

    pub fn with_registry(
        settings: Settings,
        registry: StrategyRegistry,
    ) -> Result<Self, PipelineError> {
        settings.validate()?;
        let store = DatasetStore::open_or_create(&settings.data_root)?;
        Ok(Self {
            cache: PipelineCache::new(store.clone()),
            store,
            registry,
            ctx: settings.stage_context(),
            results: ResultsManager::new(&settings.summary_path),
            settings,
        })
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn results(&self) -> &ResultsManager {
        &self.results
    }

    /// Runs every entry of a run file, `repeat` times each.
    ///
    /// A failed run is logged and the batch moves on.
    pub async fn run_batch(&self, entries: &[RunEntry]) -> Vec<BatchRun> {
        let mut runs = Vec::new();
        for (entry_index, entry) in entries.iter().enumerate() {
            for round in 0..entry.repeat {
                let config = substitute_round(&entry.config, round);
                let outcome = self.run(&config).await;
                match &outcome {
                    Ok(outcome) => info!(
                        entry = entry_index,
                        round,
                        result_id = %outcome.result_id,
                        "Run finished"
                    ),
                    Err(e) => error!(entry = entry_index, round, error = %e, "Run failed"),
                }
                runs.push(BatchRun {
                    entry: entry_index,
                    round,
                    outcome,
                });
            }
        }
        runs
    }

    /// Runs a single experiment configuration.
    ///
    /// # Errors
    /// Configuration errors are raised before any dataset is created. A
    /// failing stage aborts the run; its partial outputs are removed when
    /// cleanup is enabled.
    pub async fn run(&self, raw: &Value) -> Result<ExperimentOutcome, PipelineError> {
        let config = ExperimentConfig::from_value(raw)?;
        let root = self.store.open(&config.dataset)?;
        let modality = root.meta().modality;
        let mut strategies = self.build_strategies(&config, modality)?;
        let cleanup = config.cleanup || self.settings.cleanup;
        let started = Instant::now();

        info!(
            topology = %config.topology,
            dataset = root.name(),
            %modality,
            cleanup,
            "Starting experiment"
        );

        let mut trace = RunTrace::new();
        let mut roles = BTreeMap::new();
        roles.insert("original".to_string(), root.name().to_string());

        let (enroll, test, train) = match config.topology {
            Topology::Anon => {
                self.anon_topology(&config, &mut strategies, &root, &mut roles, &mut trace, cleanup)
                    .await?
            }
            Topology::Deanon => {
                self.deanon_topology(&config, &mut strategies, &root, &mut roles, &mut trace, cleanup)
                    .await?
            }
            Topology::AnonClearselect => {
                self.clearselect_topology(&config, &mut strategies, &root, &mut roles, &mut trace, cleanup)
                    .await?
            }
        };

        let train = match &config.train_set {
            Some(name) => Some(self.store.open(name)?),
            None => train,
        };
        if let Some(train) = &train {
            roles.insert("train".to_string(), train.name().to_string());
        }

        let (result_id, metrics) = self
            .evaluate(
                strategies.evaluation.as_mut(),
                raw,
                &roles,
                &enroll,
                &test,
                train.as_ref(),
                &mut trace,
            )
            .await?;

        info!(
            result_id = %result_id,
            cache_hits = trace.cache_hits(),
            computed = trace.computed(),
            duration_secs = started.elapsed().as_secs_f64(),
            "Experiment complete"
        );
        Ok(ExperimentOutcome {
            result_id,
            metrics,
            datasets: roles,
            trace,
        })
    }

    fn build_strategies(
        &self,
        config: &ExperimentConfig,
        modality: Modality,
    ) -> Result<Strategies, PipelineError> {
        let stage = |label: &str, e: StageError| PipelineError::stage(label, e);
        let spec: &StageSpec = &config.anonymization;
        let anonymizer = self
            .registry
            .anonymizer(&spec.name, modality, &spec.params)
            .map_err(|e| stage("anonymization", e))?;
        let selector = self
            .registry
            .selector(&config.selector.name, &config.selector.params)
            .map_err(|e| stage("selector", e))?;
        let splitter = self
            .registry
            .splitter(&config.splitter.name, &config.splitter.params)
            .map_err(|e| stage("splitter", e))?;
        if splitter.input_count() != 2 || splitter.output_count() < 2 {
            return Err(PipelineError::InvalidConfig(format!(
                "splitter '{}' maps {} to {} datasets, the final split needs 2 inputs and at least 2 outputs",
                splitter.name(),
                splitter.input_count(),
                splitter.output_count()
            )));
        }
        let deanonymizer = match &config.deanonymization {
            Some(spec) => Some(
                self.registry
                    .deanonymizer(&spec.name, modality, &spec.params)
                    .map_err(|e| stage("deanonymization", e))?,
            ),
            None => None,
        };
        let evaluation = self
            .registry
            .evaluation(&config.evaluation.name, modality, &config.evaluation.params)
            .map_err(|e| stage("evaluation", e))?;
        Ok(Strategies {
            anonymizer,
            selector,
            splitter,
            deanonymizer,
            evaluation,
        })
    }

    /// Background, attacker and evaluation partitions of `parent`.
    ///
    /// With an attacker rate the identities go three ways, otherwise a
    /// background rate above zero splits them two ways, and without
    /// either the parent is evaluated whole.
    fn partition(
        &self,
        config: &ExperimentConfig,
        parent: &Dataset,
        roles: &mut BTreeMap<String, String>,
        trace: &mut RunTrace,
        cleanup: bool,
    ) -> Result<(Option<Dataset>, Option<Dataset>, Dataset), PipelineError> {
        let mut params = Mapping::new();
        params.insert("seed".into(), Value::from(PARTITION_SEED));

        let (background, attacker, eval) = if let Some(attacker_rate) = config.attacker_rate {
            params.insert(
                "rates".into(),
                Value::Sequence(vec![config.anonbg_rate.into(), attacker_rate.into()]),
            );
            let splitter = Interid1to3Splitter::from_params(&params)
                .map_err(|e| PipelineError::stage("partition", e))?;
            let mut parts = self
                .resolve_split("partition", &splitter, std::slice::from_ref(parent), trace, cleanup)?
                .into_iter();
            match (parts.next(), parts.next(), parts.next()) {
                (Some(bg), Some(attacker), Some(eval)) => {
                    let bg = (config.anonbg_rate > 0.0).then_some(bg);
                    (bg, Some(attacker), eval)
                }
                _ => return Err(PipelineError::MissingRole("attacker".to_string())),
            }
        } else if config.anonbg_rate > 0.0 {
            params.insert("rate".into(), config.anonbg_rate.into());
            let splitter = AnonbgSplitter::from_params(&params)
                .map_err(|e| PipelineError::stage("partition", e))?;
            let mut parts = self
                .resolve_split("partition", &splitter, std::slice::from_ref(parent), trace, cleanup)?
                .into_iter();
            match (parts.next(), parts.next()) {
                (Some(bg), Some(eval)) => (Some(bg), None, eval),
                _ => return Err(PipelineError::MissingRole("background".to_string())),
            }
        } else {
            (None, None, parent.clone())
        };

        if let Some(bg) = &background {
            roles.insert("background".to_string(), bg.name().to_string());
        }
        if let Some(attacker) = &attacker {
            roles.insert("attacker".to_string(), attacker.name().to_string());
        }
        roles.insert("eval".to_string(), eval.name().to_string());
        Ok((background, attacker, eval))
    }

    /// anonymize(attacker), anonymize(eval), select, split(eval, selected).
    async fn anon_topology(
        &self,
        config: &ExperimentConfig,
        strategies: &mut Strategies,
        root: &Dataset,
        roles: &mut BTreeMap<String, String>,
        trace: &mut RunTrace,
        cleanup: bool,
    ) -> Result<(Dataset, Dataset, Option<Dataset>), PipelineError> {
        let (background, attacker, eval) = self.partition(config, root, roles, trace, cleanup)?;
        let anonymizer = strategies.anonymizer.as_ref();

        let anon_attacker = match &attacker {
            Some(attacker) => {
                let anon = self
                    .resolve_anonymization(anonymizer, attacker, background.as_ref(), trace, cleanup)
                    .await?;
                roles.insert("anon_attacker".to_string(), anon.name().to_string());
                Some(anon)
            }
            None => None,
        };

        let anon = self
            .resolve_anonymization(anonymizer, &eval, background.as_ref(), trace, cleanup)
            .await?;
        roles.insert("anon".to_string(), anon.name().to_string());

        if let Some(train) = &anon_attacker {
            strategies.selector.set_training_set(train);
        }
        let selected = self.resolve_selection(strategies.selector.as_ref(), &anon, trace, cleanup)?;
        roles.insert("select".to_string(), selected.name().to_string());

        let (enroll, test) =
            self.final_split(strategies.splitter.as_ref(), &eval, &selected, roles, trace, cleanup)?;
        Ok((enroll, test, anon_attacker))
    }

    /// As the anonymization topology, with a trained de-anonymization of
    /// the selected dataset before the final split.
    async fn deanon_topology(
        &self,
        config: &ExperimentConfig,
        strategies: &mut Strategies,
        root: &Dataset,
        roles: &mut BTreeMap<String, String>,
        trace: &mut RunTrace,
        cleanup: bool,
    ) -> Result<(Dataset, Dataset, Option<Dataset>), PipelineError> {
        let (background, attacker, eval) = self.partition(config, root, roles, trace, cleanup)?;
        let attacker = attacker.ok_or_else(|| PipelineError::MissingRole("attacker".to_string()))?;
        let anonymizer = strategies.anonymizer.as_ref();

        let anon_attacker = self
            .resolve_anonymization(anonymizer, &attacker, background.as_ref(), trace, cleanup)
            .await?;
        roles.insert("anon_attacker".to_string(), anon_attacker.name().to_string());
        let anon = self
            .resolve_anonymization(anonymizer, &eval, background.as_ref(), trace, cleanup)
            .await?;
        roles.insert("anon".to_string(), anon.name().to_string());

        strategies.selector.set_training_set(&anon_attacker);
        let selected = self.resolve_selection(strategies.selector.as_ref(), &anon, trace, cleanup)?;
        roles.insert("select".to_string(), selected.name().to_string());

        let deanonymizer = strategies
            .deanonymizer
            .as_mut()
            .ok_or_else(|| PipelineError::MissingSection("deanonymization".to_string()))?;
        let deanon = self
            .resolve_deanonymization(
                deanonymizer.as_mut(),
                &attacker,
                &anon_attacker,
                &selected,
                trace,
                cleanup,
            )
            .await?;
        roles.insert("deanon".to_string(), deanon.name().to_string());

        let (enroll, test) =
            self.final_split(strategies.splitter.as_ref(), &eval, &deanon, roles, trace, cleanup)?;
        Ok((enroll, test, Some(attacker)))
    }

    /// select(root), partition, anonymize(eval), split(eval, anon).
    async fn clearselect_topology(
        &self,
        config: &ExperimentConfig,
        strategies: &mut Strategies,
        root: &Dataset,
        roles: &mut BTreeMap<String, String>,
        trace: &mut RunTrace,
        cleanup: bool,
    ) -> Result<(Dataset, Dataset, Option<Dataset>), PipelineError> {
        let selected = self.resolve_selection(strategies.selector.as_ref(), root, trace, cleanup)?;
        roles.insert("select".to_string(), selected.name().to_string());

        let (background, attacker, eval) = self.partition(config, &selected, roles, trace, cleanup)?;
        let anonymizer = strategies.anonymizer.as_ref();
        let anon_attacker = match &attacker {
            Some(attacker) => {
                let anon = self
                    .resolve_anonymization(anonymizer, attacker, background.as_ref(), trace, cleanup)
                    .await?;
                roles.insert("anon_attacker".to_string(), anon.name().to_string());
                Some(anon)
            }
            None => None,
        };
        let anon = self
            .resolve_anonymization(anonymizer, &eval, background.as_ref(), trace, cleanup)
            .await?;
        roles.insert("anon".to_string(), anon.name().to_string());

        let (enroll, test) =
            self.final_split(strategies.splitter.as_ref(), &eval, &anon, roles, trace, cleanup)?;
        Ok((enroll, test, anon_attacker))
    }

    fn final_split(
        &self,
        splitter: &dyn Splitter,
        clear: &Dataset,
        processed: &Dataset,
        roles: &mut BTreeMap<String, String>,
        trace: &mut RunTrace,
        cleanup: bool,
    ) -> Result<(Dataset, Dataset), PipelineError> {
        let inputs = [clear.clone(), processed.clone()];
        let mut parts = self
            .resolve_split("splitter", splitter, &inputs, trace, cleanup)?
            .into_iter();
        let enroll = parts
            .next()
            .ok_or_else(|| PipelineError::MissingRole("enroll".to_string()))?;
        let test = parts
            .next()
            .ok_or_else(|| PipelineError::MissingRole("test".to_string()))?;
        roles.insert("enroll".to_string(), enroll.name().to_string());
        roles.insert("test".to_string(), test.name().to_string());
        for (index, extra) in parts.enumerate() {
            roles.insert(format!("part-{}", index + 2), extra.name().to_string());
        }
        Ok((enroll, test))
    }

    /// Returns the cached outputs of `splitter` on `inputs`, or computes
    /// them. Every part must hit for the cached outputs to be used.
    fn resolve_split(
        &self,
        label: &str,
        splitter: &dyn Splitter,
        inputs: &[Dataset],
        trace: &mut RunTrace,
        cleanup: bool,
    ) -> Result<Vec<Dataset>, PipelineError> {
        let index = trace.begin(label);
        let parents: Vec<&str> = inputs.iter().map(Dataset::name).collect();

        let mut cached = Vec::with_capacity(splitter.output_count());
        for part in 0..splitter.output_count() {
            let query = RecipeQuery::derived_from(&parents)
                .stage(StageKind::Splitter, splitter.name(), &splitter.part_params(part))
                .part(part);
            match self.cache.find(&query)? {
                Some(dataset) => cached.push(dataset),
                None => break,
            }
        }
        if cached.len() == splitter.output_count() {
            trace.resolved(index, names(&cached), true)?;
            return Ok(cached);
        }

        trace.computing(index)?;
        match run_splitter(&self.store, splitter, inputs, cleanup) {
            Ok(outputs) => {
                trace.resolved(index, names(&outputs), false)?;
                Ok(outputs)
            }
            Err(e) => Err(fail(trace, index, label, e)),
        }
    }

    fn resolve_selection(
        &self,
        selector: &dyn Selector,
        parent: &Dataset,
        trace: &mut RunTrace,
        cleanup: bool,
    ) -> Result<Dataset, PipelineError> {
        let index = trace.begin("selector");
        let query = RecipeQuery::derived_from(&[parent.name()])
            .stage(StageKind::Selector, selector.name(), selector.params())
            .random_tag(selector.random_tag());
        if let Some(dataset) = self.cache.find(&query)? {
            trace.resolved(index, vec![dataset.name().to_string()], true)?;
            return Ok(dataset);
        }

        trace.computing(index)?;
        match run_selector(&self.store, selector, parent, cleanup) {
            Ok(dataset) => {
                trace.resolved(index, vec![dataset.name().to_string()], false)?;
                Ok(dataset)
            }
            Err(e) => Err(fail(trace, index, "selector", e)),
        }
    }

    /// Randomized anonymizers are looked up without their random tag, so
    /// any earlier run with equal parameters is reused.
    async fn resolve_anonymization(
        &self,
        anonymizer: &dyn Anonymizer,
        parent: &Dataset,
        background: Option<&Dataset>,
        trace: &mut RunTrace,
        cleanup: bool,
    ) -> Result<Dataset, PipelineError> {
        let index = trace.begin("anonymization");
        let mut query = RecipeQuery::derived_from(&[parent.name()]).stage(
            StageKind::Anonymization,
            anonymizer.name(),
            anonymizer.params(),
        );
        if let Some(background) = background {
            query = query.background(background.name());
        }
        if !anonymizer.is_randomized() {
            query = query.random_tag(0);
        }
        if let Some(dataset) = self.cache.find(&query)? {
            trace.resolved(index, vec![dataset.name().to_string()], true)?;
            return Ok(dataset);
        }

        trace.computing(index)?;
        let result = anonymize_derived(
            &self.store,
            anonymizer,
            &self.ctx,
            parent,
            background,
            None,
            cleanup,
        )
        .await;
        match result {
            Ok(dataset) => {
                trace.resolved(index, vec![dataset.name().to_string()], false)?;
                Ok(dataset)
            }
            Err(e) => Err(fail(trace, index, "anonymization", e)),
        }
    }

    /// Training only happens on a cache miss.
    async fn resolve_deanonymization(
        &self,
        deanonymizer: &mut dyn Deanonymizer,
        clear: &Dataset,
        anonymized: &Dataset,
        parent: &Dataset,
        trace: &mut RunTrace,
        cleanup: bool,
    ) -> Result<Dataset, PipelineError> {
        let index = trace.begin("deanonymization");
        let query = RecipeQuery::derived_from(&[parent.name()]).stage(
            StageKind::Deanonymization,
            deanonymizer.name(),
            deanonymizer.params(),
        );
        if let Some(dataset) = self.cache.find(&query)? {
            trace.resolved(index, vec![dataset.name().to_string()], true)?;
            return Ok(dataset);
        }

        trace.computing(index)?;
        if let Err(e) = deanonymizer.train(&self.ctx, clear, anonymized).await {
            deanonymizer.cleanup();
            return Err(fail(trace, index, "deanonymization", e));
        }
        let result =
            deanonymize_derived(&self.store, &*deanonymizer, &self.ctx, parent, None, cleanup).await;
        deanonymizer.cleanup();
        match result {
            Ok(dataset) => {
                trace.resolved(index, vec![dataset.name().to_string()], false)?;
                Ok(dataset)
            }
            Err(e) => Err(fail(trace, index, "deanonymization", e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate(
        &self,
        evaluation: &mut dyn Evaluation,
        raw: &Value,
        roles: &BTreeMap<String, String>,
        enroll: &Dataset,
        test: &Dataset,
        train: Option<&Dataset>,
        trace: &mut RunTrace,
    ) -> Result<(String, Mapping), PipelineError> {
        let index = trace.begin("evaluation");
        trace.computing(index)?;

        let mut result_set = if self.settings.save_results {
            ResultSet::create(&self.settings.results_dir)?
        } else {
            ResultSet::in_memory()
        };
        result_set.save_context(raw.clone(), roles.clone())?;

        info!(
            evaluation = evaluation.name(),
            kind = ?evaluation.kind(),
            enroll = enroll.name(),
            test = test.name(),
            result_id = result_set.id(),
            "Running evaluation"
        );
        let mut outcome = Ok(());
        if let Some(train) = train {
            outcome = evaluation.train(&self.ctx, train).await;
        }
        if outcome.is_ok() {
            outcome = evaluation.evaluate(&self.ctx, enroll, test, &mut result_set).await;
        }
        evaluation.cleanup();
        if let Err(e) = outcome {
            return Err(fail(trace, index, "evaluation", e));
        }

        let mut metrics = Mapping::new();
        for name in evaluation.metrics() {
            let computed = match results::compute(&name, &result_set) {
                Ok(computed) => computed,
                Err(e) => return Err(fail(trace, index, "evaluation", e)),
            };
            for (key, value) in computed {
                if metrics.contains_key(&key) {
                    warn!(metric = %name, key = ?key, "Metric key already set, keeping the first value");
                    continue;
                }
                metrics.insert(key, value);
            }
        }

        self.results
            .append_summary(result_set.id(), metrics.clone(), raw.clone(), roles)?;
        trace.resolved(index, vec![result_set.id().to_string()], false)?;
        Ok((result_set.id().to_string(), metrics))
    }
}

fn names(datasets: &[Dataset]) -> Vec<String> {
    datasets.iter().map(|d| d.name().to_string()).collect()
}

/// Records a stage failure and wraps the error.
fn fail(trace: &mut RunTrace, index: usize, label: &str, e: impl Into<StageError>) -> PipelineError {
    let e = e.into();
    error!(stage = label, error = %e, "Stage failed");
    if let Err(transition) = trace.failed(index, e.to_string()) {
        warn!(error = %transition, "Could not record stage failure");
    }
    PipelineError::stage(label, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MotionSequence;
    use crate::metadata;
    use tempfile::TempDir;

    /// Gait root with `ids` identities of `points` sequences each. Each
    /// identity walks at its own offset, so nearest-mean can tell them
    /// apart.
    fn gait_runner(ids: usize, points: usize) -> (TempDir, ExperimentRunner) {
        let dir = TempDir::new().unwrap();
        let settings = Settings::new()
            .with_data_root(dir.path().join("data"))
            .with_results_dir(dir.path().join("results"))
            .with_summary_path(dir.path().join("results.yaml"))
            .with_workers(2);
        let runner = ExperimentRunner::new(settings).unwrap();

        let root = runner
            .store()
            .create_root("walks", Modality::Gait, BTreeMap::new())
            .unwrap();
        for id in 0..ids {
            for point in 0..points {
                let frames = (0..8)
                    .map(|t| vec![id as f64 * 10.0 + point as f64 * 0.1, t as f64 * 0.01])
                    .collect();
                let sequence = MotionSequence::new(frames).unwrap();
                sequence
                    .save(&root.folder().join(format!("p{}.w{}.mocap", id, point)))
                    .unwrap();
            }
        }
        (dir, runner)
    }

    fn config(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    const ANON_RUN: &str = "
exp: anon
dataset: walks
anonbg_rate: 0.2
anonymization: {name: rolling_average, params: {window_size: 2}}
splitter: {name: anon, params: {rate: 0.5, seed: 3}}
privacy: {name: nearest_mean}
";

    #[tokio::test]
    async fn test_anon_run_then_full_cache_reuse() {
        let (_dir, runner) = gait_runner(5, 4);

        let first = runner.run(&config(ANON_RUN)).await.unwrap();
        assert_eq!(first.trace.cache_hits(), 0);
        assert_eq!(first.trace.failures(), 0);
        assert!(first.metrics.contains_key(&metadata::key("hitrate")));
        for role in ["background", "eval", "anon", "select", "enroll", "test"] {
            assert!(first.datasets.contains_key(role), "missing role {}", role);
        }

        let second = runner.run(&config(ANON_RUN)).await.unwrap();
        // only the evaluation runs again
        assert_eq!(second.trace.computed(), 1);
        assert_eq!(second.trace.cache_hits(), first.trace.computed() - 1);
        assert_eq!(second.datasets.get("anon"), first.datasets.get("anon"));
        assert_eq!(second.datasets.get("test"), first.datasets.get("test"));
        assert_ne!(second.result_id, first.result_id);

        let summary = runner.results().load_all().unwrap();
        assert_eq!(summary.len(), 2);
    }

    #[tokio::test]
    async fn test_summary_is_written_without_result_files() {
        let (dir, runner) = gait_runner(5, 4);
        let settings = runner.settings().clone().with_save_results(false);
        let runner = ExperimentRunner::new(settings).unwrap();

        let outcome = runner.run(&config(ANON_RUN)).await.unwrap();
        let summary = runner.results().load_all().unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(
            runner.results().find_by_config(&config(ANON_RUN)).unwrap(),
            Some(outcome.result_id.clone())
        );
        assert!(!dir.path().join("results").exists());
    }

    #[tokio::test]
    async fn test_unknown_strategy_fails_before_any_dataset_is_created() {
        let (_dir, runner) = gait_runner(3, 2);
        let before = runner.store().list_names().unwrap();
        let run = ANON_RUN.replace("rolling_average", "does_not_exist");
        let err = runner.run(&config(&run)).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(runner.store().list_names().unwrap(), before);
    }

    #[tokio::test]
    async fn test_deanon_run() {
        let (_dir, runner) = gait_runner(6, 4);
        let run = "
exp: deanon
dataset: walks
anonbg_rate: 0.2
attacker_rate: 0.3
anonymization: {name: coarsening, params: {coarsening_type: precision, coarsening_decimals: 0}}
deanonymization: {name: noop}
splitter: {name: intraid2to2, params: {rate: 0.5, enroll_clear: true, seed: 1}}
privacy: {name: nearest_mean}
";
        let outcome = runner.run(&config(run)).await.unwrap();
        for role in ["attacker", "anon_attacker", "deanon", "train"] {
            assert!(outcome.datasets.contains_key(role), "missing role {}", role);
        }
        assert_eq!(outcome.datasets.get("train"), outcome.datasets.get("attacker"));
    }

    #[tokio::test]
    async fn test_batch_continues_past_failures_and_substitutes_rounds() {
        let (_dir, runner) = gait_runner(4, 4);
        let good = config(&ANON_RUN.replace("seed: 3", "seed: $ROUND"));
        let bad = config(&ANON_RUN.replace("dataset: walks", "dataset: missing"));
        let entries = vec![
            RunEntry { repeat: 1, config: bad },
            RunEntry { repeat: 2, config: good },
        ];

        let runs = runner.run_batch(&entries).await;
        assert_eq!(runs.len(), 3);
        assert!(runs[0].outcome.is_err());
        assert!(runs[1].outcome.is_ok());
        assert!(runs[2].outcome.is_ok());
        assert_eq!(runs[2].round, 1);

        let enroll = |run: &BatchRun| run.outcome.as_ref().unwrap().datasets["enroll"].clone();
        assert_ne!(enroll(&runs[1]), enroll(&runs[2]));
    }
}
