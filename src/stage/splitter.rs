//! Splitters: N datasets in, M softlinked datasets out.
//!
//! A splitter only plans which datapoints of which input go into each
//! output. [`run_splitter`] materializes the plan as softlinked views,
//! tags every output with its `part` index and removes all outputs again
//! if anything fails midway.
//!
//! Partitions are complete and disjoint for every rate in `[0, 1]`: each
//! identity (or datapoint) of the partitioned set lands in exactly one
//! output.

use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde_yaml::Mapping;
use tracing::info;

use crate::cache::strip_operational;
use crate::dataset::{Dataset, DatasetStore, DeriveOptions, Lineage, Origin, StageKind};
use crate::error::StageError;
use crate::metadata;

use super::{seeded_rng, ParamSet};

/// One planned output: which input it is taken from and what it keeps.
#[derive(Debug, Clone)]
pub struct SplitOutput {
    pub source: usize,
    pub selection: DeriveOptions,
}

impl SplitOutput {
    pub fn new(source: usize, selection: DeriveOptions) -> Self {
        Self { source, selection }
    }
}

/// Partitions input datasets into sibling outputs.
pub trait Splitter: Send + Sync {
    fn name(&self) -> &str;

    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    /// Validated parameters, defaults included.
    fn params(&self) -> &Mapping;

    /// Parameters that influence output `part`.
    ///
    /// Outputs that do not depend on every parameter record less, so they
    /// can be reused by requests differing only in the others.
    fn part_params(&self, _part: usize) -> Mapping {
        strip_operational(self.params())
    }

    /// Plans the outputs for `inputs`.
    fn plan(&self, inputs: &[Dataset]) -> Result<Vec<SplitOutput>, StageError>;
}

/// Runs a splitter and tags its outputs.
///
/// # Errors
/// Arity mismatches, planning errors and store errors. Outputs created
/// before the failure are removed when `cleanup` is set.
pub fn run_splitter(
    store: &DatasetStore,
    splitter: &dyn Splitter,
    inputs: &[Dataset],
    cleanup: bool,
) -> Result<Vec<Dataset>, StageError> {
    if inputs.len() != splitter.input_count() {
        return Err(StageError::Arity {
            stage: format!("splitter {}", splitter.name()),
            direction: "input",
            expected: splitter.input_count(),
            actual: inputs.len(),
        });
    }

    let plan = splitter.plan(inputs)?;
    if plan.len() != splitter.output_count() {
        return Err(StageError::Arity {
            stage: format!("splitter {}", splitter.name()),
            direction: "output",
            expected: splitter.output_count(),
            actual: plan.len(),
        });
    }

    let parents: Vec<&str> = inputs.iter().map(Dataset::name).collect();
    let mut guards = Vec::with_capacity(plan.len());
    let mut outputs = Vec::with_capacity(plan.len());
    for (part, output) in plan.into_iter().enumerate() {
        let source = inputs.get(output.source).ok_or_else(|| StageError::Failed {
            stage: format!("splitter {}", splitter.name()),
            message: format!("output {} refers to missing input {}", part, output.source),
        })?;
        let mut dataset = store.derive(source, &output.selection.softlinked(true))?;
        guards.push(store.guard(&dataset, cleanup));

        let meta = dataset.meta_mut();
        meta.original = Origin::from_parents(&parents);
        meta.lineage = Some(
            Lineage::new(StageKind::Splitter, splitter.name(), splitter.part_params(part))
                .with_part(part),
        );
        dataset.save_meta()?;
        info!(
            splitter = splitter.name(),
            part,
            dataset = dataset.name(),
            datapoints = dataset.point_count(),
            "Created split output"
        );
        outputs.push(dataset);
    }

    for guard in guards {
        guard.commit();
    }
    Ok(outputs)
}

/// Size of the first partition of `n` items: `ceil(rate * n)`.
///
/// Products within rounding error of an integer are not rounded up, so
/// `0.6 * 5` yields 3, not 4.
pub fn split_point(rate: f64, n: usize) -> usize {
    let exact = rate * n as f64;
    let nearest = exact.round();
    let count = if (exact - nearest).abs() < 1e-9 {
        nearest
    } else {
        exact.ceil()
    };
    (count.max(0.0) as usize).min(n)
}

fn shuffled<T>(mut items: Vec<T>, rng: &mut ChaCha8Rng) -> Vec<T> {
    items.shuffle(rng);
    items
}

/// The input with fewer identities, the second one on ties.
fn smaller<'a>(clear: &'a Dataset, anon: &'a Dataset) -> &'a Dataset {
    if anon.identities().len() <= clear.identities().len() {
        anon
    } else {
        clear
    }
}

/// Splits the datapoints of every identity at `rate`.
fn split_each_identity(dataset: &Dataset, rate: f64, rng: &mut ChaCha8Rng) -> (Vec<String>, Vec<String>) {
    split_each_identity_of(dataset, None, rate, rng)
}

fn split_each_identity_of(
    dataset: &Dataset,
    only: Option<&[String]>,
    rate: f64,
    rng: &mut ChaCha8Rng,
) -> (Vec<String>, Vec<String>) {
    let mut first = Vec::new();
    let mut second = Vec::new();
    for (identity, points) in dataset.points_by_identity() {
        if let Some(only) = only {
            if !only.contains(&identity) {
                continue;
            }
        }
        let points = shuffled(points, rng);
        let cut = split_point(rate, points.len());
        first.extend_from_slice(&points[..cut]);
        second.extend_from_slice(&points[cut..]);
    }
    (first, second)
}

fn identity_view(source: usize, identities: &[String]) -> SplitOutput {
    SplitOutput::new(source, DeriveOptions::new().identities(identities.iter().cloned()))
}

fn point_view(source: usize, points: &[String]) -> SplitOutput {
    SplitOutput::new(source, DeriveOptions::new().points(points.iter().cloned()))
}

fn subset(params: &Mapping, keys: &[&str]) -> Mapping {
    let mut out = Mapping::new();
    for key in keys {
        if let Some(value) = params.get(*key) {
            out.insert(metadata::key(key), value.clone());
        }
    }
    out
}

/// `anonbg`: identities into (background, evaluation) at `rate`.
#[derive(Debug, Clone)]
pub struct AnonbgSplitter {
    params: Mapping,
    rate: f64,
    seed: u64,
}

impl AnonbgSplitter {
    pub const NAME: &'static str = "anonbg";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("splitter anonbg", raw);
        let rate = params.rate("rate")?;
        let seed = params.seed()?;
        Ok(Self {
            params: params.into_mapping(),
            rate,
            seed,
        })
    }
}

impl Splitter for AnonbgSplitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        2
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn plan(&self, inputs: &[Dataset]) -> Result<Vec<SplitOutput>, StageError> {
        let mut rng = seeded_rng(self.seed);
        let ids = shuffled(inputs[0].identity_names(), &mut rng);
        let cut = split_point(self.rate, ids.len());
        Ok(vec![identity_view(0, &ids[..cut]), identity_view(0, &ids[cut..])])
    }
}

/// `interid1to3`: identities into (background, attacker, evaluation).
#[derive(Debug, Clone)]
pub struct Interid1to3Splitter {
    params: Mapping,
    rates: [f64; 2],
    seed: u64,
}

impl Interid1to3Splitter {
    pub const NAME: &'static str = "interid1to3";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("splitter interid1to3", raw);
        let rates = params.f64_list("rates")?;
        let invalid = |message: &str| StageError::InvalidParameter {
            stage: "splitter interid1to3".to_string(),
            param: "rates".to_string(),
            message: message.to_string(),
        };
        if rates.len() != 2 {
            return Err(invalid("expected exactly two rates"));
        }
        if rates.iter().any(|r| *r < 0.0) || rates[0] + rates[1] > 1.0 + 1e-9 {
            return Err(invalid("rates must be non-negative and sum to at most 1"));
        }
        let seed = params.seed()?;
        Ok(Self {
            params: params.into_mapping(),
            rates: [rates[0], rates[1]],
            seed,
        })
    }
}

impl Splitter for Interid1to3Splitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        3
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn plan(&self, inputs: &[Dataset]) -> Result<Vec<SplitOutput>, StageError> {
        let mut rng = seeded_rng(self.seed);
        let ids = shuffled(inputs[0].identity_names(), &mut rng);
        let first = split_point(self.rates[0], ids.len());
        let second = (first + split_point(self.rates[1], ids.len())).min(ids.len());
        Ok(vec![
            identity_view(0, &ids[..first]),
            identity_view(0, &ids[first..second]),
            identity_view(0, &ids[second..]),
        ])
    }
}

/// `intraid2to2`: datapoints of each identity into (enroll, test).
///
/// Test is always anonymized; enroll is clear when `enroll_clear` is set.
/// With `rate: 1` both inputs are passed through restricted to common
/// identities, for point-by-point comparison.
#[derive(Debug, Clone)]
pub struct Intraid2to2Splitter {
    params: Mapping,
    rate: f64,
    enroll_clear: bool,
    seed: u64,
}

impl Intraid2to2Splitter {
    pub const NAME: &'static str = "intraid2to2";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("splitter intraid2to2", raw);
        let rate = params.rate("rate")?;
        let enroll_clear = params.bool_or("enroll_clear", false)?;
        let seed = params.seed()?;
        Ok(Self {
            params: params.into_mapping(),
            rate,
            enroll_clear,
            seed,
        })
    }
}

impl Splitter for Intraid2to2Splitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        2
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn plan(&self, inputs: &[Dataset]) -> Result<Vec<SplitOutput>, StageError> {
        let base = smaller(&inputs[0], &inputs[1]);
        if self.rate >= 1.0 {
            let ids = base.identity_names();
            return Ok(vec![identity_view(0, &ids), identity_view(1, &ids)]);
        }
        let mut rng = seeded_rng(self.seed);
        let (enroll, test) = split_each_identity(base, self.rate, &mut rng);
        let enroll_source = if self.enroll_clear { 0 } else { 1 };
        Ok(vec![point_view(enroll_source, &enroll), point_view(1, &test)])
    }
}

/// `anon`: datapoints of each identity into (enroll, test), each taken
/// from the clear or the anonymized input.
#[derive(Debug, Clone)]
pub struct AnonSplitter {
    params: Mapping,
    rate: f64,
    enroll_anon: bool,
    test_anon: bool,
    seed: u64,
}

impl AnonSplitter {
    pub const NAME: &'static str = "anon";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("splitter anon", raw);
        let rate = params.rate("rate")?;
        let enroll_anon = params.bool_or("enroll_anon", false)?;
        let test_anon = params.bool_or("test_anon", true)?;
        let seed = params.seed()?;
        Ok(Self {
            params: params.into_mapping(),
            rate,
            enroll_anon,
            test_anon,
            seed,
        })
    }
}

impl Splitter for AnonSplitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        2
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn plan(&self, inputs: &[Dataset]) -> Result<Vec<SplitOutput>, StageError> {
        let mut rng = seeded_rng(self.seed);
        let base = smaller(&inputs[0], &inputs[1]);
        let (enroll, test) = split_each_identity(base, self.rate, &mut rng);
        Ok(vec![
            point_view(usize::from(self.enroll_anon), &enroll),
            point_view(usize::from(self.test_anon), &test),
        ])
    }
}

/// `id`: whole identities into (enroll, test), so no identity is shared.
#[derive(Debug, Clone)]
pub struct IdSplitter {
    params: Mapping,
    rate: f64,
    enroll_anon: bool,
    test_anon: bool,
    seed: u64,
}

impl IdSplitter {
    pub const NAME: &'static str = "id";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("splitter id", raw);
        let rate = params.rate("rate")?;
        let enroll_anon = params.bool_or("enroll_anon", false)?;
        let test_anon = params.bool_or("test_anon", true)?;
        let seed = params.seed()?;
        Ok(Self {
            params: params.into_mapping(),
            rate,
            enroll_anon,
            test_anon,
            seed,
        })
    }
}

impl Splitter for IdSplitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        2
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn plan(&self, inputs: &[Dataset]) -> Result<Vec<SplitOutput>, StageError> {
        let mut rng = seeded_rng(self.seed);
        let base = smaller(&inputs[0], &inputs[1]);
        let grouped: Vec<Vec<String>> = base.points_by_identity().into_values().collect();
        let grouped = shuffled(grouped, &mut rng);
        let cut = split_point(self.rate, grouped.len());
        let enroll: Vec<String> = grouped[..cut].concat();
        let test: Vec<String> = grouped[cut..].concat();
        Ok(vec![
            point_view(usize::from(self.enroll_anon), &enroll),
            point_view(usize::from(self.test_anon), &test),
        ])
    }
}

/// `compare`: both inputs restricted to their common identities.
#[derive(Debug, Clone)]
pub struct CompareSplitter {
    params: Mapping,
}

impl CompareSplitter {
    pub const NAME: &'static str = "compare";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        Ok(Self {
            params: raw.clone(),
        })
    }
}

impl Splitter for CompareSplitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        2
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn plan(&self, inputs: &[Dataset]) -> Result<Vec<SplitOutput>, StageError> {
        let ids = smaller(&inputs[0], &inputs[1]).identity_names();
        Ok(vec![identity_view(0, &ids), identity_view(1, &ids)])
    }
}

/// `deanon`: outputs (enroll, test, clear train, anonymized train).
///
/// A `train_rate` share of identities goes to the de-anonymizer training
/// pair. The remaining identities are split per identity at
/// `enroll_rate`; enroll comes from the clear input unless `parrot` is
/// set, test always from the anonymized input.
#[derive(Debug, Clone)]
pub struct DeanonSplitter {
    params: Mapping,
    train_rate: f64,
    enroll_rate: Option<f64>,
    parrot: bool,
    seed: u64,
}

impl DeanonSplitter {
    pub const NAME: &'static str = "deanon";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("splitter deanon", raw);
        let train_rate = Self::train_rate(&mut params)?;
        let enroll_rate = params.rate("enroll_rate")?;
        if enroll_rate <= 0.0 || enroll_rate >= 1.0 {
            return Err(StageError::InvalidParameter {
                stage: params.stage().to_string(),
                param: "enroll_rate".to_string(),
                message: format!("{} is not in (0, 1)", enroll_rate),
            });
        }
        let parrot = params.bool_or("parrot", false)?;
        let seed = params.seed()?;
        Ok(Self {
            params: params.into_mapping(),
            train_rate,
            enroll_rate: Some(enroll_rate),
            parrot,
            seed,
        })
    }

    fn train_rate(params: &mut ParamSet) -> Result<f64, StageError> {
        let rate = params.rate("train_rate")?;
        if rate >= 1.0 {
            return Err(StageError::InvalidParameter {
                stage: params.stage().to_string(),
                param: "train_rate".to_string(),
                message: "must be below 1".to_string(),
            });
        }
        Ok(rate)
    }

    fn partition_ids(&self, clear: &Dataset, rng: &mut ChaCha8Rng) -> (Vec<String>, Vec<String>) {
        let ids = shuffled(clear.identity_names(), rng);
        let cut = split_point(self.train_rate, ids.len());
        (ids[..cut].to_vec(), ids[cut..].to_vec())
    }

    fn train_outputs(train_ids: &[String]) -> [SplitOutput; 2] {
        [identity_view(0, train_ids), identity_view(1, train_ids)]
    }
}

impl Splitter for DeanonSplitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        4
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn part_params(&self, part: usize) -> Mapping {
        match part {
            0 => strip_operational(&self.params),
            1 => subset(&self.params, &["train_rate", "seed", "enroll_rate"]),
            _ => subset(&self.params, &["train_rate", "seed"]),
        }
    }

    fn plan(&self, inputs: &[Dataset]) -> Result<Vec<SplitOutput>, StageError> {
        let clear = &inputs[0];
        let mut rng = seeded_rng(self.seed);
        let (train_ids, test_ids) = self.partition_ids(clear, &mut rng);
        let rate = self.enroll_rate.unwrap_or(0.0);
        let (enroll, test) =
            split_each_identity_of(clear, Some(test_ids.as_slice()), rate, &mut rng);

        let enroll_source = if self.parrot { 1 } else { 0 };
        let [clear_train, anon_train] = Self::train_outputs(&train_ids);
        Ok(vec![
            SplitOutput::new(
                enroll_source,
                DeriveOptions::new()
                    .identities(test_ids.iter().cloned())
                    .points(enroll),
            ),
            SplitOutput::new(
                1,
                DeriveOptions::new()
                    .identities(test_ids.iter().cloned())
                    .points(test),
            ),
            clear_train,
            anon_train,
        ])
    }
}

/// `deanon_compare`: like `deanon`, but the test identities are passed
/// through whole from both inputs for point-by-point comparison.
#[derive(Debug, Clone)]
pub struct DeanonCompareSplitter {
    inner: DeanonSplitter,
}

impl DeanonCompareSplitter {
    pub const NAME: &'static str = "deanon_compare";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("splitter deanon_compare", raw);
        let train_rate = DeanonSplitter::train_rate(&mut params)?;
        let seed = params.seed()?;
        Ok(Self {
            inner: DeanonSplitter {
                params: params.into_mapping(),
                train_rate,
                enroll_rate: None,
                parrot: false,
                seed,
            },
        })
    }
}

impl Splitter for DeanonCompareSplitter {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn input_count(&self) -> usize {
        2
    }

    fn output_count(&self) -> usize {
        4
    }

    fn params(&self) -> &Mapping {
        &self.inner.params
    }

    fn part_params(&self, part: usize) -> Mapping {
        match part {
            0 | 1 => strip_operational(&self.inner.params),
            _ => subset(&self.inner.params, &["train_rate", "seed"]),
        }
    }

    fn plan(&self, inputs: &[Dataset]) -> Result<Vec<SplitOutput>, StageError> {
        let mut rng = seeded_rng(self.inner.seed);
        let (train_ids, test_ids) = self.inner.partition_ids(&inputs[0], &mut rng);
        let [clear_train, anon_train] = DeanonSplitter::train_outputs(&train_ids);
        Ok(vec![
            identity_view(0, &test_ids),
            identity_view(1, &test_ids),
            clear_train,
            anon_train,
        ])
    }
}
