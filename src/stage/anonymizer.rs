//! Anonymizers: in-place transforms of a derived dataset.
//!
//! The orchestrator never hands an anonymizer a dataset it received from
//! a previous stage. [`anonymize_derived`] copies the parent first, runs
//! the strategy on the copy and discards the copy on failure.

use std::sync::Arc;

use async_trait::async_trait;
use rand::RngExt;
use rand_distr::Normal;
use serde_yaml::Mapping;
use tracing::info;

use crate::cache::strip_operational;
use crate::dataset::{Dataset, DatasetStore, DeriveOptions, Lineage, MotionSequence, StageKind};
use crate::error::StageError;

use super::{ensure_mutable, random_nonce, ParamSet, StageContext};

/// Rewrites the datapoints of a dataset in place.
#[async_trait]
pub trait Anonymizer: Send + Sync {
    fn name(&self) -> &str;

    /// Validated parameters, defaults included.
    fn params(&self) -> &Mapping;

    /// Whether two runs with equal parameters may produce different output.
    fn is_randomized(&self) -> bool {
        false
    }

    async fn anonymize(
        &self,
        ctx: &StageContext,
        dataset: &Dataset,
        background: Option<&Dataset>,
    ) -> Result<(), StageError>;
}

/// Runs `anonymizer` on `dataset` and records the lineage.
///
/// # Errors
/// `Precondition` for original or softlinked datasets, before any file is
/// touched.
pub async fn apply_anonymizer(
    anonymizer: &dyn Anonymizer,
    ctx: &StageContext,
    dataset: &mut Dataset,
    background: Option<&Dataset>,
) -> Result<(), StageError> {
    ensure_mutable(dataset)?;
    info!(
        anonymizer = anonymizer.name(),
        dataset = dataset.name(),
        background = background.map(Dataset::name),
        datapoints = dataset.point_count(),
        "Running anonymization"
    );

    anonymizer.anonymize(ctx, dataset, background).await?;

    let random_tag = if anonymizer.is_randomized() {
        random_nonce()
    } else {
        0
    };
    let mut lineage = Lineage::new(
        StageKind::Anonymization,
        anonymizer.name(),
        strip_operational(anonymizer.params()),
    )
    .with_random_tag(random_tag);
    if let Some(background) = background {
        lineage = lineage.with_background(background.name());
    }
    dataset.meta_mut().lineage = Some(lineage);
    dataset.save_meta()?;
    info!(anonymizer = anonymizer.name(), dataset = dataset.name(), "Anonymization successful");
    Ok(())
}

/// Derives a copy of `parent` and anonymizes it.
pub async fn anonymize_derived(
    store: &DatasetStore,
    anonymizer: &dyn Anonymizer,
    ctx: &StageContext,
    parent: &Dataset,
    background: Option<&Dataset>,
    new_name: Option<&str>,
    cleanup: bool,
) -> Result<Dataset, StageError> {
    let mut options = DeriveOptions::new();
    if let Some(name) = new_name {
        options = options.named(name);
    }
    let mut dataset = store.derive(parent, &options)?;
    let guard = store.guard(&dataset, cleanup);
    apply_anonymizer(anonymizer, ctx, &mut dataset, background).await?;
    guard.commit();
    Ok(dataset)
}

/// Per-sequence transform shared by the motion anonymizers.
pub trait MotionTransform: Send + Sync + 'static {
    fn transform(&self, sequence: MotionSequence) -> Result<MotionSequence, StageError>;
}

/// Applies `transform` to every motion datapoint on the worker pool.
pub async fn transform_motion<T: MotionTransform>(
    ctx: &StageContext,
    dataset: &Dataset,
    transform: Arc<T>,
) -> Result<(), StageError> {
    let points = dataset.datapoints().values().cloned().collect();
    ctx.pool
        .for_each_blocking(points, move |point| {
            let sequence = point.load_motion()?;
            let transformed = transform.transform(sequence)?;
            point.save_motion(&transformed)?;
            Ok(())
        })
        .await
}

/// `noop`: leaves every datapoint unchanged.
#[derive(Debug, Clone)]
pub struct NoopAnonymizer {
    params: Mapping,
}

impl NoopAnonymizer {
    pub const NAME: &'static str = "noop";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        Ok(Self {
            params: raw.clone(),
        })
    }
}

#[async_trait]
impl Anonymizer for NoopAnonymizer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    async fn anonymize(
        &self,
        _ctx: &StageContext,
        _dataset: &Dataset,
        _background: Option<&Dataset>,
    ) -> Result<(), StageError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoiseDistribution {
    Normal,
    Laplace,
    Uniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoiseTarget {
    /// Noise on the channel values.
    Direct,
    /// Noise on frame-to-frame differences, re-integrated from frame 0.
    Indirect,
}

/// `noise_injection`: adds noise scaled by each channel's standard
/// deviation.
#[derive(Debug, Clone)]
pub struct NoiseInjectionAnonymizer {
    params: Mapping,
    distribution: NoiseDistribution,
    scaling: f64,
    target: NoiseTarget,
}

impl NoiseInjectionAnonymizer {
    pub const NAME: &'static str = "noise_injection";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("anonymization noise_injection", raw);
        let distribution = match params
            .one_of("distribution", &["normal", "laplace", "uniform"], "uniform")?
            .as_str()
        {
            "normal" => NoiseDistribution::Normal,
            "laplace" => NoiseDistribution::Laplace,
            _ => NoiseDistribution::Uniform,
        };
        let scaling = params.f64_or("scaling", 1.0)?;
        let target = match params
            .one_of("type", &["direct", "indirect"], "direct")?
            .as_str()
        {
            "indirect" => NoiseTarget::Indirect,
            _ => NoiseTarget::Direct,
        };
        Ok(Self {
            params: params.into_mapping(),
            distribution,
            scaling,
            target,
        })
    }

    fn noise(&self, count: usize) -> Result<Vec<f64>, StageError> {
        let mut rng = rand::rng();
        let samples = match self.distribution {
            NoiseDistribution::Uniform => (0..count).map(|_| rng.random::<f64>()).collect(),
            NoiseDistribution::Normal => {
                let normal = Normal::new(0.0, 1.0).map_err(|e| StageError::Failed {
                    stage: Self::NAME.to_string(),
                    message: e.to_string(),
                })?;
                (0..count).map(|_| rng.sample(normal)).collect()
            }
            NoiseDistribution::Laplace => (0..count)
                .map(|_| {
                    // Inverse CDF of the standard Laplace distribution.
                    let u = rng.random::<f64>() - 0.5;
                    -u.signum() * (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE).ln()
                })
                .collect(),
        };
        Ok(samples)
    }

    fn perturb(&self, frames: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, StageError> {
        let sequence = MotionSequence::new(frames.to_vec())?;
        let std = sequence.std_frame();
        let width = sequence.channel_count();
        let noise = self.noise(frames.len() * width)?;
        Ok(frames
            .iter()
            .enumerate()
            .map(|(i, frame)| {
                frame
                    .iter()
                    .enumerate()
                    .map(|(c, v)| v + noise[i * width + c] * std[c] * self.scaling)
                    .collect()
            })
            .collect())
    }
}

impl MotionTransform for NoiseInjectionAnonymizer {
    fn transform(&self, sequence: MotionSequence) -> Result<MotionSequence, StageError> {
        let frames = sequence.into_frames();
        let out = match self.target {
            NoiseTarget::Direct => self.perturb(&frames)?,
            NoiseTarget::Indirect => {
                if frames.len() < 2 {
                    return Ok(MotionSequence::new(frames)?);
                }
                let diffs: Vec<Vec<f64>> = frames
                    .windows(2)
                    .map(|w| w[1].iter().zip(&w[0]).map(|(b, a)| b - a).collect())
                    .collect();
                let noisy = self.perturb(&diffs)?;
                let mut out = Vec::with_capacity(frames.len());
                out.push(frames[0].clone());
                for diff in noisy {
                    let last = &out[out.len() - 1];
                    let next: Vec<f64> = last.iter().zip(&diff).map(|(v, d)| v + d).collect();
                    out.push(next);
                }
                out
            }
        };
        Ok(MotionSequence::new(out)?)
    }
}

#[async_trait]
impl Anonymizer for NoiseInjectionAnonymizer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn is_randomized(&self) -> bool {
        true
    }

    async fn anonymize(
        &self,
        ctx: &StageContext,
        dataset: &Dataset,
        _background: Option<&Dataset>,
    ) -> Result<(), StageError> {
        transform_motion(ctx, dataset, Arc::new(self.clone())).await
    }
}

/// `rolling_average`: moving average over `window_size` frames.
///
/// The output has `frames - window_size + 1` frames; sequences shorter
/// than the window collapse to their mean frame.
#[derive(Debug, Clone)]
pub struct RollingAverageAnonymizer {
    params: Mapping,
    window: usize,
}

impl RollingAverageAnonymizer {
    pub const NAME: &'static str = "rolling_average";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("anonymization rolling_average", raw);
        let window = params.u64_or("window_size", 2)? as usize;
        if window == 0 {
            return Err(StageError::InvalidParameter {
                stage: params.stage().to_string(),
                param: "window_size".to_string(),
                message: "must be positive".to_string(),
            });
        }
        Ok(Self {
            params: params.into_mapping(),
            window,
        })
    }
}

impl MotionTransform for RollingAverageAnonymizer {
    fn transform(&self, sequence: MotionSequence) -> Result<MotionSequence, StageError> {
        if sequence.is_empty() {
            return Ok(sequence);
        }
        if sequence.frame_count() < self.window {
            return Ok(MotionSequence::new(vec![sequence.mean_frame()])?);
        }
        let width = self.window as f64;
        let averaged = sequence
            .frames()
            .windows(self.window)
            .map(|window| {
                let mut sum = vec![0.0; sequence.channel_count()];
                for frame in window {
                    for (s, v) in sum.iter_mut().zip(frame) {
                        *s += v;
                    }
                }
                sum.into_iter().map(|s| s / width).collect()
            })
            .collect();
        Ok(MotionSequence::new(averaged)?)
    }
}

#[async_trait]
impl Anonymizer for RollingAverageAnonymizer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    async fn anonymize(
        &self,
        ctx: &StageContext,
        dataset: &Dataset,
        _background: Option<&Dataset>,
    ) -> Result<(), StageError> {
        transform_motion(ctx, dataset, Arc::new(self.clone())).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Coarsening {
    /// Keep every `factor`-th frame, linearly interpolating in between.
    Time { factor: usize },
    /// Round values to `decimals` places (negative rounds to tens, ...).
    Precision { decimals: i64 },
    /// Keep only the remainder modulo `modulus`.
    PrecisionInverted { modulus: f64 },
}

/// `coarsening`: reduces temporal or numeric resolution.
#[derive(Debug, Clone)]
pub struct CoarseningAnonymizer {
    params: Mapping,
    mode: Coarsening,
}

impl CoarseningAnonymizer {
    pub const NAME: &'static str = "coarsening";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("anonymization coarsening", raw);
        let kind = params.one_of(
            "coarsening_type",
            &["time", "precision", "precision_inverted"],
            "time",
        )?;
        let invalid = |param: &str, message: &str| StageError::InvalidParameter {
            stage: "anonymization coarsening".to_string(),
            param: param.to_string(),
            message: message.to_string(),
        };
        let mode = match kind.as_str() {
            "time" => {
                let factor = params.u64_or("coarsening_factor", 10)? as usize;
                if factor == 0 {
                    return Err(invalid("coarsening_factor", "must be positive"));
                }
                Coarsening::Time { factor }
            }
            "precision" => Coarsening::Precision {
                decimals: params.i64_or("coarsening_decimals", 0)?,
            },
            _ => {
                let modulus = params.i64_or("coarsening_decimals", 0)?;
                if modulus == 0 {
                    return Err(invalid("coarsening_decimals", "must be non-zero"));
                }
                Coarsening::PrecisionInverted {
                    modulus: modulus as f64,
                }
            }
        };
        Ok(Self {
            params: params.into_mapping(),
            mode,
        })
    }
}

impl MotionTransform for CoarseningAnonymizer {
    fn transform(&self, sequence: MotionSequence) -> Result<MotionSequence, StageError> {
        let mut frames = sequence.into_frames();
        match self.mode {
            Coarsening::Precision { decimals } => {
                let scale = 10f64.powi(decimals as i32);
                for v in frames.iter_mut().flatten() {
                    *v = (*v * scale).round() / scale;
                }
            }
            Coarsening::PrecisionInverted { modulus } => {
                for v in frames.iter_mut().flatten() {
                    *v = v.rem_euclid(modulus);
                }
            }
            Coarsening::Time { factor } => {
                let blocks = (frames.len() / factor).saturating_sub(1);
                for block in 0..blocks {
                    let start = frames[block * factor].clone();
                    let end = frames[(block + 1) * factor].clone();
                    for step in 1..factor {
                        let t = step as f64 / factor as f64;
                        frames[block * factor + step] = start
                            .iter()
                            .zip(&end)
                            .map(|(a, b)| a + (b - a) * t)
                            .collect();
                    }
                }
            }
        }
        Ok(MotionSequence::new(frames)?)
    }
}

#[async_trait]
impl Anonymizer for CoarseningAnonymizer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    async fn anonymize(
        &self,
        ctx: &StageContext,
        dataset: &Dataset,
        _background: Option<&Dataset>,
    ) -> Result<(), StageError> {
        transform_motion(ctx, dataset, Arc::new(self.clone())).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Modality;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn raw(text: &str) -> Mapping {
        serde_yaml::from_str(text).unwrap()
    }

    fn seq(frames: Vec<Vec<f64>>) -> MotionSequence {
        MotionSequence::new(frames).unwrap()
    }

    fn gait_store() -> (TempDir, DatasetStore, Dataset) {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::open_or_create(dir.path()).unwrap();
        let root = store.create_root("mocap", Modality::Gait, BTreeMap::new()).unwrap();
        for i in 0..3 {
            fs::write(
                root.folder().join(format!("p{}.walk.mocap", i)),
                "[[0.0, 1.0], [2.0, 3.0], [4.0, 5.0], [6.0, 7.0]]",
            )
            .unwrap();
        }
        let root = store.open("mocap").unwrap();
        (dir, store, root)
    }

    #[tokio::test]
    async fn test_precondition_blocks_original_before_touching_files() {
        let (_dir, _store, mut root) = gait_store();
        let before = root.content_digest().unwrap();
        let anonymizer = RollingAverageAnonymizer::from_params(&Mapping::new()).unwrap();

        let err = apply_anonymizer(&anonymizer, &StageContext::default(), &mut root, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
        assert_eq!(root.content_digest().unwrap(), before);
        assert!(root.meta().lineage.is_none());
    }

    #[tokio::test]
    async fn test_precondition_blocks_softlinked_view() {
        let (_dir, store, root) = gait_store();
        let mut view = store
            .derive(&root, &DeriveOptions::new().softlinked(true))
            .unwrap();
        let anonymizer = NoopAnonymizer::from_params(&Mapping::new()).unwrap();
        let err = apply_anonymizer(&anonymizer, &StageContext::default(), &mut view, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_anonymize_derived_records_lineage() {
        let (_dir, store, root) = gait_store();
        let before = root.content_digest().unwrap();
        let anonymizer =
            RollingAverageAnonymizer::from_params(&raw("window_size: 2\nopt:\n  verbose: true\n"))
                .unwrap();

        let anon = anonymize_derived(
            &store,
            &anonymizer,
            &StageContext::new(2, 10),
            &root,
            None,
            None,
            true,
        )
        .await
        .unwrap();

        let lineage = anon.meta().lineage.as_ref().unwrap();
        assert_eq!(lineage.stage_kind, StageKind::Anonymization);
        assert_eq!(lineage.stage_name, "rolling_average");
        assert!(!lineage.stage_params.contains_key("opt"));
        assert_eq!(lineage.random_tag, 0);

        let point = anon.point("p0.walk").unwrap();
        assert_eq!(point.load_motion().unwrap().frame_count(), 3);
        assert_eq!(store.open("mocap").unwrap().content_digest().unwrap(), before);
    }

    #[tokio::test]
    async fn test_failed_anonymization_removes_copy() {
        let (_dir, store, root) = gait_store();
        fs::write(root.folder().join("p9.walk.mocap"), "not json").unwrap();
        let root = store.open("mocap").unwrap();
        let anonymizer = CoarseningAnonymizer::from_params(&Mapping::new()).unwrap();

        let result = anonymize_derived(
            &store,
            &anonymizer,
            &StageContext::default(),
            &root,
            None,
            Some("broken"),
            true,
        )
        .await;
        assert!(result.is_err());
        assert!(!store.exists("broken"));
        assert!(!store.folder("broken").exists());
    }

    #[test]
    fn test_noise_injection_defaults_and_shape() {
        let anonymizer = NoiseInjectionAnonymizer::from_params(&Mapping::new()).unwrap();
        assert!(anonymizer.is_randomized());
        assert_eq!(
            anonymizer.params().get("distribution"),
            Some(&serde_yaml::Value::from("uniform"))
        );

        let input = seq(vec![vec![0.0, 1.0], vec![2.0, 1.0], vec![4.0, 1.0]]);
        for text in ["type: direct\ndistribution: normal\n", "type: indirect\ndistribution: laplace\n"] {
            let anonymizer = NoiseInjectionAnonymizer::from_params(&raw(text)).unwrap();
            let out = anonymizer.transform(input.clone()).unwrap();
            assert_eq!(out.frame_count(), 3);
            assert_eq!(out.channel_count(), 2);
            // Constant channel has zero deviation and stays put.
            assert!(out.frames().iter().all(|f| (f[1] - 1.0).abs() < 1e-12));
        }
        assert!(NoiseInjectionAnonymizer::from_params(&raw("type: sideways\n")).is_err());
    }

    #[test]
    fn test_rolling_average() {
        let anonymizer = RollingAverageAnonymizer::from_params(&raw("window_size: 2\n")).unwrap();
        let out = anonymizer
            .transform(seq(vec![vec![0.0], vec![2.0], vec![4.0]]))
            .unwrap();
        assert_eq!(out.frames(), &[vec![1.0], vec![3.0]]);

        let anonymizer = RollingAverageAnonymizer::from_params(&raw("window_size: 5\n")).unwrap();
        let out = anonymizer.transform(seq(vec![vec![0.0], vec![2.0]])).unwrap();
        assert_eq!(out.frames(), &[vec![1.0]]);
        assert!(RollingAverageAnonymizer::from_params(&raw("window_size: 0\n")).is_err());
    }

    #[test]
    fn test_coarsening_modes() {
        let time = CoarseningAnonymizer::from_params(&raw("coarsening_factor: 2\n")).unwrap();
        let out = time
            .transform(seq(vec![vec![0.0], vec![9.0], vec![2.0], vec![9.0], vec![4.0]]))
            .unwrap();
        assert_eq!(out.frames()[1], vec![1.0]);
        assert_eq!(out.frames()[3], vec![9.0]);
        assert_eq!(
            time.params().get("coarsening_type"),
            Some(&serde_yaml::Value::from("time"))
        );

        let precision = CoarseningAnonymizer::from_params(&raw(
            "coarsening_type: precision\ncoarsening_decimals: 1\n",
        ))
        .unwrap();
        let out = precision.transform(seq(vec![vec![1.26, -0.04]])).unwrap();
        assert!((out.frames()[0][0] - 1.3).abs() < 1e-12);
        assert!(out.frames()[0][1].abs() < 1e-12);
        assert!(!precision.params().contains_key("coarsening_factor"));

        assert!(CoarseningAnonymizer::from_params(&raw("coarsening_type: precision_inverted\n")).is_err());
    }
}
