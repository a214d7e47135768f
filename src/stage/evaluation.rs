//! Evaluations: recognition or comparison of an enrollment and a test set.

use std::collections::BTreeMap;
use std::ops::Range;

use async_trait::async_trait;
use serde_yaml::Mapping;
use tracing::{debug, info};

use crate::dataset::{
    channel_range, Dataset, MotionSequence, POSITION_RANGE_KEY, ROTATION_RANGE_KEY,
};
use crate::error::StageError;
use crate::results::{PointResult, ResultSet};

use super::{ParamSet, StageContext};

/// How an evaluation relates its two input datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationKind {
    /// Enroll the first set, then rank enrolled identities for every
    /// datapoint of the second.
    Classification,
    /// Compare each datapoint of the first set with the datapoint of the
    /// same key in the second.
    Comparison,
}

impl EvaluationKind {
    /// Metrics computed when the evaluation does not name its own.
    pub fn default_metrics(self) -> &'static [&'static str] {
        match self {
            EvaluationKind::Classification => &["accuracy"],
            EvaluationKind::Comparison => &["distance"],
        }
    }
}

#[async_trait]
pub trait Evaluation: Send + Sync {
    fn name(&self) -> &str;

    fn params(&self) -> &Mapping;

    fn kind(&self) -> EvaluationKind;

    fn metrics(&self) -> Vec<String> {
        self.kind()
            .default_metrics()
            .iter()
            .map(|m| m.to_string())
            .collect()
    }

    async fn train(&mut self, _ctx: &StageContext, _train: &Dataset) -> Result<(), StageError> {
        Ok(())
    }

    /// Appends one result per evaluated datapoint to `results`.
    async fn evaluate(
        &mut self,
        ctx: &StageContext,
        enroll: &Dataset,
        test: &Dataset,
        results: &mut ResultSet,
    ) -> Result<(), StageError>;

    fn cleanup(&mut self) {}
}

fn failed(stage: &str, message: impl Into<String>) -> StageError {
    StageError::Failed {
        stage: stage.to_string(),
        message: message.into(),
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// `nearest_mean`: motion classifier over per-sequence statistics.
///
/// Each sequence becomes its per-channel mean and standard deviation.
/// Enrollment averages those features per identity; a probe is ranked
/// against every enrolled identity by euclidean distance.
pub struct NearestMean {
    params: Mapping,
    channels: Option<&'static str>,
    centroids: BTreeMap<String, Vec<f64>>,
}

impl NearestMean {
    pub const NAME: &'static str = "nearest_mean";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("evaluation nearest_mean", raw);
        let channels = match params
            .one_of("channels", &["all", "position", "rotation"], "all")?
            .as_str()
        {
            "position" => Some(POSITION_RANGE_KEY),
            "rotation" => Some(ROTATION_RANGE_KEY),
            _ => None,
        };
        Ok(Self {
            params: params.into_mapping(),
            channels,
            centroids: BTreeMap::new(),
        })
    }

    fn columns(&self, dataset: &Dataset) -> Result<Option<Range<usize>>, StageError> {
        match self.channels {
            None => Ok(None),
            Some(key) => channel_range(dataset.meta(), key).map(Some).ok_or_else(|| {
                failed(
                    Self::NAME,
                    format!("dataset '{}' has no '{}' metadata", dataset.name(), key),
                )
            }),
        }
    }

    /// Feature vectors of every datapoint, keyed by point key.
    async fn features(
        &self,
        ctx: &StageContext,
        dataset: &Dataset,
    ) -> Result<Vec<(String, String, Vec<f64>)>, StageError> {
        let columns = self.columns(dataset)?;
        let points = dataset.datapoints().values().cloned().collect();
        ctx.pool
            .map_blocking(points, move |point| {
                let mut sequence = point.load_motion()?;
                if let Some(range) = &columns {
                    sequence = sequence.columns(range.clone());
                }
                if sequence.is_empty() {
                    return Err(failed(
                        Self::NAME,
                        format!("'{}' has no frames", point.path().display()),
                    ));
                }
                let mut feature = sequence.mean_frame();
                feature.extend(sequence.std_frame());
                Ok((point.identity().to_string(), point.key(), feature))
            })
            .await
    }
}

#[async_trait]
impl Evaluation for NearestMean {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn kind(&self) -> EvaluationKind {
        EvaluationKind::Classification
    }

    async fn evaluate(
        &mut self,
        ctx: &StageContext,
        enroll: &Dataset,
        test: &Dataset,
        results: &mut ResultSet,
    ) -> Result<(), StageError> {
        let mut sums: BTreeMap<String, (Vec<f64>, usize)> = BTreeMap::new();
        for (identity, _, feature) in self.features(ctx, enroll).await? {
            let entry = sums
                .entry(identity)
                .or_insert_with(|| (vec![0.0; feature.len()], 0));
            for (s, v) in entry.0.iter_mut().zip(&feature) {
                *s += v;
            }
            entry.1 += 1;
        }
        self.centroids = sums
            .into_iter()
            .map(|(identity, (sum, n))| (identity, sum.into_iter().map(|s| s / n as f64).collect()))
            .collect();
        info!(
            enroll = enroll.name(),
            identities = self.centroids.len(),
            "Enrolled identities"
        );

        for (identity, key, feature) in self.features(ctx, test).await? {
            let mut result = PointResult::new(identity, key);
            for (candidate, centroid) in &self.centroids {
                result.add_candidate(candidate, euclidean(&feature, centroid));
            }
            results.append(result)?;
        }
        info!(test = test.name(), results = results.len(), "Classified test set");
        Ok(())
    }

    fn cleanup(&mut self) {
        self.centroids.clear();
    }
}

/// `time_series_distance`: compares a motion sequence with its modified
/// counterpart, channel by channel.
///
/// The distance is the euclidean norm of each channel's difference,
/// averaged over channels. Sequences must have identical shape.
pub struct TimeSeriesDistance {
    params: Mapping,
}

impl TimeSeriesDistance {
    pub const NAME: &'static str = "time_series_distance";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("evaluation time_series_distance", raw);
        params.one_of("metric", &["euclidean", "euclidian"], "euclidean")?;
        Ok(Self {
            params: params.into_mapping(),
        })
    }

    pub fn distance(old: &MotionSequence, new: &MotionSequence) -> Result<f64, StageError> {
        if old.frame_count() != new.frame_count() || old.channel_count() != new.channel_count() {
            return Err(failed(
                Self::NAME,
                format!(
                    "shapes differ: {}x{} vs {}x{}",
                    old.frame_count(),
                    old.channel_count(),
                    new.frame_count(),
                    new.channel_count()
                ),
            ));
        }
        let channels = old.channel_count();
        if channels == 0 {
            return Ok(0.0);
        }
        let mut squares = vec![0.0; channels];
        for (a, b) in old.frames().iter().zip(new.frames()) {
            for (c, sq) in squares.iter_mut().enumerate() {
                *sq += (a[c] - b[c]).powi(2);
            }
        }
        Ok(squares.into_iter().map(f64::sqrt).sum::<f64>() / channels as f64)
    }
}

#[async_trait]
impl Evaluation for TimeSeriesDistance {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn kind(&self) -> EvaluationKind {
        EvaluationKind::Comparison
    }

    async fn evaluate(
        &mut self,
        ctx: &StageContext,
        original: &Dataset,
        modified: &Dataset,
        results: &mut ResultSet,
    ) -> Result<(), StageError> {
        let mut pairs = Vec::with_capacity(original.point_count());
        for (key, point) in original.datapoints() {
            pairs.push((point.clone(), modified.point(key)?.clone()));
        }
        let compared = ctx
            .pool
            .map_blocking(pairs, |(old, new)| {
                let distance = Self::distance(&old.load_motion()?, &new.load_motion()?)?;
                Ok((old.identity().to_string(), old.key(), distance))
            })
            .await?;
        for (identity, key, distance) in compared {
            debug!(identity = %identity, point = %key, distance, "Compared datapoint");
            let mut result = PointResult::new(identity.clone(), key);
            result.add_candidate(identity, distance);
            results.append(result)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetStore, DeriveOptions, Modality};
    use crate::results::metrics;
    use serde_yaml::Value;
    use std::fs;
    use tempfile::TempDir;

    fn seq(frames: Vec<Vec<f64>>) -> MotionSequence {
        MotionSequence::new(frames).unwrap()
    }

    fn gait_root(store: &DatasetStore) -> Dataset {
        let attrs = std::collections::BTreeMap::from([(
            POSITION_RANGE_KEY.to_string(),
            Value::Sequence(vec![Value::from(0u64), Value::from(1u64)]),
        )]);
        let root = store.create_root("walks", Modality::Gait, attrs).unwrap();
        for (id, base) in [("ann", 0.0), ("bob", 10.0), ("cat", 20.0)] {
            for p in 0..3 {
                let offset = base + p as f64 * 0.1;
                fs::write(
                    root.folder().join(format!("{}.w{}.mocap", id, p)),
                    serde_json::to_string(&vec![vec![offset, 1.0], vec![offset + 1.0, 2.0]]).unwrap(),
                )
                .unwrap();
            }
        }
        store.open("walks").unwrap()
    }

    #[test]
    fn test_time_series_distance() {
        let a = seq(vec![vec![0.0, 0.0], vec![0.0, 0.0]]);
        let b = seq(vec![vec![3.0, 0.0], vec![4.0, 0.0]]);
        assert_eq!(TimeSeriesDistance::distance(&a, &b).unwrap(), 2.5);
        assert!(TimeSeriesDistance::distance(&a, &seq(vec![vec![0.0, 0.0]])).is_err());
        assert!(TimeSeriesDistance::from_params(
            &serde_yaml::from_str("metric: dtw\n").unwrap()
        )
        .is_err());
    }

    #[tokio::test]
    async fn test_nearest_mean_ranks_own_identity_first() {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::open_or_create(dir.path()).unwrap();
        let root = gait_root(&store);
        let enroll = store
            .derive(&root, &DeriveOptions::new().points(["ann.w0", "bob.w0", "cat.w0"]).softlinked(true))
            .unwrap();
        let test = store
            .derive(&root, &DeriveOptions::new().points(["ann.w2", "bob.w2", "cat.w2"]).softlinked(true))
            .unwrap();

        let mut eval = NearestMean::from_params(
            &serde_yaml::from_str("channels: position\n").unwrap(),
        )
        .unwrap();
        assert_eq!(eval.metrics(), vec!["accuracy"]);
        let mut results = ResultSet::in_memory();
        eval.evaluate(&StageContext::new(2, 10), &enroll, &test, &mut results)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.results().iter().all(|r| r.is_success()));
        let accuracy = metrics::accuracy(&results);
        assert_eq!(accuracy.get("top1rate").and_then(Value::as_f64), Some(1.0));
    }

    #[tokio::test]
    async fn test_comparison_requires_matching_points() {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::open_or_create(dir.path()).unwrap();
        let root = gait_root(&store);
        let copy = store.derive(&root, &DeriveOptions::new()).unwrap();
        let partial = store
            .derive(&root, &DeriveOptions::new().identities(["ann"]).softlinked(true))
            .unwrap();

        let mut eval = TimeSeriesDistance::from_params(&Mapping::new()).unwrap();
        let mut results = ResultSet::in_memory();
        eval.evaluate(&StageContext::default(), &root, &copy, &mut results)
            .await
            .unwrap();
        assert_eq!(results.len(), 9);
        assert!(results.results().iter().all(|r| r.candidates[0].distance == 0.0));

        let mut results = ResultSet::in_memory();
        assert!(eval
            .evaluate(&StageContext::default(), &root, &partial, &mut results)
            .await
            .is_err());
    }
}
