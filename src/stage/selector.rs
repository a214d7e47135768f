//! Selectors: one dataset in, one softlinked subset out.

use rand::seq::SliceRandom;
use serde_yaml::{Mapping, Value};
use tracing::info;

use crate::cache::strip_operational;
use crate::dataset::{Dataset, DatasetStore, DeriveOptions, Lineage, StageKind};
use crate::error::StageError;
use crate::metadata::matcher::values_equal;

use super::{seeded_rng, ParamSet};

/// Chooses which identities and datapoints of a dataset to keep.
pub trait Selector: Send + Sync {
    fn name(&self) -> &str;

    /// Validated parameters, defaults included.
    fn params(&self) -> &Mapping;

    /// 0 for deterministic selectors, the seed for randomized ones.
    fn random_tag(&self) -> u64 {
        0
    }

    /// Hands over a training dataset before [`Selector::select`].
    fn set_training_set(&mut self, _train: &Dataset) {}

    fn select(&self, dataset: &Dataset) -> Result<DeriveOptions, StageError>;
}

/// Runs a selector on `parent` and tags the resulting view.
pub fn run_selector(
    store: &DatasetStore,
    selector: &dyn Selector,
    parent: &Dataset,
    cleanup: bool,
) -> Result<Dataset, StageError> {
    let selection = selector.select(parent)?.softlinked(true);
    let mut dataset = store.derive(parent, &selection)?;
    let guard = store.guard(&dataset, cleanup);

    dataset.meta_mut().lineage = Some(
        Lineage::new(
            StageKind::Selector,
            selector.name(),
            strip_operational(selector.params()),
        )
        .with_random_tag(selector.random_tag()),
    );
    dataset.save_meta()?;
    guard.commit();

    info!(
        selector = selector.name(),
        parent = parent.name(),
        dataset = dataset.name(),
        identities = dataset.identities().len(),
        datapoints = dataset.point_count(),
        "Selected dataset"
    );
    Ok(dataset)
}

/// `full`: the whole dataset.
#[derive(Debug, Clone)]
pub struct FullSelector {
    params: Mapping,
}

impl FullSelector {
    pub const NAME: &'static str = "full";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        Ok(Self {
            params: raw.clone(),
        })
    }
}

impl Selector for FullSelector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn select(&self, _dataset: &Dataset) -> Result<DeriveOptions, StageError> {
        Ok(DeriveOptions::new())
    }
}

/// `random`: `ids` random identities having at least `min_img_per_id`
/// datapoints, each cut to at most `max_img_per_id` random datapoints.
#[derive(Debug, Clone)]
pub struct RandomSelector {
    params: Mapping,
    ids: usize,
    min_points: Option<usize>,
    max_points: Option<usize>,
    seed: u64,
}

impl RandomSelector {
    pub const NAME: &'static str = "random";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("selector random", raw);
        let ids = params.require_u64("ids")? as usize;
        let min_points = params.optional_u64("min_img_per_id")?.map(|v| v as usize);
        let max_points = params.optional_u64("max_img_per_id")?.map(|v| v as usize);
        let seed = params.seed()?;
        Ok(Self {
            params: params.into_mapping(),
            ids,
            min_points,
            max_points,
            seed,
        })
    }
}

impl Selector for RandomSelector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn random_tag(&self) -> u64 {
        self.seed
    }

    fn select(&self, dataset: &Dataset) -> Result<DeriveOptions, StageError> {
        let mut rng = seeded_rng(self.seed);
        let mut ids: Vec<String> = dataset
            .identities()
            .values()
            .filter(|identity| {
                self.min_points
                    .map(|min| identity.point_count() >= min)
                    .unwrap_or(true)
            })
            .map(|identity| identity.name().to_string())
            .collect();
        ids.shuffle(&mut rng);
        ids.truncate(self.ids);

        let mut selection = DeriveOptions::new().identities(ids);
        if let Some(max) = self.max_points {
            let mut points = Vec::new();
            for (_, mut keys) in dataset.points_by_identity() {
                keys.shuffle(&mut rng);
                keys.truncate(max);
                points.extend(keys);
            }
            selection = selection.points(points);
        }
        Ok(selection)
    }
}

/// `mostpoints`: the `ids` identities with the most datapoints, after
/// skipping `offset`. Ties are broken randomly.
#[derive(Debug, Clone)]
pub struct MostpointsSelector {
    params: Mapping,
    ids: usize,
    offset: usize,
    seed: u64,
}

impl MostpointsSelector {
    pub const NAME: &'static str = "mostpoints";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("selector mostpoints", raw);
        let ids = params.require_u64("ids")? as usize;
        let offset = params.u64_or("offset", 0)? as usize;
        let seed = params.seed()?;
        Ok(Self {
            params: params.into_mapping(),
            ids,
            offset,
            seed,
        })
    }
}

impl Selector for MostpointsSelector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn random_tag(&self) -> u64 {
        self.seed
    }

    fn select(&self, dataset: &Dataset) -> Result<DeriveOptions, StageError> {
        let mut rng = seeded_rng(self.seed);
        let mut ranked: Vec<(String, usize)> = dataset
            .identities()
            .values()
            .map(|identity| (identity.name().to_string(), identity.point_count()))
            .collect();
        ranked.shuffle(&mut rng);
        // Stable sort keeps the shuffled order among equal counts.
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        let chosen = ranked
            .into_iter()
            .skip(self.offset)
            .take(self.ids)
            .map(|(name, _)| name);
        Ok(DeriveOptions::new().identities(chosen))
    }
}

/// `datapoint_type`: datapoints whose attributes take one of the listed
/// values, e.g. `selected_types: {pose: [frontal, profile]}`.
///
/// A datapoint is kept when any listed attribute matches.
#[derive(Debug, Clone)]
pub struct DatapointTypeSelector {
    params: Mapping,
    selected: Vec<(String, Vec<Value>)>,
}

impl DatapointTypeSelector {
    pub const NAME: &'static str = "datapoint_type";

    pub fn from_params(raw: &Mapping) -> Result<Self, StageError> {
        let mut params = ParamSet::new("selector datapoint_type", raw);
        let types = params.require_mapping("selected_types")?;
        let mut selected = Vec::with_capacity(types.len());
        for (attribute, values) in &types {
            let (Value::String(attribute), Value::Sequence(values)) = (attribute, values) else {
                return Err(StageError::InvalidParameter {
                    stage: params.stage().to_string(),
                    param: "selected_types".to_string(),
                    message: "expected a mapping of attribute names to value lists".to_string(),
                });
            };
            selected.push((attribute.clone(), values.clone()));
        }
        Ok(Self {
            params: params.into_mapping(),
            selected,
        })
    }
}

impl Selector for DatapointTypeSelector {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn params(&self) -> &Mapping {
        &self.params
    }

    fn select(&self, dataset: &Dataset) -> Result<DeriveOptions, StageError> {
        let mut keep = Vec::new();
        for point in dataset.datapoints().values() {
            for (attribute, values) in &self.selected {
                let Some(actual) = point.attribute(attribute)? else {
                    continue;
                };
                if values.iter().any(|v| values_equal(v, &actual)) {
                    keep.push(point.key());
                    break;
                }
            }
        }
        Ok(DeriveOptions::new().points(keep))
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

    /// Identity `idN` gets N + 1 datapoints.
    fn store_with_growing_identities(n: usize) -> (TempDir, DatasetStore, Dataset) {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::open_or_create(dir.path()).unwrap();
        let root = store.create_root("faces", Modality::Face, BTreeMap::new()).unwrap();
        for i in 0..n {
            for p in 0..=i {
                fs::write(root.folder().join(format!("id{}.{}.jpg", i, p)), "x").unwrap();
                let pose = if p % 2 == 0 { "frontal" } else { "profile" };
                fs::write(
                    root.folder().join(format!("id{}.{}.yaml", i, p)),
                    format!("---\npose: {}\n", pose),
                )
                .unwrap();
            }
        }
        let root = store.open("faces").unwrap();
        (dir, store, root)
    }

    #[test]
    fn test_full_selector_creates_tagged_view() {
        let (_dir, store, root) = store_with_growing_identities(3);
        let selector = FullSelector::from_params(&Mapping::new()).unwrap();
        let view = run_selector(&store, &selector, &root, true).unwrap();

        assert!(view.is_softlinked());
        assert_eq!(view.point_count(), root.point_count());
        let lineage = view.meta().lineage.as_ref().unwrap();
        assert_eq!(lineage.stage_kind, StageKind::Selector);
        assert_eq!(lineage.random_tag, 0);
    }

    #[test]
    fn test_random_selector_respects_bounds() {
        let (_dir, _store, root) = store_with_growing_identities(6);
        let selector = RandomSelector::from_params(&raw(
            "ids: 2\nmin_img_per_id: 3\nmax_img_per_id: 2\nseed: 9\n",
        ))
        .unwrap();
        assert_eq!(selector.random_tag(), 9);

        let selection = selector.select(&root).unwrap();
        let ids = selection.only_identities.clone().unwrap();
        assert_eq!(ids.len(), 2);
        for id in &ids {
            assert!(root.identity(id).unwrap().point_count() >= 3);
        }
        let points = selection.only_points.unwrap();
        let kept: Vec<&String> = points
            .iter()
            .filter(|k| ids.contains(k.split('.').next().unwrap()))
            .collect();
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn test_mostpoints_selector_orders_by_count() {
        let (_dir, _store, root) = store_with_growing_identities(5);
        let selector =
            MostpointsSelector::from_params(&raw("ids: 2\noffset: 1\nseed: 0\n")).unwrap();
        let ids = selector.select(&root).unwrap().only_identities.unwrap();
        let expected: std::collections::BTreeSet<String> =
            ["id3".to_string(), "id2".to_string()].into_iter().collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_datapoint_type_selector_reads_attributes() {
        let (_dir, _store, root) = store_with_growing_identities(3);
        let selector =
            DatapointTypeSelector::from_params(&raw("selected_types:\n  pose: [profile]\n"))
                .unwrap();
        let points = selector.select(&root).unwrap().only_points.unwrap();
        let expected: std::collections::BTreeSet<String> =
            ["id1.1".to_string(), "id2.1".to_string()].into_iter().collect();
        assert_eq!(points, expected);

        assert!(DatapointTypeSelector::from_params(&raw("selected_types: [a]\n")).is_err());
    }
}
