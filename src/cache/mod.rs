//! Pipeline memoization cache.
//!
//! Before a stage runs, the orchestrator describes the dataset it is about
//! to produce as a [`RecipeQuery`]: the parent name(s), the stage kind and
//! name, its validated parameters and, for multi-output stages, the output
//! index. The cache scans every dataset metadata document in name order and
//! returns the first one that structurally contains the query.

use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};

use crate::dataset::{Dataset, DatasetStore, StageKind, PARENT_SEPARATOR};
use crate::error::DatasetError;
use crate::metadata::{self, Mismatch};

/// Parameter key holding operational settings that never affect output.
pub const OPERATIONAL_KEY: &str = "opt";

/// Returns `params` without the operational `opt` entry.
pub fn strip_operational(params: &Mapping) -> Mapping {
    let mut stripped = params.clone();
    stripped.remove(OPERATIONAL_KEY);
    stripped
}

/// Structural description of a dataset a stage would produce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecipeQuery {
    document: Mapping,
    lineage: Mapping,
}

impl RecipeQuery {
    /// Query for datasets derived from the given parent(s).
    pub fn derived_from<S: AsRef<str>>(parents: &[S]) -> Self {
        let joined = parents
            .iter()
            .map(|p| p.as_ref())
            .collect::<Vec<_>>()
            .join(&PARENT_SEPARATOR.to_string());
        let mut document = Mapping::new();
        document.insert(metadata::key("original"), Value::String(joined));
        Self {
            document,
            lineage: Mapping::new(),
        }
    }

    /// Requires the dataset to be the output of the given stage.
    ///
    /// Operational parameters are dropped, so they never cause a miss.
    pub fn stage(mut self, kind: StageKind, name: &str, params: &Mapping) -> Self {
        self.lineage
            .insert(metadata::key("stage-kind"), Value::from(kind.as_str()));
        self.lineage
            .insert(metadata::key("stage-name"), Value::from(name));
        self.lineage.insert(
            metadata::key("stage-params"),
            Value::Mapping(strip_operational(params)),
        );
        self
    }

    /// Requires the given output index.
    pub fn part(mut self, part: usize) -> Self {
        self.lineage
            .insert(metadata::key("part"), Value::from(part as u64));
        self
    }

    /// Requires the given random tag.
    pub fn random_tag(mut self, tag: u64) -> Self {
        self.lineage
            .insert(metadata::key("random-tag"), Value::from(tag));
        self
    }

    /// Requires the given background dataset.
    pub fn background(mut self, name: &str) -> Self {
        self.lineage
            .insert(metadata::key("background"), Value::from(name));
        self
    }

    /// Requires an arbitrary top-level key.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.document.insert(metadata::key(key), value.into());
        self
    }

    /// The query as a generic value.
    pub fn to_value(&self) -> Value {
        let mut document = self.document.clone();
        if !self.lineage.is_empty() {
            document.insert(
                metadata::key("lineage"),
                Value::Mapping(self.lineage.clone()),
            );
        }
        Value::Mapping(document)
    }
}

impl From<RecipeQuery> for Value {
    fn from(query: RecipeQuery) -> Self {
        query.to_value()
    }
}

/// Looks up already materialized stage outputs.
#[derive(Debug, Clone)]
pub struct PipelineCache {
    store: DatasetStore,
}

impl PipelineCache {
    pub fn new(store: DatasetStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &DatasetStore {
        &self.store
    }

    /// Returns the first dataset, in name order, whose metadata contains
    /// `query`. Fails if the data root is inconsistent.
    pub fn find_matching(&self, query: &Value) -> Result<Option<Dataset>, DatasetError> {
        let records = self.store.list_metadata()?;
        let mut hits = records
            .iter()
            .filter(|(_, document)| metadata::matches(document, query))
            .map(|(name, _)| name.as_str());

        let Some(first) = hits.next() else {
            debug!("Cache miss");
            return Ok(None);
        };
        let others: Vec<&str> = hits.collect();
        if !others.is_empty() {
            warn!(
                chosen = first,
                ambiguous = ?others,
                "Several datasets match the recipe, using the first by name"
            );
        }
        info!(dataset = first, "Cache hit");
        self.store.open(first).map(Some)
    }

    /// Convenience wrapper over [`PipelineCache::find_matching`].
    pub fn find(&self, query: &RecipeQuery) -> Result<Option<Dataset>, DatasetError> {
        self.find_matching(&query.to_value())
    }

    /// Explains why the dataset `name` does not satisfy `query`.
    ///
    /// Returns `None` when it matches.
    pub fn explain(&self, name: &str, query: &Value) -> Result<Option<Mismatch>, DatasetError> {
        if !self.store.exists(name) {
            return Err(DatasetError::NotFound(name.to_string()));
        }
        let document = metadata::load(&self.store.meta_path(name))?;
        Ok(metadata::explain(&Value::Mapping(document), query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DeriveOptions, Lineage, Modality};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn params(rate: f64, seed: u64) -> Mapping {
        let mut m = Mapping::new();
        m.insert("rate".into(), rate.into());
        m.insert("seed".into(), seed.into());
        m
    }

    fn store_with_split() -> (TempDir, PipelineCache) {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::open_or_create(dir.path()).unwrap();
        let root = store.create_root("faces", Modality::Face, BTreeMap::new()).unwrap();
        std::fs::write(root.folder().join("a.1.jpg"), "x").unwrap();

        let mut out = store.derive(&root, &DeriveOptions::new().named("split-0")).unwrap();
        out.meta_mut().lineage =
            Some(Lineage::new(StageKind::Splitter, "anonbg", params(0.5, 1)).with_part(0));
        out.save_meta().unwrap();
        (dir, PipelineCache::new(store))
    }

    #[test]
    fn test_identical_queries_hit_the_same_dataset() {
        let (_dir, cache) = store_with_split();
        let query = RecipeQuery::derived_from(&["faces"])
            .stage(StageKind::Splitter, "anonbg", &params(0.5, 1))
            .part(0);

        let first = cache.find(&query).unwrap().unwrap();
        let second = cache.find(&query).unwrap().unwrap();
        assert_eq!(first.name(), "split-0");
        assert_eq!(second.name(), first.name());
    }

    #[test]
    fn test_differing_parameter_misses() {
        let (_dir, cache) = store_with_split();
        let query = RecipeQuery::derived_from(&["faces"])
            .stage(StageKind::Splitter, "anonbg", &params(0.5, 2))
            .part(0);
        assert!(cache.find(&query).unwrap().is_none());

        let query = RecipeQuery::derived_from(&["faces"])
            .stage(StageKind::Splitter, "anonbg", &params(0.5, 1))
            .part(1);
        assert!(cache.find(&query).unwrap().is_none());
    }

    #[test]
    fn test_operational_parameters_are_ignored() {
        let (_dir, cache) = store_with_split();
        let mut with_opt = params(0.5, 1);
        let mut opt = Mapping::new();
        opt.insert("bin".into(), "/usr/bin/tool".into());
        with_opt.insert(OPERATIONAL_KEY.into(), Value::Mapping(opt));

        let query = RecipeQuery::derived_from(&["faces"])
            .stage(StageKind::Splitter, "anonbg", &with_opt)
            .part(0);
        assert!(cache.find(&query).unwrap().is_some());
    }

    #[test]
    fn test_explain_reports_key_path() {
        let (_dir, cache) = store_with_split();
        let query = RecipeQuery::derived_from(&["faces"])
            .stage(StageKind::Splitter, "anonbg", &params(0.7, 1))
            .to_value();

        let mismatch = cache.explain("split-0", &query).unwrap().unwrap();
        assert_eq!(mismatch.path, "lineage.stage-params.rate");
        assert!(cache.explain("missing", &query).is_err());
    }

    #[test]
    fn test_multi_parent_query() {
        let query = RecipeQuery::derived_from(&["clear", "anon"]).to_value();
        assert_eq!(query.get("original"), Some(&Value::from("clear|anon")));
    }
}
