//! The results summary: one entry per evaluation run, keyed by result id.
//!
//! ```yaml
//! ---
//! 2024-05-01_12-00-00_1a2b3c4d:
//!   metrics: {accuracy: {...}}
//!   config: {...}
//!   datasets: {enroll: ..., test: ...}
//! ```
//!
//! Result ids start with a timestamp, so lookups scan ids in descending
//! order and return the newest matching run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::info;

use crate::error::ResultError;
use crate::metadata::{self, key, matcher::values_equal};

/// Default file name of the results summary.
pub const SUMMARY_FILE: &str = "results.yaml";

/// Reads and appends to the results summary.
#[derive(Debug, Clone)]
pub struct ResultsManager {
    path: PathBuf,
}

impl ResultsManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry; an absent summary is empty.
    pub fn load_all(&self) -> Result<Mapping, ResultError> {
        Ok(metadata::load(&self.path)?)
    }

    /// Entries ordered newest first.
    fn newest_first(&self) -> Result<Vec<(String, Value)>, ResultError> {
        let mut entries: Vec<(String, Value)> = self
            .load_all()?
            .into_iter()
            .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v)))
            .collect();
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries)
    }

    /// The entry recorded under `result_id`.
    pub fn get(&self, result_id: &str) -> Result<Option<Value>, ResultError> {
        Ok(self.load_all()?.get(result_id).cloned())
    }

    /// Newest run whose configuration equals `config`.
    pub fn find_by_config(&self, config: &Value) -> Result<Option<String>, ResultError> {
        Ok(self
            .newest_first()?
            .into_iter()
            .find(|(_, entry)| entry.get("config").is_some_and(|c| values_equal(c, config)))
            .map(|(id, _)| id))
    }

    /// Newest run that used a dataset called `dataset` in any role.
    pub fn find_by_used_dataset(&self, dataset: &str) -> Result<Option<String>, ResultError> {
        Ok(self
            .newest_first()?
            .into_iter()
            .find(|(_, entry)| {
                entry
                    .get("datasets")
                    .and_then(Value::as_mapping)
                    .is_some_and(|datasets| datasets.values().any(|v| v.as_str() == Some(dataset)))
            })
            .map(|(id, _)| id))
    }

    /// For each configuration, the newest matching run id (if any).
    pub fn find_all_by_configs(&self, configs: &[Value]) -> Result<Vec<Option<String>>, ResultError> {
        let entries = self.newest_first()?;
        Ok(configs
            .iter()
            .map(|config| {
                entries
                    .iter()
                    .find(|(_, entry)| {
                        entry.get("config").is_some_and(|c| values_equal(c, config))
                    })
                    .map(|(id, _)| id.clone())
            })
            .collect())
    }

    /// Records the metrics of a finished run.
    pub fn append_summary(
        &self,
        result_id: &str,
        metrics: Mapping,
        config: Value,
        datasets: &BTreeMap<String, String>,
    ) -> Result<(), ResultError> {
        let mut all = self.load_all()?;
        let mut entry = Mapping::new();
        entry.insert(key("metrics"), Value::Mapping(metrics));
        entry.insert(key("config"), config);
        entry.insert(
            key("datasets"),
            Value::Mapping(
                datasets
                    .iter()
                    .map(|(role, name)| (key(role), Value::from(name.as_str())))
                    .collect(),
            ),
        );
        all.insert(key(result_id), Value::Mapping(entry));
        metadata::save(&self.path, &all)?;
        info!(result_id, summary = %self.path.display(), "Recorded run summary");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    fn roles(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(r, n)| (r.to_string(), n.to_string())).collect()
    }

    #[test]
    fn test_lookup_returns_newest_match() {
        let dir = TempDir::new().unwrap();
        let manager = ResultsManager::new(dir.path().join(SUMMARY_FILE));
        let config = yaml("exp: anon\ndataset: faces\n");

        manager
            .append_summary("2024-01-01_00-00-00_aaaaaaaa", Mapping::new(), config.clone(), &roles(&[("test", "t1")]))
            .unwrap();
        manager
            .append_summary("2024-02-01_00-00-00_bbbbbbbb", Mapping::new(), config.clone(), &roles(&[("test", "t2")]))
            .unwrap();
        manager
            .append_summary("2024-03-01_00-00-00_cccccccc", Mapping::new(), yaml("exp: deanon\n"), &roles(&[("test", "t1")]))
            .unwrap();

        assert_eq!(
            manager.find_by_config(&yaml("dataset: faces\nexp: anon\n")).unwrap().as_deref(),
            Some("2024-02-01_00-00-00_bbbbbbbb")
        );
        assert_eq!(
            manager.find_by_used_dataset("t1").unwrap().as_deref(),
            Some("2024-03-01_00-00-00_cccccccc")
        );
        assert_eq!(
            manager
                .find_all_by_configs(&[yaml("exp: deanon\n"), yaml("exp: other\n")])
                .unwrap(),
            vec![Some("2024-03-01_00-00-00_cccccccc".to_string()), None]
        );
    }

    #[test]
    fn test_missing_summary_is_empty() {
        let dir = TempDir::new().unwrap();
        let manager = ResultsManager::new(dir.path().join(SUMMARY_FILE));
        assert!(manager.load_all().unwrap().is_empty());
        assert_eq!(manager.find_by_used_dataset("x").unwrap(), None);
    }
}
