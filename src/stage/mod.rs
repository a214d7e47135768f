//! Stage contracts and built-in strategies.
//!
//! This module provides:
//! - Capability traits for splitters, selectors, anonymizers,
//!   de-anonymizers and evaluations
//! - Drivers that derive output datasets, run a strategy on them and tag
//!   them with lineage, rolling back on failure
//! - Parameter validation helpers shared by all strategies
//! - A bounded worker pool for per-datapoint work

pub mod anonymizer;
pub mod deanonymizer;
pub mod evaluation;
pub mod external;
pub mod selector;
pub mod splitter;
pub mod worker_pool;

pub use anonymizer::{anonymize_derived, apply_anonymizer, Anonymizer};
pub use deanonymizer::{deanonymize_derived, Deanonymizer};
pub use evaluation::{Evaluation, EvaluationKind};
pub use selector::{run_selector, Selector};
pub use splitter::{run_splitter, SplitOutput, Splitter};
pub use worker_pool::WorkerPool;

use rand::RngExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_yaml::{Mapping, Value};

use crate::cache::OPERATIONAL_KEY;
use crate::dataset::Dataset;
use crate::error::StageError;
use crate::metadata;

/// Default number of datapoints handed to an external tool at once.
pub const DEFAULT_BATCH_SIZE: usize = 2000;

/// Execution resources shared by the stages of one run.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub pool: WorkerPool,
    pub batch_size: usize,
}

impl StageContext {
    pub fn new(workers: usize, batch_size: usize) -> Self {
        Self {
            pool: WorkerPool::new(workers),
            batch_size: batch_size.max(1),
        }
    }
}

impl Default for StageContext {
    fn default() -> Self {
        Self::new(4, DEFAULT_BATCH_SIZE)
    }
}

/// Fails unless `dataset` may be rewritten in place.
///
/// Original datasets and softlinked views are read-only.
pub fn ensure_mutable(dataset: &Dataset) -> Result<(), StageError> {
    if dataset.is_original() {
        return Err(StageError::Precondition(format!(
            "dataset '{}' is original and cannot be modified",
            dataset.name()
        )));
    }
    if dataset.is_softlinked() {
        return Err(StageError::Precondition(format!(
            "dataset '{}' is a softlinked view and cannot be modified",
            dataset.name()
        )));
    }
    Ok(())
}

/// Seeded generator used by randomized splitters and selectors.
pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Non-zero tag for runs of non-reproducible randomized stages.
pub fn random_nonce() -> u64 {
    rand::rng().random::<u64>().max(1)
}

/// Validates a raw parameter mapping and fills in defaults.
///
/// Every accessor normalizes the value it reads back into the mapping, so
/// [`ParamSet::into_mapping`] yields exactly the parameters the strategy
/// runs with. That mapping is what lineage records and cache queries use.
#[derive(Debug, Clone)]
pub struct ParamSet {
    stage: String,
    values: Mapping,
}

impl ParamSet {
    pub fn new(stage: impl Into<String>, values: &Mapping) -> Self {
        Self {
            stage: stage.into(),
            values: values.clone(),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    fn missing(&self, key: &str) -> StageError {
        StageError::MissingParameter {
            stage: self.stage.clone(),
            param: key.to_string(),
        }
    }

    fn invalid(&self, key: &str, message: impl Into<String>) -> StageError {
        StageError::InvalidParameter {
            stage: self.stage.clone(),
            param: key.to_string(),
            message: message.into(),
        }
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(metadata::key(key), value);
    }

    fn read_f64(&self, key: &str, value: &Value) -> Result<f64, StageError> {
        match value {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| self.invalid(key, "not a finite number")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| self.invalid(key, format!("'{}' is not a number", s))),
            other => Err(self.invalid(key, format!("expected a number, got {:?}", other))),
        }
    }

    fn read_u64(&self, key: &str, value: &Value) -> Result<u64, StageError> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| self.invalid(key, "expected a non-negative integer")),
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| self.invalid(key, format!("'{}' is not an integer", s))),
            other => Err(self.invalid(key, format!("expected an integer, got {:?}", other))),
        }
    }

    /// Required number, stored back as a float.
    pub fn require_f64(&mut self, key: &str) -> Result<f64, StageError> {
        let value = self.get(key).cloned().ok_or_else(|| self.missing(key))?;
        let parsed = self.read_f64(key, &value)?;
        self.set(key, Value::from(parsed));
        Ok(parsed)
    }

    /// Number with a default.
    pub fn f64_or(&mut self, key: &str, default: f64) -> Result<f64, StageError> {
        if !self.contains(key) {
            self.set(key, Value::from(default));
        }
        self.require_f64(key)
    }

    /// Required rate in `[0, 1]`.
    pub fn rate(&mut self, key: &str) -> Result<f64, StageError> {
        let rate = self.require_f64(key)?;
        if !(0.0..=1.0).contains(&rate) {
            return Err(self.invalid(key, format!("{} is not in [0, 1]", rate)));
        }
        Ok(rate)
    }

    /// Required non-negative integer.
    pub fn require_u64(&mut self, key: &str) -> Result<u64, StageError> {
        let value = self.get(key).cloned().ok_or_else(|| self.missing(key))?;
        let parsed = self.read_u64(key, &value)?;
        self.set(key, Value::from(parsed));
        Ok(parsed)
    }

    /// Non-negative integer with a default.
    pub fn u64_or(&mut self, key: &str, default: u64) -> Result<u64, StageError> {
        if !self.contains(key) {
            self.set(key, Value::from(default));
        }
        self.require_u64(key)
    }

    /// Signed integer with a default.
    pub fn i64_or(&mut self, key: &str, default: i64) -> Result<i64, StageError> {
        let parsed = match self.get(key) {
            None => default,
            Some(Value::Number(n)) => n
                .as_i64()
                .ok_or_else(|| self.invalid(key, "expected an integer"))?,
            Some(Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map_err(|_| self.invalid(key, format!("'{}' is not an integer", s)))?,
            Some(other) => {
                return Err(self.invalid(key, format!("expected an integer, got {:?}", other)))
            }
        };
        self.set(key, Value::from(parsed));
        Ok(parsed)
    }

    /// Optional non-negative integer; absent keys stay absent.
    pub fn optional_u64(&mut self, key: &str) -> Result<Option<u64>, StageError> {
        if self.contains(key) {
            self.require_u64(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// The seed of a randomized strategy.
    pub fn seed(&mut self) -> Result<u64, StageError> {
        self.require_u64("seed")
    }

    /// Boolean with a default.
    pub fn bool_or(&mut self, key: &str, default: bool) -> Result<bool, StageError> {
        let parsed = match self.get(key) {
            None => default,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().map(|v| v != 0).unwrap_or(true),
            Some(Value::String(s)) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" => true,
                "false" | "no" | "0" => false,
                _ => return Err(self.invalid(key, format!("'{}' is not a boolean", s))),
            },
            Some(other) => {
                return Err(self.invalid(key, format!("expected a boolean, got {:?}", other)))
            }
        };
        self.set(key, Value::Bool(parsed));
        Ok(parsed)
    }

    /// Required string.
    pub fn require_string(&mut self, key: &str) -> Result<String, StageError> {
        match self.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {:?}", other))),
            None => Err(self.missing(key)),
        }
    }

    /// One of `allowed`, defaulting to `default`.
    pub fn one_of(&mut self, key: &str, allowed: &[&str], default: &str) -> Result<String, StageError> {
        if !self.contains(key) {
            self.set(key, Value::from(default));
        }
        let value = self.require_string(key)?;
        if !allowed.contains(&value.as_str()) {
            return Err(self.invalid(
                key,
                format!("'{}' is not one of {}", value, allowed.join(", ")),
            ));
        }
        Ok(value)
    }

    /// Optional list of strings; absent keys yield an empty list.
    ///
    /// A present list is stored back with every item as a string.
    pub fn string_list(&mut self, key: &str) -> Result<Vec<String>, StageError> {
        let parsed = match self.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::Sequence(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    Value::Bool(b) => Ok(b.to_string()),
                    other => Err(self.invalid(key, format!("unsupported list item {:?}", other))),
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(self.invalid(key, format!("expected a list, got {:?}", other)))
            }
        };
        self.set(
            key,
            Value::Sequence(parsed.iter().map(|s| Value::from(s.as_str())).collect()),
        );
        Ok(parsed)
    }

    /// Required list of numbers, stored back as floats.
    pub fn f64_list(&mut self, key: &str) -> Result<Vec<f64>, StageError> {
        let items = match self.get(key) {
            Some(Value::Sequence(items)) => items.clone(),
            Some(other) => {
                return Err(self.invalid(key, format!("expected a list, got {:?}", other)))
            }
            None => return Err(self.missing(key)),
        };
        let parsed = items
            .iter()
            .map(|v| self.read_f64(key, v))
            .collect::<Result<Vec<_>, _>>()?;
        self.set(
            key,
            Value::Sequence(parsed.iter().map(|v| Value::from(*v)).collect()),
        );
        Ok(parsed)
    }

    /// Required mapping.
    pub fn require_mapping(&mut self, key: &str) -> Result<Mapping, StageError> {
        match self.get(key) {
            Some(Value::Mapping(m)) => Ok(m.clone()),
            Some(other) => Err(self.invalid(key, format!("expected a mapping, got {:?}", other))),
            None => Err(self.missing(key)),
        }
    }

    /// Operational settings under `opt`, empty when absent.
    pub fn operational(&self) -> Mapping {
        match self.values.get(OPERATIONAL_KEY) {
            Some(Value::Mapping(m)) => m.clone(),
            _ => Mapping::new(),
        }
    }

    /// The validated parameters, including `opt`.
    pub fn into_mapping(self) -> Mapping {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DatasetStore, DeriveOptions, Modality};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn raw(text: &str) -> Mapping {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_param_set_fills_defaults_and_normalizes() {
        let mut params = ParamSet::new("splitter anon", &raw("rate: 1\nseed: '7'\n"));
        assert_eq!(params.rate("rate").unwrap(), 1.0);
        assert_eq!(params.seed().unwrap(), 7);
        assert!(!params.bool_or("enroll_anon", false).unwrap());

        let mapping = params.into_mapping();
        assert_eq!(mapping.get("rate"), Some(&Value::from(1.0)));
        assert_eq!(mapping.get("seed"), Some(&Value::from(7u64)));
        assert_eq!(mapping.get("enroll_anon"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_param_set_errors_are_configuration_errors() {
        let mut params = ParamSet::new("splitter anon", &raw("rate: 1.5\n"));
        assert!(params.rate("rate").unwrap_err().is_configuration());
        assert!(params.seed().unwrap_err().is_configuration());
        assert!(params
            .one_of("type", &["direct", "indirect"], "sideways")
            .unwrap_err()
            .is_configuration());
    }

    #[test]
    fn test_operational_settings() {
        let params = ParamSet::new("x", &raw("opt:\n  bin: /bin/true\n"));
        assert_eq!(
            params.operational().get("bin"),
            Some(&Value::from("/bin/true"))
        );
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        use rand::seq::SliceRandom;
        let mut a: Vec<u32> = (0..20).collect();
        let mut b = a.clone();
        a.shuffle(&mut seeded_rng(3));
        b.shuffle(&mut seeded_rng(3));
        assert_eq!(a, b);
        assert_ne!(random_nonce(), 0);
    }

    #[test]
    fn test_ensure_mutable() {
        let dir = TempDir::new().unwrap();
        let store = DatasetStore::open_or_create(dir.path()).unwrap();
        let root = store.create_root("faces", Modality::Face, BTreeMap::new()).unwrap();
        assert!(matches!(ensure_mutable(&root), Err(StageError::Precondition(_))));

        let view = store.derive(&root, &DeriveOptions::new().softlinked(true)).unwrap();
        assert!(matches!(ensure_mutable(&view), Err(StageError::Precondition(_))));

        let copy = store.derive(&root, &DeriveOptions::new()).unwrap();
        assert!(ensure_mutable(&copy).is_ok());
    }
}
