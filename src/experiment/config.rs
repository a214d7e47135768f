//! Run configuration files.
//!
//! A run file is a YAML list of entries, each repeated `repeat` times:
//!
//! ```yaml
//! - repeat: 3
//!   config:
//!     exp: anon
//!     dataset: faces
//!     anonbg_rate: 0.2
//!     anonymization: {name: noise_injection, params: {scaling: 0.5}}
//!     selector: {name: full, params: {}}
//!     splitter: {name: anon, params: {rate: 0.6, seed: $ROUND}}
//!     privacy: {name: nearest_mean, params: {}}
//! ```
//!
//! `$ROUND` anywhere in a config is replaced by the repetition index.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::PipelineError;

/// Placeholder replaced by the repetition index.
pub const ROUND_PLACEHOLDER: &str = "$ROUND";

fn one() -> u32 {
    1
}

/// One entry of a run file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    #[serde(default = "one")]
    pub repeat: u32,
    pub config: Value,
}

/// Reads a run file.
pub fn load_run_file(path: &Path) -> Result<Vec<RunEntry>, PipelineError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}

/// Replaces `$ROUND` in every string of `value`, mapping keys included.
///
/// A string that is exactly `$ROUND` becomes an integer, so it can stand
/// in for seeds.
pub fn substitute_round(value: &Value, round: u32) -> Value {
    match value {
        Value::String(s) if s == ROUND_PLACEHOLDER => Value::from(round),
        Value::String(s) if s.contains(ROUND_PLACEHOLDER) => {
            Value::String(s.replace(ROUND_PLACEHOLDER, &round.to_string()))
        }
        Value::Sequence(items) => {
            Value::Sequence(items.iter().map(|v| substitute_round(v, round)).collect())
        }
        Value::Mapping(map) => Value::Mapping(
            map.iter()
                .map(|(k, v)| (substitute_round(k, round), substitute_round(v, round)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Named stage topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    /// Anonymize, select, split and evaluate.
    Anon,
    /// As `Anon`, with a trained de-anonymization before the final split.
    Deanon,
    /// Select on the clear dataset first, then anonymize, split and evaluate.
    AnonClearselect,
}

impl FromStr for Topology {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anon" => Ok(Topology::Anon),
            "deanon" => Ok(Topology::Deanon),
            "anon_clearselect" => Ok(Topology::AnonClearselect),
            other => Err(PipelineError::UnknownTopology(other.to_string())),
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topology::Anon => "anon",
            Topology::Deanon => "deanon",
            Topology::AnonClearselect => "anon_clearselect",
        };
        f.write_str(name)
    }
}

/// A stage strategy and its raw parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub params: Mapping,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, params: Mapping) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Whether the terminal evaluation measures privacy or utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationRole {
    Privacy,
    Utility,
}

#[derive(Debug, Deserialize)]
struct RawExperiment {
    exp: String,
    dataset: String,
    #[serde(default)]
    cleanup: bool,
    #[serde(default)]
    anonbg_rate: f64,
    #[serde(default)]
    attacker_rate: Option<f64>,
    anonymization: Option<StageSpec>,
    selector: Option<StageSpec>,
    splitter: Option<StageSpec>,
    deanonymization: Option<StageSpec>,
    privacy: Option<StageSpec>,
    utility: Option<StageSpec>,
    train_set: Option<String>,
}

/// A validated experiment description.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub topology: Topology,
    pub dataset: String,
    pub cleanup: bool,
    /// Share of identities reserved as anonymization background.
    pub anonbg_rate: f64,
    /// Share of identities given to the attacker.
    pub attacker_rate: Option<f64>,
    pub anonymization: StageSpec,
    pub selector: StageSpec,
    pub splitter: StageSpec,
    pub deanonymization: Option<StageSpec>,
    pub evaluation: StageSpec,
    pub evaluation_role: EvaluationRole,
    /// Existing dataset to train the evaluation on.
    pub train_set: Option<String>,
}

fn rate_in_range(name: &str, rate: f64) -> Result<(), PipelineError> {
    if (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(format!(
            "{} {} is not in [0, 1]",
            name, rate
        )))
    }
}

impl ExperimentConfig {
    /// Validates a raw config value.
    ///
    /// A missing `selector` means `full`. `deanonymization` is required
    /// by the `deanon` topology only. Exactly one of `privacy` and
    /// `utility` names the evaluation.
    pub fn from_value(value: &Value) -> Result<Self, PipelineError> {
        let raw: RawExperiment = serde_yaml::from_value(value.clone())
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        let topology: Topology = raw.exp.parse()?;

        rate_in_range("anonbg_rate", raw.anonbg_rate)?;
        if let Some(rate) = raw.attacker_rate {
            rate_in_range("attacker_rate", rate)?;
            if raw.anonbg_rate + rate > 1.0 + 1e-9 {
                return Err(PipelineError::InvalidConfig(
                    "anonbg_rate and attacker_rate sum to more than 1".to_string(),
                ));
            }
        }

        let (evaluation, evaluation_role) = match (raw.privacy, raw.utility) {
            (Some(spec), None) => (spec, EvaluationRole::Privacy),
            (None, Some(spec)) => (spec, EvaluationRole::Utility),
            (Some(_), Some(_)) => {
                return Err(PipelineError::InvalidConfig(
                    "both 'privacy' and 'utility' are set".to_string(),
                ))
            }
            (None, None) => return Err(PipelineError::MissingSection("privacy".to_string())),
        };

        let deanonymization = match (topology, raw.deanonymization) {
            (Topology::Deanon, None) => {
                return Err(PipelineError::MissingSection("deanonymization".to_string()))
            }
            (Topology::Deanon, Some(spec)) => {
                if raw.attacker_rate.is_none() {
                    return Err(PipelineError::MissingSection("attacker_rate".to_string()));
                }
                Some(spec)
            }
            (_, spec) => spec,
        };

        Ok(Self {
            topology,
            dataset: raw.dataset,
            cleanup: raw.cleanup,
            anonbg_rate: raw.anonbg_rate,
            attacker_rate: raw.attacker_rate,
            anonymization: raw
                .anonymization
                .ok_or_else(|| PipelineError::MissingSection("anonymization".to_string()))?,
            selector: raw
                .selector
                .unwrap_or_else(|| StageSpec::new("full", Mapping::new())),
            splitter: raw
                .splitter
                .ok_or_else(|| PipelineError::MissingSection("splitter".to_string()))?,
            deanonymization,
            evaluation,
            evaluation_role,
            train_set: raw.train_set,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    const ANON: &str = "exp: anon\ndataset: faces\nanonymization: {name: noop}\nsplitter: {name: anon, params: {rate: 0.6, seed: 1}}\nprivacy: {name: nearest_mean}\n";

    #[test]
    fn test_round_substitution() {
        let value = yaml("seed: $ROUND\nname: run-$ROUND\nlist: [$ROUND, 2]\nother: 3\n");
        let out = substitute_round(&value, 4);
        assert_eq!(out["seed"], Value::from(4u32));
        assert_eq!(out["name"], Value::from("run-4"));
        assert_eq!(out["list"][0], Value::from(4u32));
        assert_eq!(out["other"], Value::from(3));
    }

    #[test]
    fn test_round_substitution_in_keys() {
        let value = yaml("names:\n  run-$ROUND: {seed: $ROUND}\n");
        let out = substitute_round(&value, 2);
        assert_eq!(out["names"]["run-2"]["seed"], Value::from(2u32));
        assert!(out["names"].get("run-$ROUND").is_none());
    }

    #[test]
    fn test_defaults() {
        let config = ExperimentConfig::from_value(&yaml(ANON)).unwrap();
        assert_eq!(config.topology, Topology::Anon);
        assert!(!config.cleanup);
        assert_eq!(config.anonbg_rate, 0.0);
        assert_eq!(config.selector.name, "full");
        assert!(config.anonymization.params.is_empty());
        assert_eq!(config.evaluation_role, EvaluationRole::Privacy);
    }

    #[test]
    fn test_invalid_configs() {
        let unknown = ANON.replace("exp: anon", "exp: sideways");
        assert!(matches!(
            ExperimentConfig::from_value(&yaml(&unknown)),
            Err(PipelineError::UnknownTopology(_))
        ));

        let deanon = ANON.replace("exp: anon", "exp: deanon");
        assert!(matches!(
            ExperimentConfig::from_value(&yaml(&deanon)),
            Err(PipelineError::MissingSection(s)) if s == "deanonymization"
        ));

        let no_eval = ANON.replace("privacy: {name: nearest_mean}\n", "");
        assert!(ExperimentConfig::from_value(&yaml(&no_eval))
            .unwrap_err()
            .is_configuration());

        let bad_rate = format!("{}anonbg_rate: 1.5\n", ANON);
        assert!(ExperimentConfig::from_value(&yaml(&bad_rate)).is_err());
    }

    #[test]
    fn test_load_run_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.yaml");
        std::fs::write(
            &path,
            format!("- repeat: 2\n  config:\n{}- config:\n{}", indent(ANON), indent(ANON)),
        )
        .unwrap();
        let entries = load_run_file(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].repeat, 2);
        assert_eq!(entries[1].repeat, 1);
    }

    fn indent(text: &str) -> String {
        text.lines().map(|l| format!("    {}\n", l)).collect()
    }
}
