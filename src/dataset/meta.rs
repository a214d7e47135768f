//! Dataset-level metadata documents.
//!
//! Each dataset has one `<name>.meta.yaml` document next to its directory.
//! Root datasets carry `original: true` plus whatever import-specific keys
//! they were created with (frame rate, marker layout, ...). Derived datasets
//! name their parent(s) in `original`, inherit the root document under
//! `original-metadata` and, once a stage ran on them, describe that stage
//! under `lineage`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// Separator between parent names of multi-input stages.
pub const PARENT_SEPARATOR: char = '|';

/// Biometric domain of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    /// Face images.
    Face,
    /// Motion-capture (gait) sequences.
    Gait,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Face => write!(f, "face"),
            Modality::Gait => write!(f, "gait"),
        }
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "face" => Ok(Modality::Face),
            "gait" | "motion" => Ok(Modality::Gait),
            other => Err(format!("unknown trait '{}': expected face or gait", other)),
        }
    }
}

/// Where a dataset comes from: a root import or one or more parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Origin {
    /// `original: true` marks ground-truth datasets.
    Root(bool),
    /// Parent dataset name(s), joined by `|`.
    Derived(String),
}

impl Origin {
    /// Origin pointing at the given parents.
    pub fn from_parents<S: AsRef<str>>(parents: &[S]) -> Self {
        let joined = parents
            .iter()
            .map(|p| p.as_ref())
            .collect::<Vec<_>>()
            .join(&PARENT_SEPARATOR.to_string());
        Origin::Derived(joined)
    }

    /// Parent dataset names, empty for roots.
    pub fn parents(&self) -> Vec<&str> {
        match self {
            Origin::Root(_) => Vec::new(),
            Origin::Derived(joined) => joined.split(PARENT_SEPARATOR).collect(),
        }
    }
}

/// Kind of pipeline stage that produced a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Anonymization,
    Deanonymization,
    Splitter,
    Selector,
}

impl StageKind {
    /// Whether stages of this kind rewrite datapoint files in place.
    pub fn is_mutating(self) -> bool {
        matches!(self, StageKind::Anonymization | StageKind::Deanonymization)
    }

    /// Name used in metadata documents and queries.
    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Anonymization => "anonymization",
            StageKind::Deanonymization => "deanonymization",
            StageKind::Splitter => "splitter",
            StageKind::Selector => "selector",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of the stage that produced a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Lineage {
    pub stage_kind: StageKind,
    pub stage_name: String,
    #[serde(default)]
    pub stage_params: Mapping,
    /// Output index for stages producing several sibling datasets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<usize>,
    /// 0 for deterministic stages, otherwise a seed or nonce.
    #[serde(default)]
    pub random_tag: u64,
    /// Background dataset an anonymizer was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
}

impl Lineage {
    /// Creates a lineage record for a deterministic stage.
    pub fn new(stage_kind: StageKind, stage_name: impl Into<String>, stage_params: Mapping) -> Self {
        Self {
            stage_kind,
            stage_name: stage_name.into(),
            stage_params,
            part: None,
            random_tag: 0,
            background: None,
        }
    }

    /// Sets the output index.
    pub fn with_part(mut self, part: usize) -> Self {
        self.part = Some(part);
        self
    }

    /// Sets the random tag.
    pub fn with_random_tag(mut self, tag: u64) -> Self {
        self.random_tag = tag;
        self
    }

    /// Sets the background dataset.
    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = Some(background.into());
        self
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Contents of a `<name>.meta.yaml` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatasetMeta {
    pub name: String,
    #[serde(rename = "trait")]
    pub modality: Modality,
    pub original: Origin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lineage: Option<Lineage>,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub original_metadata: Mapping,
    #[serde(default, skip_serializing_if = "is_false")]
    pub softlinked: bool,
    /// Import-specific and stage-specific keys preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DatasetMeta {
    /// Metadata for a new root dataset.
    pub fn root(name: impl Into<String>, modality: Modality) -> Self {
        Self {
            name: name.into(),
            modality,
            original: Origin::Root(true),
            lineage: None,
            original_metadata: Mapping::new(),
            softlinked: false,
            extra: BTreeMap::new(),
        }
    }

    /// Whether this is a ground-truth dataset.
    pub fn is_original(&self) -> bool {
        matches!(self.original, Origin::Root(true))
    }

    /// Parent dataset names, empty for roots.
    pub fn parents(&self) -> Vec<&str> {
        self.original.parents()
    }

    /// The metadata document of the root ancestor.
    ///
    /// Derived datasets already hold it under `original-metadata`; a root
    /// returns its own document.
    pub fn root_metadata(&self) -> Mapping {
        if !self.original_metadata.is_empty() {
            return self.original_metadata.clone();
        }
        match serde_yaml::to_value(self) {
            Ok(Value::Mapping(mapping)) => mapping,
            _ => Mapping::new(),
        }
    }

    /// Looks up a key of the root ancestor's metadata, e.g. `fps`.
    pub fn root_attribute(&self, key: &str) -> Option<Value> {
        if self.original_metadata.is_empty() {
            self.extra.get(key).cloned()
        } else {
            self.original_metadata.get(key).cloned()
        }
    }

    /// The document as a generic value, as seen by structural matching.
    pub fn to_value(&self) -> Value {
        serde_yaml::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_document_round_trip_keeps_extra_keys() {
        let text = "---\nname: mocap\ntrait: gait\noriginal: true\nfps: 120\nposition_range: [0, 63]\n";
        let meta: DatasetMeta = serde_yaml::from_str(text).unwrap();

        assert!(meta.is_original());
        assert_eq!(meta.modality, Modality::Gait);
        assert_eq!(meta.extra.get("fps"), Some(&Value::from(120)));
        assert_eq!(meta.root_attribute("fps"), Some(Value::from(120)));

        let written = serde_yaml::to_string(&meta).unwrap();
        assert!(written.contains("fps: 120"));
        assert!(!written.contains("lineage"));
        assert!(!written.contains("softlinked"));
    }

    #[test]
    fn test_derived_origin_lists_parents() {
        let origin = Origin::from_parents(&["clear", "anon-1"]);
        assert_eq!(origin, Origin::Derived("clear|anon-1".to_string()));
        assert_eq!(origin.parents(), vec!["clear", "anon-1"]);
        assert!(Origin::Root(true).parents().is_empty());
    }

    #[test]
    fn test_lineage_serializes_kebab_case() {
        let mut params = Mapping::new();
        params.insert("rate".into(), 0.6.into());
        let mut meta = DatasetMeta::root("x", Modality::Face);
        meta.original = Origin::Derived("faces".to_string());
        meta.lineage = Some(
            Lineage::new(StageKind::Splitter, "anon", params)
                .with_part(1)
                .with_random_tag(7),
        );

        let value = meta.to_value();
        let lineage = value.get("lineage").unwrap();
        assert_eq!(lineage.get("stage-kind"), Some(&Value::from("splitter")));
        assert_eq!(lineage.get("part"), Some(&Value::from(1)));
        assert_eq!(lineage.get("random-tag"), Some(&Value::from(7)));
    }

    #[test]
    fn test_root_metadata_of_derived_dataset_is_inherited() {
        let mut root = DatasetMeta::root("mocap", Modality::Gait);
        root.extra.insert("fps".to_string(), Value::from(60));

        let mut child = DatasetMeta::root("child", Modality::Gait);
        child.original = Origin::Derived("mocap".to_string());
        child.original_metadata = root.root_metadata();

        assert_eq!(child.root_attribute("fps"), Some(Value::from(60)));
        assert_eq!(
            child.root_metadata().get("name"),
            Some(&Value::from("mocap"))
        );
    }

    #[test]
    fn test_modality_parsing() {
        assert_eq!("Face".parse::<Modality>().unwrap(), Modality::Face);
        assert_eq!("gait".parse::<Modality>().unwrap(), Modality::Gait);
        assert!("voice".parse::<Modality>().is_err());
    }
}
