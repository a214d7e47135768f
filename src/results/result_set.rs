//! Per-datapoint recognition results and their line-oriented file format.
//!
//! A result file holds two kinds of lines in any order:
//!
//! ```text
//! config,<json>
//! dataset,<role>:<name>,<role>:<name>,...
//! <identity>,<point>,<candidate>|<distance>,<candidate>|<distance>,...
//! ```

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Local;
use serde_yaml::Value;
use uuid::Uuid;

use crate::error::ResultError;

/// Suffix of result files; the file stem is the result id.
pub const RESULT_FILE_SUFFIX: &str = ".results.txt";

/// One candidate identity with its distance to the probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub distance: f64,
}

/// How repeated candidates of the same identity are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquashStrategy {
    Min,
    Mean,
}

impl FromStr for SquashStrategy {
    type Err = ResultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "min" => Ok(SquashStrategy::Min),
            "mean" => Ok(SquashStrategy::Mean),
            other => Err(ResultError::UnknownSquashStrategy(other.to_string())),
        }
    }
}

/// Ranked candidates for a single probe datapoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PointResult {
    pub identity: String,
    pub point_id: String,
    pub candidates: Vec<Candidate>,
}

impl PointResult {
    pub fn new(identity: impl Into<String>, point_id: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            point_id: point_id.into(),
            candidates: Vec::new(),
        }
    }

    pub fn add_candidate(&mut self, id: impl Into<String>, distance: f64) {
        self.candidates.push(Candidate {
            id: id.into(),
            distance,
        });
    }

    /// Candidates ordered by ascending distance.
    pub fn ranked(&self) -> Vec<&Candidate> {
        let mut ranked: Vec<&Candidate> = self.candidates.iter().collect();
        ranked.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        ranked
    }

    /// The closest candidate.
    pub fn best(&self) -> Option<&Candidate> {
        self.candidates
            .iter()
            .min_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal))
    }

    /// Whether the closest candidate is the probe's own identity.
    pub fn is_success(&self) -> bool {
        self.best().is_some_and(|c| c.id == self.identity)
    }

    /// Whether the probe's identity is among the `n` closest candidates.
    pub fn is_topn_success(&self, n: usize) -> bool {
        self.ranked()
            .into_iter()
            .take(n)
            .any(|c| c.id == self.identity)
    }

    /// Merges candidates of the same identity into one.
    pub fn to_squashed(&self, strategy: SquashStrategy) -> PointResult {
        let mut grouped: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for candidate in &self.candidates {
            grouped
                .entry(candidate.id.as_str())
                .or_default()
                .push(candidate.distance);
        }
        let mut squashed = PointResult::new(&self.identity, &self.point_id);
        for (id, distances) in grouped {
            let distance = match strategy {
                SquashStrategy::Min => distances.iter().copied().fold(f64::INFINITY, f64::min),
                SquashStrategy::Mean => distances.iter().sum::<f64>() / distances.len() as f64,
            };
            squashed.add_candidate(id, distance);
        }
        squashed
    }

    fn to_line(&self) -> String {
        let candidates: Vec<String> = self
            .candidates
            .iter()
            .map(|c| format!("{}|{}", c.id, c.distance))
            .collect();
        format!("{},{},{}", self.identity, self.point_id, candidates.join(","))
    }

    fn parse_line(line_no: usize, parts: &[&str]) -> Result<Self, ResultError> {
        if parts.len() < 2 {
            return Err(ResultError::Syntax {
                line: line_no,
                message: "expected at least identity and point".to_string(),
            });
        }
        let mut result = PointResult::new(parts[0], parts[1]);
        for part in parts[2..].iter().filter(|p| !p.is_empty()) {
            let (id, distance) = match part.split_once('|') {
                Some((id, distance)) => {
                    let distance = distance.parse::<f64>().map_err(|_| ResultError::Syntax {
                        line: line_no,
                        message: format!("invalid distance '{}'", distance),
                    })?;
                    (id, distance)
                }
                None => (*part, 0.0),
            };
            result.add_candidate(id, distance);
        }
        Ok(result)
    }
}

impl fmt::Display for PointResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Result for {} (correct: {})", self.point_id, self.identity)?;
        for candidate in self.ranked() {
            write!(f, " {} ({});", candidate.id, candidate.distance)?;
        }
        Ok(())
    }
}

/// All results of one evaluation run plus the context that produced them.
#[derive(Debug, Clone)]
pub struct ResultSet {
    id: String,
    path: Option<PathBuf>,
    results: Vec<PointResult>,
    config: Value,
    datasets: BTreeMap<String, String>,
}

impl ResultSet {
    /// New id of the form `YYYY-mm-dd_HH-MM-SS_<8 hex>`.
    pub fn new_id() -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}_{}", Local::now().format("%Y-%m-%d_%H-%M-%S"), &suffix[..8])
    }

    /// Creates an empty set that streams every appended result to
    /// `<folder>/<id>.results.txt`.
    pub fn create(folder: &Path) -> Result<Self, ResultError> {
        fs::create_dir_all(folder)?;
        let id = Self::new_id();
        let path = folder.join(format!("{}{}", id, RESULT_FILE_SUFFIX));
        Ok(Self {
            id,
            path: Some(path),
            results: Vec::new(),
            config: Value::Null,
            datasets: BTreeMap::new(),
        })
    }

    /// Creates an empty set that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            id: Self::new_id(),
            path: None,
            results: Vec::new(),
            config: Value::Null,
            datasets: BTreeMap::new(),
        }
    }

    /// Reads a result file.
    pub fn load(path: &Path) -> Result<Self, ResultError> {
        if !path.is_file() {
            return Err(ResultError::NotFound(path.to_path_buf()));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = file_name
            .strip_suffix(RESULT_FILE_SUFFIX)
            .unwrap_or(&file_name)
            .to_string();

        let mut set = Self {
            id,
            path: Some(path.to_path_buf()),
            results: Vec::new(),
            config: Value::Null,
            datasets: BTreeMap::new(),
        };
        for (index, line) in fs::read_to_string(path)?.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split(',').collect();
            match parts[0] {
                "config" => set.config = serde_json::from_str(&parts[1..].join(","))?,
                "dataset" => set.datasets = parse_datasets(&parts[1..]),
                _ => set.results.push(PointResult::parse_line(index + 1, &parts)?),
            }
        }
        Ok(set)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Backing file, `None` for in-memory sets.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn results(&self) -> &[PointResult] {
        &self.results
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Dataset names by role.
    pub fn datasets(&self) -> &BTreeMap<String, String> {
        &self.datasets
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Adds a result, appending it to the backing file if there is one.
    pub fn append(&mut self, result: PointResult) -> Result<(), ResultError> {
        if let Some(path) = &self.path {
            append_line(path, &result.to_line())?;
        }
        self.results.push(result);
        Ok(())
    }

    /// Records the run configuration and the datasets used, by role.
    pub fn save_context(
        &mut self,
        config: Value,
        datasets: BTreeMap<String, String>,
    ) -> Result<(), ResultError> {
        if let Some(path) = &self.path {
            append_line(path, &format!("config,{}", serde_json::to_string(&config)?))?;
            let pairs: Vec<String> = datasets
                .iter()
                .map(|(role, name)| format!("{}:{}", role, name))
                .collect();
            append_line(path, &format!("dataset,{}", pairs.join(",")))?;
        }
        self.config = config;
        self.datasets = datasets;
        Ok(())
    }

    /// In-memory copy with every result squashed.
    pub fn to_squashed(&self, strategy: SquashStrategy) -> ResultSet {
        ResultSet {
            id: self.id.clone(),
            path: None,
            results: self.results.iter().map(|r| r.to_squashed(strategy)).collect(),
            config: self.config.clone(),
            datasets: self.datasets.clone(),
        }
    }
}

fn parse_datasets(parts: &[&str]) -> BTreeMap<String, String> {
    parts
        .iter()
        .enumerate()
        .map(|(index, part)| match part.split_once(':') {
            Some((role, name)) => (role.to_string(), name.to_string()),
            None => (index.to_string(), part.to_string()),
        })
        .collect()
}

fn append_line(path: &Path, line: &str) -> Result<(), ResultError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", line)?;
    Ok(())
}
