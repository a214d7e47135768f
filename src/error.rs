//! Error types for anonbench operations.
//!
//! Defines error types for the storage and pipeline subsystems:
//! - Metadata file loading and persistence
//! - Dataset store operations (open, derive, delete, rename)
//! - Pipeline stage configuration and execution
//! - Experiment runs composed of stages
//! - Result file parsing and persistence

use std::path::PathBuf;

use thiserror::Error;

pub use crate::config::SettingsError;

/// Errors that can occur while reading or writing metadata files.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to access metadata file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed metadata file '{path}': {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Metadata root of '{0}' is not a mapping")]
    NotAMapping(PathBuf),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur during dataset store operations.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Dataset '{0}' not found")]
    NotFound(String),

    #[error("Dataset '{0}' already exists")]
    AlreadyExists(String),

    #[error("Inconsistent data directory: {0}")]
    Inconsistent(String),

    #[error("Invalid metadata for dataset '{name}': {message}")]
    InvalidMetadata { name: String, message: String },

    #[error("Datapoint '{point}' not found in dataset '{dataset}'")]
    PointNotFound { dataset: String, point: String },

    #[error("Invalid motion sequence '{path}': {message}")]
    InvalidMotion { path: PathBuf, message: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while configuring or running a pipeline stage.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Unknown {kind} strategy '{name}'")]
    UnknownStrategy { kind: String, name: String },

    #[error("Missing required parameter '{param}' for {stage}")]
    MissingParameter { stage: String, param: String },

    #[error("Invalid parameter '{param}' for {stage}: {message}")]
    InvalidParameter {
        stage: String,
        param: String,
        message: String,
    },

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("{stage}: expected {expected} {direction} datasets, got {actual}")]
    Arity {
        stage: String,
        direction: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("External command '{command}' exited with code {code:?}: {output}")]
    ExternalProcess {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("{stage} failed: {message}")]
    Failed { stage: String, message: String },

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Result error: {0}")]
    Results(#[from] ResultError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Returns true for errors detected before any work started.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StageError::UnknownStrategy { .. }
                | StageError::MissingParameter { .. }
                | StageError::InvalidParameter { .. }
        )
    }
}

/// Errors that abort an experiment run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("Unknown experiment topology '{0}'")]
    UnknownTopology(String),

    #[error("Run configuration has no '{0}' section")]
    MissingSection(String),

    #[error("Invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("No dataset bound to role '{0}'")]
    MissingRole(String),

    #[error("Stage '{stage}' cannot move from {from} to {to}")]
    InvalidTransition {
        stage: String,
        from: String,
        to: String,
    },

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Result error: {0}")]
    Results(#[from] ResultError),

    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Wraps a stage error with the label of the stage that raised it.
    pub fn stage(stage: impl Into<String>, source: impl Into<StageError>) -> Self {
        PipelineError::Stage {
            stage: stage.into(),
            source: source.into(),
        }
    }

    /// Returns true when the run configuration itself is at fault.
    pub fn is_configuration(&self) -> bool {
        match self {
            PipelineError::Stage { source, .. } => source.is_configuration(),
            PipelineError::UnknownTopology(_)
            | PipelineError::MissingSection(_)
            | PipelineError::InvalidConfig(_) => true,
            _ => false,
        }
    }
}

/// Errors that can occur while reading or writing result files.
#[derive(Debug, Error)]
pub enum ResultError {
    #[error("Result file '{0}' not found")]
    NotFound(PathBuf),

    #[error("Invalid syntax in result file at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Unknown squash strategy '{0}'")]
    UnknownSquashStrategy(String),

    #[error("Unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_flagged() {
        let err = StageError::MissingParameter {
            stage: "splitter anonbg".to_string(),
            param: "rate".to_string(),
        };
        assert!(err.is_configuration());
        assert!(err.to_string().contains("rate"));

        let err = StageError::Precondition("original dataset".to_string());
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_pipeline_error_keeps_stage_category() {
        let err = PipelineError::stage(
            "anonymization",
            StageError::MissingParameter {
                stage: "anonymization external".to_string(),
                param: "opt.bin".to_string(),
            },
        );
        assert!(err.is_configuration());
        assert!(err.to_string().starts_with("Stage 'anonymization' failed"));
        assert!(!PipelineError::MissingRole("enroll".to_string()).is_configuration());
    }

    #[test]
    fn test_external_process_display() {
        let err = StageError::ExternalProcess {
            command: "blur --in x".to_string(),
            code: Some(2),
            output: "no such file".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("blur --in x"));
        assert!(text.contains("no such file"));
    }
}
