//! anonbench: benchmark harness for biometric anonymization.
//!
//! Datasets live in a data root as folders of datapoint files plus a YAML
//! metadata document recording where each one came from. Pipeline stages
//! (splitters, selectors, anonymizers, de-anonymizers) derive new datasets
//! and record their recipe, so the pipeline cache can reuse any output an
//! earlier run already produced. The experiment orchestrator chains stages
//! into fixed topologies and evaluates the result.

pub mod cache;
pub mod cli;
pub mod config;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod metadata;
pub mod registry;
pub mod results;
pub mod stage;

// Re-export commonly used types
pub use config::Settings;
pub use error::{DatasetError, MetadataError, PipelineError, ResultError, StageError};
pub use experiment::ExperimentRunner;
