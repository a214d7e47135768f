//! Evaluation results, metrics and the results summary.
//!
//! - **result_set**: per-probe ranked candidates and the result file format
//! - **metrics**: accuracy, distance and identity-level aggregates
//! - **manager**: the `results.yaml` summary with lookup by config or dataset

pub mod manager;
pub mod metrics;
pub mod result_set;

pub use manager::{ResultsManager, SUMMARY_FILE};
pub use metrics::{compute, METRIC_NAMES};
pub use result_set::{Candidate, PointResult, ResultSet, SquashStrategy, RESULT_FILE_SUFFIX};
