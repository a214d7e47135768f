//! Experiment orchestration: run configurations, stage topologies and
//! the per-stage run trace.

pub mod config;
pub mod orchestrator;
pub mod state;

pub use config::{
    load_run_file, substitute_round, EvaluationRole, ExperimentConfig, RunEntry, StageSpec,
    Topology, ROUND_PLACEHOLDER,
};
pub use orchestrator::{BatchRun, ExperimentOutcome, ExperimentRunner};
pub use state::{RunTrace, StageRecord, StageState};
