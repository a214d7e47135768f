//! Per-stage execution state and the run trace.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::PipelineError;

/// Status of one stage of an experiment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageState {
    /// Not looked up yet.
    Unresolved,
    /// Cache miss, the stage is running.
    Computing,
    /// Outputs are available.
    Resolved { outputs: Vec<String>, cache_hit: bool },
    /// The stage failed and the run was aborted.
    Failed { error: String },
}

impl StageState {
    fn label(&self) -> &'static str {
        match self {
            StageState::Unresolved => "unresolved",
            StageState::Computing => "computing",
            StageState::Resolved { .. } => "resolved",
            StageState::Failed { .. } => "failed",
        }
    }

    /// Whether moving to `next` is allowed.
    ///
    /// Unresolved stages resolve from the cache or start computing.
    /// Computing stages resolve or fail. Resolved and failed are final.
    pub fn can_move_to(&self, next: &StageState) -> bool {
        matches!(
            (self, next),
            (StageState::Unresolved, StageState::Resolved { cache_hit: true, .. })
                | (StageState::Unresolved, StageState::Computing)
                | (StageState::Computing, StageState::Resolved { cache_hit: false, .. })
                | (StageState::Computing, StageState::Failed { .. })
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, StageState::Resolved { .. } | StageState::Failed { .. })
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One stage of a run and the states it went through.
#[derive(Debug, Clone)]
pub struct StageRecord {
    pub label: String,
    pub history: Vec<StageState>,
    pub duration: Duration,
    started: Instant,
}

impl StageRecord {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            history: vec![StageState::Unresolved],
            duration: Duration::ZERO,
            started: Instant::now(),
        }
    }

    /// Current state.
    pub fn state(&self) -> &StageState {
        // history always starts with Unresolved
        self.history.last().unwrap_or(&StageState::Unresolved)
    }
}

/// Ordered record of every stage transition in a run.
#[derive(Debug, Clone, Default)]
pub struct RunTrace {
    records: Vec<StageRecord>,
}

impl RunTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a stage in the `Unresolved` state.
    pub fn begin(&mut self, label: &str) -> usize {
        self.records.push(StageRecord::new(label));
        self.records.len() - 1
    }

    fn transition(&mut self, index: usize, next: StageState) -> Result<(), PipelineError> {
        let record = self.records.get_mut(index).ok_or_else(|| PipelineError::InvalidTransition {
            stage: format!("#{}", index),
            from: "untracked".to_string(),
            to: next.to_string(),
        })?;
        if !record.state().can_move_to(&next) {
            return Err(PipelineError::InvalidTransition {
                stage: record.label.clone(),
                from: record.state().to_string(),
                to: next.to_string(),
            });
        }
        debug!(stage = %record.label, from = %record.state(), to = %next, "Stage transition");
        if next.is_final() {
            record.duration = record.started.elapsed();
        }
        record.history.push(next);
        Ok(())
    }

    pub fn computing(&mut self, index: usize) -> Result<(), PipelineError> {
        self.transition(index, StageState::Computing)
    }

    /// Marks a stage resolved. `cache_hit` must be true exactly when the
    /// stage never started computing.
    pub fn resolved(
        &mut self,
        index: usize,
        outputs: Vec<String>,
        cache_hit: bool,
    ) -> Result<(), PipelineError> {
        self.transition(index, StageState::Resolved { outputs, cache_hit })
    }

    pub fn failed(&mut self, index: usize, error: impl Into<String>) -> Result<(), PipelineError> {
        self.transition(
            index,
            StageState::Failed {
                error: error.into(),
            },
        )
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// Number of stages resolved from the cache.
    pub fn cache_hits(&self) -> usize {
        self.count(|s| matches!(s, StageState::Resolved { cache_hit: true, .. }))
    }

    /// Number of stages that had to be computed.
    pub fn computed(&self) -> usize {
        self.count(|s| matches!(s, StageState::Resolved { cache_hit: false, .. }))
    }

    pub fn failures(&self) -> usize {
        self.count(|s| matches!(s, StageState::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&StageState) -> bool) -> usize {
        self.records.iter().filter(|r| predicate(r.state())).count()
    }
}
