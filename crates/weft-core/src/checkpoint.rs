use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::types::{RunId, RunStatus, StepStatus, Usage};

/// Everything needed to pick a run back up after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    /// Steps that finished successfully or were skipped.
    #[serde(default)]
    pub completed: BTreeSet<String>,
    /// Subset of `completed` that was skipped.
    #[serde(default)]
    pub skipped: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
    /// Handle chosen by each resolved branch or loop node.
    #[serde(default)]
    pub decisions: BTreeMap<String, String>,
    #[serde(default)]
    pub loop_iterations: BTreeMap<String, u32>,
    /// Attempts consumed per step, counted across resumes.
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    /// Raw outputs of successful steps.
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub context: ExecutionContext,
    #[serde(default)]
    pub usage: Usage,
}

/// Durable record of one step outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub workflow_id: String,
    /// Step the checkpoint was taken after.
    pub stage: String,
    pub status: StepStatus,
    pub attempt: u32,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub state: RunSnapshot,
    /// Set on the final checkpoint of a finished run.
    #[serde(default)]
    pub run_status: Option<RunStatus>,
}

/// One line of `list_resumable` output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub workflow_id: String,
    pub last_stage: String,
    pub checkpoints: usize,
    pub updated_at: DateTime<Utc>,
    pub run_status: Option<RunStatus>,
}

impl RunSummary {
    /// A run is resumable unless its last checkpoint recorded success.
    pub fn is_resumable(&self) -> bool {
        self.run_status != Some(RunStatus::Success)
    }
}
