use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, RunSummary};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::*;

/// Everything a handler gets for one attempt of one step.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub run_id: RunId,
    pub step_id: String,
    /// Step type string (`agent-call`, `shell`, ...).
    pub kind: String,
    pub params: serde_json::Value,
    /// Declared output keys of the step.
    pub outputs: Vec<String>,
    pub agent_role: Option<String>,
    /// Read-only view of the run context as of the start of the wavefront.
    pub context: Arc<ExecutionContext>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Current element for map-reduce items and for-each loop bodies.
    pub item: Option<serde_json::Value>,
    /// Fires on run cancellation or run timeout. A handler that ignores it
    /// runs until it returns or hits its step timeout.
    pub cancel: CancellationToken,
}

/// Value produced by a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub value: serde_json::Value,
    pub usage: Option<Usage>,
}

impl StepOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value, usage: None }
    }

    pub fn with_usage(mut self, tokens: u64, cost: f64) -> Self {
        self.usage = Some(Usage { tokens, cost });
        self
    }
}

/// Step handler, registered per step type.
pub trait StepHandler: Send + Sync + 'static {
    /// Handler name (used in logs).
    fn name(&self) -> &str;

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>>;
}

/// Durable checkpoint storage.
pub trait CheckpointStore: Send + Sync + 'static {
    fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Most recent checkpoint of a run.
    fn load_latest(&self, run_id: &RunId) -> Result<Option<Checkpoint>>;

    /// Runs whose last checkpoint did not record success, newest first.
    fn list_resumable(&self) -> Result<Vec<RunSummary>>;

    /// Every checkpoint of a run in write order.
    fn load_run(&self, run_id: &RunId) -> Result<Vec<Checkpoint>>;
}

/// Input/output schemas agreed for an agent role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleContract {
    pub role: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub output_schema: Option<serde_json::Value>,
    /// Context keys that must be published before a step in this role runs.
    #[serde(default)]
    pub required_context: Vec<String>,
}

/// Role contracts checked at handoff boundaries.
pub trait ContractRegistry: Send + Sync + 'static {
    fn get_contract(&self, role: &str) -> Option<&RoleContract>;

    /// Ok when the role has no contract or no schema for `direction`.
    fn validate(&self, role: &str, payload: &serde_json::Value, direction: Direction) -> Result<()>;
}

/// Receives token/cost usage as steps report it.
pub trait UsageHook: Send + Sync + 'static {
    fn record_usage(&self, run_id: &RunId, step_id: &str, tokens: u64, cost: f64);
}

/// Receives engine log lines and progress.
pub trait LogSink: Send + Sync + 'static {
    fn record_log(&self, run_id: &RunId, step_id: Option<&str>, level: LogLevel, message: &str);

    fn record_progress(&self, run_id: &RunId, percent: f64, current_step: Option<&str>);
}

/// Classifies the task a run is for. Consulted once per run.
pub trait ComplexityClassifier: Send + Sync + 'static {
    fn classify(&self, task: &str) -> BoxFuture<'_, Result<Classification>>;
}
