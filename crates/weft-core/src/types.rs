use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique workflow run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a single step.
///
/// `Pending -> Running -> {Success | Failed | Skipped | Cancelled}`, with
/// `Retrying` as a transient sub-state of `Running`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Retrying)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Retrying, Running)
                | (Retrying, Failed)
                | (Retrying, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "retrying" => Self::Retrying,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal status of a whole run. A finished run is exactly one of these.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "success" => Self::Success,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How ready steps are dispatched.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// One ready node at a time, in execution order.
    Sequential,
    /// Each wavefront goes to the worker pool.
    #[default]
    AutoParallel,
    /// Like auto-parallel, but wavefronts pass the stability gate first.
    CoordinatedParallel,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sequential => "sequential",
            Self::AutoParallel => "auto-parallel",
            Self::CoordinatedParallel => "coordinated-parallel",
        })
    }
}

/// Task complexity tier. Ordered `Simple < Medium < Complex`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityTier {
    Simple,
    Medium,
    Complex,
}

impl fmt::Display for ComplexityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        })
    }
}

/// Output of the task-complexity classifier, consumed once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub tier: ComplexityTier,
    /// Roles allowed to take part in the run (empty = all).
    #[serde(default)]
    pub allowed_roles: Vec<String>,
    /// Upper bound on concurrently running steps.
    #[serde(default)]
    pub max_agents: Option<usize>,
}

impl Classification {
    pub fn tier(tier: ComplexityTier) -> Self {
        Self {
            tier,
            allowed_roles: vec![],
            max_agents: None,
        }
    }
}

/// Token and cost usage reported by a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    pub fn add(&mut self, other: Usage) {
        self.tokens += other.tokens;
        self.cost += other.cost;
    }
}

/// Direction of a contract check at a handoff boundary.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
        })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// Workflow event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A run started (or resumed).
    RunStarted {
        run_id: RunId,
        workflow_id: String,
        resumed: bool,
    },
    /// A wavefront is about to be dispatched.
    WavefrontStarted {
        run_id: RunId,
        index: usize,
        steps: Vec<String>,
    },
    /// The stability gate finished for a wavefront.
    CoordinationResolved {
        run_id: RunId,
        converged: bool,
        passes: usize,
        yielded: Vec<String>,
    },
    /// A step was dispatched to its handler.
    StepStarted {
        run_id: RunId,
        step_id: String,
        attempt: u32,
    },
    /// A step attempt failed and will be retried.
    StepRetrying {
        run_id: RunId,
        step_id: String,
        attempt: u32,
        error: String,
    },
    /// A step reached a terminal status.
    StepFinished {
        run_id: RunId,
        step_id: String,
        status: StepStatus,
        duration_ms: u64,
        error: Option<String>,
    },
    /// Free-form log line from the engine.
    Log {
        run_id: RunId,
        step_id: Option<String>,
        level: LogLevel,
        message: String,
    },
    /// Token and cost usage reported by a step.
    UsageReported {
        run_id: RunId,
        step_id: String,
        tokens: u64,
        cost: f64,
    },
    /// Progress update.
    Progress {
        run_id: RunId,
        percent: f64,
        current_step: Option<String>,
    },
    /// A run finished.
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        duration_ms: u64,
        usage: Usage,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::WavefrontStarted { run_id, .. }
            | Self::CoordinationResolved { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepRetrying { run_id, .. }
            | Self::StepFinished { run_id, .. }
            | Self::Log { run_id, .. }
            | Self::UsageReported { run_id, .. }
            | Self::Progress { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}
