use std::fmt;

use serde::{Deserialize, Serialize};

use weft_core::types::ComplexityTier;

/// Closed set of step types.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Start,
    End,
    AgentCall,
    Shell,
    Branch,
    Loop,
    Parallel,
    FanOut,
    FanIn,
    MapReduce,
    Checkpoint,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::AgentCall => "agent-call",
            Self::Shell => "shell",
            Self::Branch => "branch",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::FanOut => "fan-out",
            Self::FanIn => "fan-in",
            Self::MapReduce => "map-reduce",
            Self::Checkpoint => "checkpoint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "start" => Self::Start,
            "end" => Self::End,
            "agent-call" => Self::AgentCall,
            "shell" => Self::Shell,
            "branch" => Self::Branch,
            "loop" => Self::Loop,
            "parallel" => Self::Parallel,
            "fan-out" => Self::FanOut,
            "fan-in" => Self::FanIn,
            "map-reduce" => Self::MapReduce,
            "checkpoint" => Self::Checkpoint,
            _ => return None,
        })
    }

    /// Control nodes resolve inside the executor and never reach a handler.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Self::Start
                | Self::End
                | Self::Branch
                | Self::Loop
                | Self::Parallel
                | Self::FanOut
                | Self::FanIn
        )
    }

    /// Nodes that record a handle decision when they complete.
    pub fn is_decision(self) -> bool {
        matches!(self, Self::Branch | Self::Loop)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnFailure {
    #[default]
    Abort,
    Continue,
    Retry,
    Fallback,
}

impl OnFailure {
    pub fn is_default(&self) -> bool {
        *self == Self::Abort
    }
}

/// Condition checked by a `branch` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    /// Context path to read (dotted paths allowed).
    pub field: String,
    /// `equals`, `not_equals`, `contains`, `greater_than`, `less_than`, `in`, `not_empty`.
    pub operator: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl BranchSpec {
    pub fn new(
        field: impl Into<String>,
        operator: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    While,
    Count,
    ForEach,
}

/// Configuration of a `loop` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSpec {
    #[serde(rename = "type")]
    pub kind: LoopKind,
    /// Expression re-evaluated before every `while` iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    /// Context path of the `for_each` collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Hard ceiling applied to every loop type.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    100
}

impl LoopSpec {
    pub fn count(count: u32) -> Self {
        Self {
            kind: LoopKind::Count,
            condition: None,
            count: Some(count),
            collection: None,
            max_iterations: default_max_iterations(),
        }
    }

    pub fn while_(condition: impl Into<String>) -> Self {
        Self {
            kind: LoopKind::While,
            condition: Some(condition.into()),
            count: None,
            collection: None,
            max_iterations: default_max_iterations(),
        }
    }

    pub fn for_each(collection: impl Into<String>) -> Self {
        Self {
            kind: LoopKind::ForEach,
            condition: None,
            count: None,
            collection: Some(collection.into()),
            max_iterations: default_max_iterations(),
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }
}

/// How `map-reduce` folds per-item results.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    /// Array of per-item outputs.
    #[default]
    Collect,
    /// Flatten array outputs, join string outputs with newlines.
    Concat,
    /// Shallow-merge object outputs, later items win.
    Merge,
    /// Sum numeric outputs.
    Sum,
}

/// Configuration of a `map-reduce` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSpec {
    /// Context path of the collection to map over.
    pub collection: String,
    /// Step type whose handler runs once per item.
    pub step_type: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub reduce: ReduceOp,
}

fn default_concurrency() -> usize {
    4
}

impl MapSpec {
    pub fn new(collection: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            step_type: step_type.into(),
            concurrency: default_concurrency(),
            reduce: ReduceOp::default(),
        }
    }

    pub fn with_reduce(mut self, reduce: ReduceOp) -> Self {
        self.reduce = reduce;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// Type-specific configuration plus the step policy carried over from the
/// descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    /// Opaque handler parameters.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchSpec>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "OnFailure::is_default")]
    pub on_failure: OnFailure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_complexity: Option<ComplexityTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub data: NodeData,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            data: NodeData::default(),
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::new(id, NodeKind::End)
    }

    pub fn branch(id: impl Into<String>, spec: BranchSpec) -> Self {
        Self::new(id, NodeKind::Branch).with_branch(spec)
    }

    pub fn loop_node(id: impl Into<String>, spec: LoopSpec) -> Self {
        Self::new(id, NodeKind::Loop).with_loop(spec)
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.data.params = params;
        self
    }

    pub fn with_outputs(mut self, keys: Vec<String>) -> Self {
        self.data.outputs = keys;
        self
    }

    pub fn with_branch(mut self, spec: BranchSpec) -> Self {
        self.data.branch = Some(spec);
        self
    }

    pub fn with_loop(mut self, spec: LoopSpec) -> Self {
        self.data.loop_spec = Some(spec);
        self
    }

    pub fn with_map(mut self, spec: MapSpec) -> Self {
        self.data.map = Some(spec);
        self
    }

    pub fn with_on_failure(mut self, policy: OnFailure) -> Self {
        self.data.on_failure = policy;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.data.max_retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.data.timeout = Some(secs);
        self
    }

    pub fn with_min_complexity(mut self, tier: ComplexityTier) -> Self {
        self.data.min_complexity = Some(tier);
        self
    }

    pub fn with_condition(mut self, expr: impl Into<String>) -> Self {
        self.data.condition = Some(expr.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.data.agent_role = Some(role.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.data.description = Some(description.into());
        self
    }

    /// Looks up a string handler parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.data.params.get(key).and_then(|v| v.as_str())
    }
}
