//! Declarative authoring form of a workflow.
//!
//! ```yaml
//! id: release
//! name: "Release pipeline"
//! version: "1.2"
//! inputs:
//!   - name: branch
//!     default: main
//! settings:
//!   mode: coordinated-parallel
//!   max_workers: 4
//! steps:
//!   - id: build
//!     type: shell
//!     params: { command: "cargo build --release" }
//!     outputs: [artifact]
//!   - id: review
//!     type: agent-call
//!     agent_role: reviewer
//!     depends_on: [build]
//!     outputs: [review]
//!   - id: gate
//!     type: branch
//!     depends_on: [review]
//!     branch: { field: review.status, operator: equals, value: approved }
//!   - id: publish
//!     type: shell
//!     depends_on: ["gate:true"]
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use weft_core::config::expand_env_vars;
use weft_core::error::{Result, WeftError};
use weft_core::types::{ComplexityTier, ExecutionMode};

use crate::edge::GraphEdge;
use crate::graph::WorkflowGraph;
use crate::node::{BranchSpec, GraphNode, LoopSpec, MapSpec, NodeData, NodeKind, OnFailure};

/// One step in the linear authoring form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
    /// Step ids this step waits for. `"<id>:<handle>"` depends on a single
    /// outgoing handle of a branch or loop step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
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
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchSpec>,
    #[serde(default, rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_spec: Option<LoopSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapSpec>,
}

impl StepDescriptor {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self::from_node(&GraphNode::new(id, kind), vec![])
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, keys: &[&str]) -> Self {
        self.outputs = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    fn into_node(self) -> (GraphNode, Vec<String>) {
        let node = GraphNode {
            id: self.id,
            kind: self.kind,
            data: NodeData {
                params: self.params,
                branch: self.branch,
                loop_spec: self.loop_spec,
                map: self.map,
                outputs: self.outputs,
                on_failure: self.on_failure,
                max_retries: self.max_retries,
                timeout: self.timeout,
                min_complexity: self.min_complexity,
                condition: self.condition,
                agent_role: self.agent_role,
                description: self.description,
            },
        };
        (node, self.depends_on)
    }

    fn from_node(node: &GraphNode, depends_on: Vec<String>) -> Self {
        let data = node.data.clone();
        Self {
            id: node.id.clone(),
            kind: node.kind,
            params: data.params,
            depends_on,
            outputs: data.outputs,
            on_failure: data.on_failure,
            max_retries: data.max_retries,
            timeout: data.timeout,
            min_complexity: data.min_complexity,
            condition: data.condition,
            agent_role: data.agent_role,
            description: data.description,
            branch: data.branch,
            loop_spec: data.loop_spec,
            map: data.map,
        }
    }
}

/// A declared workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinationSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_passes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_stability: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_secs: Option<u64>,
}

/// Per-workflow overrides of the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub coordination: CoordinationSettings,
    #[serde(default)]
    pub budget: BudgetSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,
}

/// A named, versioned collection of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub inputs: Vec<WorkflowInput>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    pub steps: Vec<StepDescriptor>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            inputs: vec![],
            outputs: vec![],
            settings: WorkflowSettings::default(),
            steps: vec![],
        }
    }

    pub fn with_step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Load a descriptor, picking the format from the file extension.
    /// `${ENV_VAR}` references are expanded first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let expanded = expand_env_vars(&content);
        let descriptor = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&expanded)?,
            Some("json") => Self::from_json_str(&expanded)?,
            Some("toml") => Self::from_toml_str(&expanded)?,
            other => {
                return Err(WeftError::Config(format!(
                    "unsupported workflow format: {}",
                    other.unwrap_or("<none>")
                )))
            }
        };
        debug!(
            path = %path.display(),
            workflow_id = %descriptor.id,
            steps = descriptor.steps.len(),
            "Loaded workflow descriptor"
        );
        Ok(descriptor)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Derive the graph from `depends_on`. Nodes keep step order and edges
    /// follow step order, then dependency order.
    pub fn to_graph(&self) -> Result<WorkflowGraph> {
        let mut ids = HashSet::new();
        for step in &self.steps {
            if !ids.insert(step.id.as_str()) {
                return Err(WeftError::Structural(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        let mut graph = WorkflowGraph::new(self.id.clone(), self.name.clone());
        let mut edges = Vec::new();
        for step in &self.steps {
            let (node, deps) = step.clone().into_node();
            for dep in deps {
                let (source, handle) = match dep.split_once(':') {
                    Some((s, h)) => (s.to_string(), Some(h.to_string())),
                    None => (dep.clone(), None),
                };
                if !ids.contains(source.as_str()) {
                    return Err(WeftError::Structural(format!(
                        "step '{}' depends on unknown step '{}'",
                        node.id, source
                    )));
                }
                edges.push(match handle {
                    Some(h) => GraphEdge::with_handle(source, h, node.id.clone()),
                    None => GraphEdge::new(source, node.id.clone()),
                });
            }
            graph.add_node(node);
        }
        for edge in edges {
            graph.add_edge(edge);
        }

        graph.validate()?;
        validate_output_keys(&graph)?;
        self.validate_input_shadowing(&graph)?;
        Ok(graph)
    }

    /// Inverse of [`to_graph`](Self::to_graph): each incoming edge becomes a
    /// `depends_on` entry.
    pub fn from_graph(graph: &WorkflowGraph) -> Self {
        let steps = graph
            .nodes
            .iter()
            .map(|node| {
                let deps = graph
                    .edges
                    .iter()
                    .filter(|e| e.target == node.id)
                    .map(|e| match e.handle() {
                        Some(h) => format!("{}:{}", e.source, h),
                        None => e.source.clone(),
                    })
                    .collect();
                StepDescriptor::from_node(node, deps)
            })
            .collect();
        Self {
            steps,
            ..Self::new(graph.id.clone(), graph.name.clone())
        }
    }

    /// A step may not publish a key that names a declared input; the input
    /// owns it for the whole run.
    fn validate_input_shadowing(&self, graph: &WorkflowGraph) -> Result<()> {
        for node in &graph.nodes {
            if let Some(key) = node
                .data
                .outputs
                .iter()
                .find(|key| self.inputs.iter().any(|i| &i.name == *key))
            {
                return Err(WeftError::Structural(format!(
                    "step '{}' publishes '{}', which is a workflow input",
                    node.id, key
                )));
            }
        }
        Ok(())
    }

    /// Apply input defaults and reject missing required inputs.
    pub fn resolve_inputs(
        &self,
        provided: HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, serde_json::Value>> {
        let mut resolved = provided;
        for input in &self.inputs {
            if resolved.contains_key(&input.name) {
                continue;
            }
            match &input.default {
                Some(default) => {
                    resolved.insert(input.name.clone(), default.clone());
                }
                None if input.required => {
                    return Err(WeftError::Config(format!(
                        "missing required input '{}'",
                        input.name
                    )));
                }
                None => {}
            }
        }
        Ok(resolved)
    }
}

/// Two steps that may run at the same time must not declare the same output
/// key.
pub fn validate_output_keys(graph: &WorkflowGraph) -> Result<()> {
    let walker = graph.walker();
    let mut publishers: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in &graph.nodes {
        for key in &node.data.outputs {
            publishers.entry(key.as_str()).or_default().push(node.id.as_str());
        }
    }
    let mut keys: Vec<_> = publishers.into_iter().collect();
    keys.sort();
    for (key, steps) in keys {
        for (i, a) in steps.iter().enumerate() {
            for b in &steps[i + 1..] {
                if walker.may_run_concurrently(a, b) {
                    return Err(WeftError::Structural(format!(
                        "steps '{}' and '{}' may run concurrently and both publish '{}'",
                        a, b, key
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::HANDLE_TRUE;

    const RELEASE: &str = r#"
id: release
name: Release
settings:
  mode: coordinated-parallel
  max_workers: 2
  coordination:
    max_passes: 5
inputs:
  - name: branch
    default: main
  - name: ticket
    required: true
steps:
  - id: build
    type: shell
    params:
      command: "make"
    outputs: [artifact]
  - id: review
    type: agent-call
    agent_role: reviewer
    depends_on: [build]
    outputs: [review]
    on_failure: retry
    max_retries: 2
  - id: gate
    type: branch
    depends_on: [review]
    branch:
      field: review.status
      operator: equals
      value: approved
  - id: publish
    type: shell
    depends_on: ["gate:true"]
    min_complexity: medium
"#;

    #[test]
    fn test_parse_yaml() {
        let wf = WorkflowDescriptor::from_yaml_str(RELEASE).unwrap();
        assert_eq!(wf.version, "1.0");
        assert_eq!(wf.settings.mode, Some(ExecutionMode::CoordinatedParallel));
        assert_eq!(wf.settings.coordination.max_passes, Some(5));
        assert_eq!(wf.steps.len(), 4);
        assert_eq!(wf.steps[1].on_failure, OnFailure::Retry);
        assert_eq!(wf.steps[3].min_complexity, Some(ComplexityTier::Medium));
    }

    #[test]
    fn test_to_graph() {
        let wf = WorkflowDescriptor::from_yaml_str(RELEASE).unwrap();
        let graph = wf.to_graph().unwrap();
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.edges.len(), 3);
        let gate_edge = graph.edges.iter().find(|e| e.target == "publish").unwrap();
        assert_eq!(gate_edge.handle(), Some(HANDLE_TRUE));
        assert_eq!(graph.node("review").unwrap().data.max_retries, Some(2));
    }

    #[test]
    fn test_graph_roundtrip() {
        let wf = WorkflowDescriptor::from_yaml_str(RELEASE).unwrap();
        let graph = wf.to_graph().unwrap();
        let back = WorkflowDescriptor::from_graph(&graph);
        assert_eq!(back.id, wf.id);
        for (a, b) in wf.steps.iter().zip(back.steps.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.depends_on, b.depends_on);
            assert_eq!(a.outputs, b.outputs);
        }
        assert_eq!(back.to_graph().unwrap(), graph);
    }

    #[test]
    fn test_unknown_dependency() {
        let wf = WorkflowDescriptor::new("w", "W")
            .with_step(StepDescriptor::new("a", NodeKind::Shell).depends_on(&["nope"]));
        let err = wf.to_graph().unwrap_err();
        assert!(matches!(err, WeftError::Structural(_)));
    }

    #[test]
    fn test_concurrent_output_collision() {
        let wf = WorkflowDescriptor::new("w", "W")
            .with_step(StepDescriptor::new("a", NodeKind::Shell).with_outputs(&["report"]))
            .with_step(StepDescriptor::new("b", NodeKind::Shell).with_outputs(&["report"]));
        let err = wf.to_graph().unwrap_err();
        assert!(err.to_string().contains("report"));

        // Sequential publishers of the same key are fine.
        let wf = WorkflowDescriptor::new("w", "W")
            .with_step(StepDescriptor::new("a", NodeKind::Shell).with_outputs(&["report"]))
            .with_step(
                StepDescriptor::new("b", NodeKind::Shell)
                    .depends_on(&["a"])
                    .with_outputs(&["report"]),
            );
        assert!(wf.to_graph().is_ok());
    }

    #[test]
    fn test_output_shadowing_input_rejected() {
        let mut wf = WorkflowDescriptor::new("w", "W")
            .with_step(StepDescriptor::new("write", NodeKind::Shell).with_outputs(&["summary"]));
        wf.inputs.push(WorkflowInput {
            name: "summary".into(),
            required: false,
            default: Some(serde_json::json!("draft")),
            description: None,
        });
        let err = wf.to_graph().unwrap_err();
        assert!(matches!(err, WeftError::Structural(_)));
        assert!(err.to_string().contains("summary"));

        wf.steps[0].outputs = vec!["final_summary".into()];
        assert!(wf.to_graph().is_ok());
    }

    #[test]
    fn test_resolve_inputs() {
        let wf = WorkflowDescriptor::from_yaml_str(RELEASE).unwrap();
        assert!(wf.resolve_inputs(HashMap::new()).is_err());
        let resolved = wf
            .resolve_inputs(HashMap::from([("ticket".into(), serde_json::json!("T-1"))]))
            .unwrap();
        assert_eq!(resolved["branch"], serde_json::json!("main"));
    }

    #[test]
    fn test_parse_toml_and_json() {
        let toml_src = r#"
id = "t"
name = "T"

[[steps]]
id = "a"
type = "shell"

[[steps]]
id = "b"
type = "end"
depends_on = ["a"]
"#;
        let wf = WorkflowDescriptor::from_toml_str(toml_src).unwrap();
        assert_eq!(wf.steps[1].depends_on, vec!["a"]);

        let json_src = r#"{"id": "j", "name": "J", "steps": [{"id": "only", "type": "agent-call"}]}"#;
        let wf = WorkflowDescriptor::from_json_str(json_src).unwrap();
        assert_eq!(wf.steps[0].kind, NodeKind::AgentCall);
    }
}
