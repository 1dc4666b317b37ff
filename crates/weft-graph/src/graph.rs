use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use weft_core::error::{Result, WeftError};

use crate::edge::{GraphEdge, HANDLE_BODY, HANDLE_DONE, HANDLE_FALSE, HANDLE_TRUE};
use crate::node::{GraphNode, NodeKind};
use crate::walker::GraphWalker;

/// A workflow as nodes and directed edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: vec![],
            edges: vec![],
        }
    }

    pub fn with_node(mut self, node: GraphNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: GraphEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn add_node(&mut self, node: GraphNode) {
        self.nodes.push(node);
    }

    pub fn add_edge(&mut self, edge: GraphEdge) {
        self.edges.push(edge);
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn walker(&self) -> GraphWalker<'_> {
        GraphWalker::new(self)
    }

    /// Structural checks run at load time. Every error here is fatal.
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(WeftError::Structural("node with empty id".into()));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(WeftError::Structural(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            match node.kind {
                NodeKind::Loop if node.data.loop_spec.is_none() => {
                    return Err(WeftError::Structural(format!(
                        "loop node '{}' has no loop configuration",
                        node.id
                    )));
                }
                NodeKind::MapReduce if node.data.map.is_none() => {
                    return Err(WeftError::Structural(format!(
                        "map-reduce node '{}' has no map configuration",
                        node.id
                    )));
                }
                _ => {}
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(WeftError::Structural(format!(
                        "edge '{}' references unknown node '{}'",
                        edge.id, endpoint
                    )));
                }
            }
            let kind = self.node(&edge.source).map(|n| n.kind);
            let handle_ok = match (kind, edge.handle()) {
                (_, None) => true,
                (Some(NodeKind::Branch), Some(h)) => h == HANDLE_TRUE || h == HANDLE_FALSE,
                (Some(NodeKind::Loop), Some(h)) => h == HANDLE_BODY || h == HANDLE_DONE,
                _ => false,
            };
            if !handle_ok {
                return Err(WeftError::Structural(format!(
                    "edge '{}' uses handle '{}' which node '{}' does not have",
                    edge.id,
                    edge.handle().unwrap_or_default(),
                    edge.source
                )));
            }
        }

        self.walker().execution_order()?;
        Ok(())
    }
}
