//! Workflow graph model, the declarative descriptor it is derived from, and
//! the pure traversal algorithms the executor schedules with.

pub mod condition;
pub mod descriptor;
pub mod edge;
pub mod graph;
pub mod node;
pub mod walker;

pub use condition::evaluate_condition;
pub use descriptor::{StepDescriptor, WorkflowDescriptor, WorkflowInput, WorkflowSettings};
pub use edge::GraphEdge;
pub use graph::WorkflowGraph;
pub use node::{BranchSpec, GraphNode, LoopKind, LoopSpec, MapSpec, NodeData, NodeKind, OnFailure, ReduceOp};
pub use walker::GraphWalker;
