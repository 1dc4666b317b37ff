//! Pure traversal algorithms over a [`WorkflowGraph`].
//!
//! Loops are the only legal cycles. A *back edge* is an edge entering a
//! `loop` node from a node inside that loop's body; readiness, execution
//! order and reachability all ignore back edges.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

use weft_core::context::ExecutionContext;
use weft_core::error::{Result, WeftError};

use crate::condition::{evaluate_branch_spec, evaluate_condition};
use crate::edge::{GraphEdge, HANDLE_BODY, HANDLE_DONE, HANDLE_FALSE, HANDLE_TRUE};
use crate::graph::WorkflowGraph;
use crate::node::{GraphNode, LoopKind, NodeKind};

/// Indexed, read-only view of a graph.
pub struct GraphWalker<'g> {
    graph: &'g WorkflowGraph,
    index: HashMap<&'g str, usize>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
    back_edges: HashSet<usize>,
    dangling: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

impl<'g> GraphWalker<'g> {
    pub fn new(graph: &'g WorkflowGraph) -> Self {
        let index: HashMap<&str, usize> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();
        let mut outgoing = vec![Vec::new(); graph.nodes.len()];
        let mut incoming = vec![Vec::new(); graph.nodes.len()];
        let mut dangling = false;

        for (ei, edge) in graph.edges.iter().enumerate() {
            match (index.get(edge.source.as_str()), index.get(edge.target.as_str())) {
                (Some(&s), Some(&t)) => {
                    outgoing[s].push(ei);
                    incoming[t].push(ei);
                }
                _ => dangling = true,
            }
        }

        let mut walker = Self {
            graph,
            index,
            outgoing,
            incoming,
            back_edges: HashSet::new(),
            dangling,
        };

        let mut back = HashSet::new();
        for (li, node) in graph.nodes.iter().enumerate() {
            if node.kind != NodeKind::Loop {
                continue;
            }
            let body = walker.body_of(li);
            for &ei in &walker.incoming[li] {
                let src = walker.index[graph.edges[ei].source.as_str()];
                if src == li || body.contains(&src) {
                    back.insert(ei);
                }
            }
        }
        walker.back_edges = back;
        walker
    }

    pub fn graph(&self) -> &'g WorkflowGraph {
        self.graph
    }

    pub fn node(&self, id: &str) -> Option<&'g GraphNode> {
        self.index.get(id).map(|&i| &self.graph.nodes[i])
    }

    /// Whether some edge references a node that does not exist.
    pub fn has_dangling_edges(&self) -> bool {
        self.dangling
    }

    pub fn is_back_edge(&self, edge: &GraphEdge) -> bool {
        self.graph
            .edges
            .iter()
            .position(|e| std::ptr::eq(e, edge) || e.id == edge.id)
            .is_some_and(|ei| self.back_edges.contains(&ei))
    }

    fn node_at(&self, i: usize) -> &'g GraphNode {
        &self.graph.nodes[i]
    }

    fn source_of(&self, ei: usize) -> usize {
        self.index[self.graph.edges[ei].source.as_str()]
    }

    fn target_of(&self, ei: usize) -> usize {
        self.index[self.graph.edges[ei].target.as_str()]
    }

    /// Handle an edge is taken under. A handle-less edge leaving a loop is its
    /// `done` edge.
    fn effective_handle(&self, ei: usize) -> Option<&'g str> {
        let edge = &self.graph.edges[ei];
        match edge.source_handle.as_deref() {
            Some(h) => Some(h),
            None if self.node_at(self.source_of(ei)).kind == NodeKind::Loop => Some(HANDLE_DONE),
            None => None,
        }
    }

    /// Incoming edges that gate readiness.
    fn gating_edges(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        let is_start = self.node_at(i).kind == NodeKind::Start;
        self.incoming[i]
            .iter()
            .copied()
            .filter(move |ei| !is_start && !self.back_edges.contains(ei))
    }

    fn is_start_like(&self, i: usize) -> bool {
        self.gating_edges(i).next().is_none()
    }

    /// Nodes with no incoming edges plus nodes typed `start`, in declaration
    /// order. Empty when the graph has dangling edges.
    pub fn start_nodes(&self) -> Vec<String> {
        if self.dangling {
            return vec![];
        }
        (0..self.graph.nodes.len())
            .filter(|&i| self.is_start_like(i))
            .map(|i| self.node_at(i).id.clone())
            .collect()
    }

    /// Nodes that can run given what has completed and which handles
    /// decision nodes chose.
    pub fn ready_nodes(
        &self,
        completed: &HashSet<String>,
        decisions: &HashMap<String, String>,
    ) -> Vec<String> {
        if self.dangling {
            return vec![];
        }
        let mut ready = Vec::new();
        let mut seen = HashSet::new();

        for i in 0..self.graph.nodes.len() {
            let id = &self.node_at(i).id;
            if self.is_start_like(i) && !completed.contains(id) && seen.insert(i) {
                ready.push(id.clone());
            }
        }

        for ei in 0..self.graph.edges.len() {
            if self.back_edges.contains(&ei) {
                continue;
            }
            let Some(&t) = self.index.get(self.graph.edges[ei].target.as_str()) else {
                continue;
            };
            if seen.contains(&t) || completed.contains(&self.node_at(t).id) {
                continue;
            }
            if self.is_ready(t, completed, decisions) {
                seen.insert(t);
                ready.push(self.node_at(t).id.clone());
            }
        }
        ready
    }

    fn is_ready(
        &self,
        i: usize,
        completed: &HashSet<String>,
        decisions: &HashMap<String, String>,
    ) -> bool {
        self.gating_edges(i).all(|ei| {
            let src = self.node_at(self.source_of(ei));
            if !completed.contains(&src.id) {
                return false;
            }
            match decisions.get(&src.id) {
                Some(choice) => self.effective_handle(ei) == Some(choice.as_str()),
                None => !src.kind.is_decision(),
            }
        })
    }

    /// Whether `node` can never become ready because an edge it depends on
    /// belongs to a handle its source did not choose.
    pub fn is_excluded(&self, node: &str, decisions: &HashMap<String, String>) -> bool {
        let Some(&i) = self.index.get(node) else {
            return false;
        };
        self.gating_edges(i).any(|ei| {
            let src = &self.node_at(self.source_of(ei)).id;
            decisions
                .get(src)
                .is_some_and(|choice| self.effective_handle(ei) != Some(choice.as_str()))
        })
    }

    /// Immediate successors in edge order.
    pub fn downstream(&self, node: &str) -> Vec<String> {
        self.successors(node, None)
    }

    /// Immediate successors through one handle.
    pub fn downstream_via(&self, node: &str, handle: &str) -> Vec<String> {
        self.successors(node, Some(handle))
    }

    fn successors(&self, node: &str, handle: Option<&str>) -> Vec<String> {
        let Some(&i) = self.index.get(node) else {
            return vec![];
        };
        let mut out: Vec<String> = Vec::new();
        for &ei in &self.outgoing[i] {
            if handle.is_some() && self.effective_handle(ei) != handle {
                continue;
            }
            let target = &self.graph.edges[ei].target;
            if !out.contains(target) {
                out.push(target.clone());
            }
        }
        out
    }

    /// Transitive successors, breadth-first. Back edges are not followed.
    pub fn all_downstream(&self, node: &str) -> Vec<String> {
        let Some(&i) = self.index.get(node) else {
            return vec![];
        };
        self.reach_from(self.forward_edges(i).map(|ei| self.target_of(ei)).collect())
            .into_iter()
            .map(|j| self.node_at(j).id.clone())
            .collect()
    }

    fn forward_edges(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.outgoing[i]
            .iter()
            .copied()
            .filter(|ei| !self.back_edges.contains(ei))
    }

    fn reach_from(&self, seeds: Vec<usize>) -> Vec<usize> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        for s in seeds {
            if visited.insert(s) {
                queue.push_back(s);
            }
        }
        while let Some(n) = queue.pop_front() {
            order.push(n);
            for ei in self.forward_edges(n) {
                let t = self.target_of(ei);
                if visited.insert(t) {
                    queue.push_back(t);
                }
            }
        }
        order
    }

    /// Whether `to` is reachable from `from` without following back edges.
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        self.all_downstream(from).iter().any(|n| n == to)
    }

    /// Handle a branch node takes for the current context. Never errors:
    /// a node without a branch spec, or one whose field is missing, takes
    /// `"false"`.
    pub fn evaluate_branch(node: &GraphNode, context: &ExecutionContext) -> &'static str {
        match &node.data.branch {
            Some(spec) if evaluate_branch_spec(spec, context) => HANDLE_TRUE,
            _ => HANDLE_FALSE,
        }
    }

    /// Whether a loop should run iteration `iteration` (0-based).
    /// `max_iterations` caps every loop type.
    pub fn should_continue_loop(node: &GraphNode, context: &ExecutionContext, iteration: u32) -> bool {
        let Some(spec) = &node.data.loop_spec else {
            return false;
        };
        if iteration >= spec.max_iterations {
            return false;
        }
        match spec.kind {
            LoopKind::While => spec
                .condition
                .as_deref()
                .is_some_and(|c| evaluate_condition(c, context)),
            LoopKind::Count => iteration < spec.count.unwrap_or(0),
            LoopKind::ForEach => {
                let len = spec
                    .collection
                    .as_deref()
                    .and_then(|c| context.get(c))
                    .and_then(Value::as_array)
                    .map(|a| a.len())
                    .unwrap_or(0);
                (iteration as usize) < len
            }
        }
    }

    /// Current element of a `for_each` loop, `None` when out of range.
    pub fn loop_item(node: &GraphNode, context: &ExecutionContext, iteration: u32) -> Option<Value> {
        let spec = node.data.loop_spec.as_ref()?;
        if spec.kind != LoopKind::ForEach {
            return None;
        }
        context
            .get(spec.collection.as_deref()?)?
            .as_array()?
            .get(iteration as usize)
            .cloned()
    }

    /// One representative path per back edge found by a three-colour DFS.
    /// Loop back edges count: use [`execution_order`](Self::execution_order)
    /// to check for illegal cycles.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let n = self.graph.nodes.len();
        let mut color = vec![Color::White; n];
        let mut cycles = Vec::new();
        // Explicit stack of (node, next outgoing edge); it doubles as the
        // current path, so depth is bounded by the heap.
        let mut stack: Vec<(usize, usize)> = Vec::new();
        for root in 0..n {
            if color[root] != Color::White {
                continue;
            }
            color[root] = Color::Gray;
            stack.push((root, 0));
            while let Some(frame) = stack.last_mut() {
                let (i, cursor) = *frame;
                let Some(&ei) = self.outgoing[i].get(cursor) else {
                    color[i] = Color::Black;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;
                let t = self.target_of(ei);
                match color[t] {
                    Color::White => {
                        color[t] = Color::Gray;
                        stack.push((t, 0));
                    }
                    Color::Gray => {
                        if let Some(pos) = stack.iter().position(|&(p, _)| p == t) {
                            cycles.push(
                                stack[pos..]
                                    .iter()
                                    .map(|&(p, _)| self.node_at(p).id.clone())
                                    .collect(),
                            );
                        }
                    }
                    Color::Black => {}
                }
            }
        }
        cycles
    }

    /// Kahn's algorithm over every edge. Fails on any cycle, loops included.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let cycles = self.detect_cycles();
        if let Some(cycle) = cycles.first() {
            return Err(WeftError::Structural(format!(
                "graph contains a cycle: {}",
                cycle.join(" -> ")
            )));
        }
        self.kahn(false).ok_or_else(|| {
            WeftError::Structural("graph contains a cycle".to_string())
        })
    }

    /// Topological order with loop back edges removed. Fails if a cycle
    /// remains, i.e. one that does not close through a loop node.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        self.kahn(true).ok_or_else(|| {
            let stuck: Vec<String> = self
                .detect_cycles()
                .into_iter()
                .map(|c| c.join(" -> "))
                .collect();
            WeftError::Structural(format!(
                "graph contains a cycle outside a loop node: {}",
                stuck.join("; ")
            ))
        })
    }

    fn kahn(&self, skip_back_edges: bool) -> Option<Vec<String>> {
        let n = self.graph.nodes.len();
        let counted = |ei: &usize| !(skip_back_edges && self.back_edges.contains(ei));
        let mut in_degree: Vec<usize> = (0..n)
            .map(|i| self.incoming[i].iter().filter(|ei| counted(ei)).count())
            .collect();
        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = queue.pop_front() {
            order.push(self.node_at(i).id.clone());
            for &ei in &self.outgoing[i] {
                if !counted(&ei) {
                    continue;
                }
                let t = self.target_of(ei);
                in_degree[t] -= 1;
                if in_degree[t] == 0 {
                    queue.push_back(t);
                }
            }
        }
        (order.len() == n).then_some(order)
    }

    /// Nodes inside a loop's body, in declaration order: reachable through
    /// its `body` edges and able to reach back to the loop.
    pub fn loop_body(&self, loop_id: &str) -> Vec<String> {
        let Some(&li) = self.index.get(loop_id) else {
            return vec![];
        };
        let body = self.body_of(li);
        (0..self.graph.nodes.len())
            .filter(|i| body.contains(i))
            .map(|i| self.node_at(i).id.clone())
            .collect()
    }

    fn body_of(&self, li: usize) -> HashSet<usize> {
        // Forward from the body edges, never passing through the loop itself.
        let mut forward = HashSet::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        for &ei in &self.outgoing[li] {
            if self.graph.edges[ei].source_handle.as_deref() == Some(HANDLE_BODY) {
                let t = self.target_of(ei);
                if t != li && forward.insert(t) {
                    queue.push_back(t);
                }
            }
        }
        while let Some(n) = queue.pop_front() {
            for &ei in &self.outgoing[n] {
                let t = self.target_of(ei);
                if t != li && forward.insert(t) {
                    queue.push_back(t);
                }
            }
        }

        // Backward from the loop.
        let mut backward = HashSet::new();
        let mut queue: VecDeque<usize> = VecDeque::new();
        for &ei in &self.incoming[li] {
            let s = self.source_of(ei);
            if s != li && backward.insert(s) {
                queue.push_back(s);
            }
        }
        while let Some(n) = queue.pop_front() {
            for &ei in &self.incoming[n] {
                let s = self.source_of(ei);
                if s != li && backward.insert(s) {
                    queue.push_back(s);
                }
            }
        }

        forward.intersection(&backward).copied().collect()
    }

    /// Sources of the back edges entering a loop, in edge order.
    pub fn loop_back_sources(&self, loop_id: &str) -> Vec<String> {
        let Some(&li) = self.index.get(loop_id) else {
            return vec![];
        };
        let mut out: Vec<String> = Vec::new();
        for &ei in &self.incoming[li] {
            if self.back_edges.contains(&ei) {
                let src = &self.graph.edges[ei].source;
                if !out.contains(src) {
                    out.push(src.clone());
                }
            }
        }
        out
    }

    /// Whether `a` and `b` sit on different handles of a common branch or
    /// loop node, so at most one of them runs at a time.
    pub fn are_exclusive(&self, a: &str, b: &str) -> bool {
        let (Some(&ai), Some(&bi)) = (self.index.get(a), self.index.get(b)) else {
            return false;
        };
        for (di, node) in self.graph.nodes.iter().enumerate() {
            if !node.kind.is_decision() {
                continue;
            }
            let mut by_handle: HashMap<&'g str, HashSet<usize>> = HashMap::new();
            for ei in self.forward_edges(di) {
                if let Some(h) = self.effective_handle(ei) {
                    let reach = self.reach_from(vec![self.target_of(ei)]);
                    by_handle.entry(h).or_default().extend(reach);
                }
            }
            let only = |x: usize| -> Option<&'g str> {
                let mut hit = by_handle.iter().filter(|(_, set)| set.contains(&x));
                match (hit.next(), hit.next()) {
                    (Some((h, _)), None) => Some(*h),
                    _ => None,
                }
            };
            if let (Some(ha), Some(hb)) = (only(ai), only(bi)) {
                if ha != hb {
                    return true;
                }
            }
        }
        false
    }

    /// Whether two distinct steps could be in flight at the same time.
    pub fn may_run_concurrently(&self, a: &str, b: &str) -> bool {
        a != b && !self.reaches(a, b) && !self.reaches(b, a) && !self.are_exclusive(a, b)
    }
}
