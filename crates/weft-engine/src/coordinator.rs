//! Convergence gate for coordinated-parallel wavefronts.
//!
//! Before a wavefront runs, every step with an agent role publishes an
//! [`Intent`]. A resolver compares intents and proposes adjustments; the
//! [`StabilityGate`] applies them and asks again until every intent is stable
//! or the pass budget runs out.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use weft_core::error::{Result, WeftError};
use weft_graph::GraphNode;

/// What a step about to run concurrently plans to do.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intent {
    pub step_id: String,
    pub agent_role: Option<String>,
    pub description: Option<String>,
    pub provides: BTreeSet<String>,
    pub requires: BTreeSet<String>,
    pub stability: f64,
    /// Step whose work this one will reuse, once decided.
    pub consumes: Option<String>,
    /// Tags dropped by earlier narrowing.
    pub narrowed: Vec<String>,
}

/// Tags a role provides.
pub fn role_provides(role: &str) -> Vec<String> {
    let tag = match role {
        "builder" => "implementation",
        "tester" => "testing",
        "architect" => "architecture",
        "reviewer" => "review",
        "researcher" => "research",
        "planner" => "planning",
        "writer" | "documenter" => "documentation",
        other => other,
    };
    vec![tag.to_string()]
}

/// Tags a role needs to exist before it can do useful work.
pub fn role_requires(role: &str) -> Vec<String> {
    match role {
        "tester" | "reviewer" => vec!["implementation".to_string()],
        "builder" => vec!["architecture".to_string()],
        _ => vec![],
    }
}

fn param_tags(params: &serde_json::Value, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => vec![],
    }
}

impl Intent {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            agent_role: None,
            description: None,
            provides: BTreeSet::new(),
            requires: BTreeSet::new(),
            stability: 0.0,
            consumes: None,
            narrowed: vec![],
        }
    }

    pub fn providing(mut self, tags: &[&str]) -> Self {
        self.provides.extend(tags.iter().map(|t| t.to_string()));
        self
    }

    pub fn requiring(mut self, tags: &[&str]) -> Self {
        self.requires.extend(tags.iter().map(|t| t.to_string()));
        self
    }

    /// Build the intent a node would publish, or `None` if it has nothing to
    /// coordinate (no role and no declared tags).
    pub fn for_node(node: &GraphNode) -> Option<Self> {
        let role = node.data.agent_role.clone();
        let mut intent = Self::new(node.id.clone());
        if let Some(r) = &role {
            intent.provides.extend(role_provides(r));
            intent.requires.extend(role_requires(r));
        }
        intent.provides.extend(param_tags(&node.data.params, "provides"));
        intent.requires.extend(param_tags(&node.data.params, "requires"));
        if role.is_none() && intent.provides.is_empty() && intent.requires.is_empty() {
            return None;
        }
        intent.agent_role = role;
        intent.description = node.data.description.clone();
        Some(intent)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Adjustment {
    Proceed,
    /// Drop the listed tags from the step's scope.
    Narrow { dropped: Vec<String> },
    /// Skip the step and reuse `source`'s output.
    ConsumeInstead { source: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub a: String,
    pub b: String,
    pub reason: String,
}

/// Output of one resolver pass.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub adjustments: HashMap<String, Adjustment>,
    pub conflicts: Vec<Conflict>,
    /// Stability in `[0, 1]` per step.
    pub stability: HashMap<String, f64>,
}

/// Compares intents and proposes adjustments.
pub trait IntentResolver: Send + Sync + 'static {
    fn resolve(&self, intents: &[Intent], pass: usize) -> Result<Resolution>;
}

/// Tag-overlap resolver.
///
/// Walking intents in order: a step whose tags are all covered by one earlier
/// step consumes that step's work; a partial overlap is narrowed away; a
/// requirement only a concurrent peer provides is a conflict.
pub struct OverlapResolver;

impl IntentResolver for OverlapResolver {
    fn resolve(&self, intents: &[Intent], _pass: usize) -> Result<Resolution> {
        let mut res = Resolution::default();

        for (i, intent) in intents.iter().enumerate() {
            if let Some(source) = &intent.consumes {
                res.adjustments.insert(
                    intent.step_id.clone(),
                    Adjustment::ConsumeInstead {
                        source: source.clone(),
                    },
                );
                res.stability.insert(intent.step_id.clone(), 1.0);
                continue;
            }

            let earlier: Vec<&Intent> = intents[..i]
                .iter()
                .filter(|e| e.consumes.is_none())
                .collect();

            let mut adjustment = Adjustment::Proceed;
            let mut stability = 1.0;

            if !intent.provides.is_empty() {
                if let Some(source) = earlier
                    .iter()
                    .find(|e| intent.provides.is_subset(&e.provides))
                {
                    adjustment = Adjustment::ConsumeInstead {
                        source: source.step_id.clone(),
                    };
                    stability = 0.9;
                } else {
                    let overlap: Vec<String> = intent
                        .provides
                        .iter()
                        .filter(|t| earlier.iter().any(|e| e.provides.contains(*t)))
                        .cloned()
                        .collect();
                    if !overlap.is_empty() {
                        adjustment = Adjustment::Narrow { dropped: overlap };
                        stability = 0.6;
                    }
                }
            }

            if matches!(adjustment, Adjustment::Proceed) {
                for tag in &intent.requires {
                    let peer = intents.iter().find(|p| {
                        p.step_id != intent.step_id
                            && p.consumes.is_none()
                            && p.provides.contains(tag)
                    });
                    if let Some(peer) = peer {
                        res.conflicts.push(Conflict {
                            a: intent.step_id.clone(),
                            b: peer.step_id.clone(),
                            reason: format!("requires '{}' which is still being produced", tag),
                        });
                        stability = f64::min(stability, 0.5);
                    }
                }
            }

            res.adjustments.insert(intent.step_id.clone(), adjustment);
            res.stability.insert(intent.step_id.clone(), stability);
        }
        Ok(res)
    }
}

/// Result of running the gate over one wavefront.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub converged: bool,
    pub passes: usize,
    pub mean_stability: f64,
    pub min_stability: f64,
    pub stability: HashMap<String, f64>,
    pub adjustments: HashMap<String, Adjustment>,
    pub conflicts: Vec<Conflict>,
    /// Tags dropped per step across all passes.
    pub narrowed: HashMap<String, Vec<String>>,
}

impl GateReport {
    fn empty() -> Self {
        Self {
            converged: true,
            passes: 0,
            mean_stability: 1.0,
            min_stability: 1.0,
            stability: HashMap::new(),
            adjustments: HashMap::new(),
            conflicts: vec![],
            narrowed: HashMap::new(),
        }
    }

    /// Source step whose output `step` should reuse instead of running.
    pub fn should_yield(&self, step: &str) -> Option<&str> {
        match self.adjustments.get(step) {
            Some(Adjustment::ConsumeInstead { source }) => Some(source.as_str()),
            _ => None,
        }
    }

    /// Yielded steps and their sources, sorted by step id.
    pub fn yielded(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .adjustments
            .iter()
            .filter_map(|(step, adj)| match adj {
                Adjustment::ConsumeInstead { source } => Some((step.clone(), source.clone())),
                _ => None,
            })
            .collect();
        out.sort();
        out
    }
}

/// Bounded, iterative reconciliation of intents.
pub struct StabilityGate {
    max_passes: usize,
    min_stability: f64,
    resolver: Arc<dyn IntentResolver>,
}

impl StabilityGate {
    pub fn new(max_passes: usize, min_stability: f64) -> Self {
        Self {
            max_passes,
            min_stability,
            resolver: Arc::new(OverlapResolver),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IntentResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Resolve until every step's stability reaches the threshold or the
    /// pass budget is spent. With no intents the gate converges at pass 0.
    pub fn run(&self, mut intents: Vec<Intent>) -> Result<GateReport> {
        if intents.is_empty() {
            return Ok(GateReport::empty());
        }

        let mut report = GateReport::empty();
        report.converged = false;
        let max_passes = self.max_passes.max(1);

        for pass in 1..=max_passes {
            let resolution = self
                .resolver
                .resolve(&intents, pass)
                .map_err(|e| WeftError::Coordination(e.to_string()))?;

            for intent in intents.iter_mut() {
                intent.stability = resolution
                    .stability
                    .get(&intent.step_id)
                    .copied()
                    .unwrap_or(0.0)
                    .clamp(0.0, 1.0);
                match resolution.adjustments.get(&intent.step_id) {
                    Some(Adjustment::Narrow { dropped }) => {
                        intent.provides.retain(|t| !dropped.contains(t));
                        intent.narrowed.extend(dropped.iter().cloned());
                    }
                    Some(Adjustment::ConsumeInstead { source }) => {
                        intent.consumes = Some(source.clone());
                    }
                    _ => {}
                }
            }

            report.passes = pass;
            report.adjustments = resolution.adjustments;
            report.conflicts = resolution.conflicts;

            let converged = intents.iter().all(|i| i.stability >= self.min_stability);
            debug!(pass, converged, "Stability gate pass");
            if converged {
                report.converged = true;
                break;
            }
        }

        // Narrowing is sticky; keep it visible in the final adjustments.
        for intent in &intents {
            if intent.narrowed.is_empty() {
                continue;
            }
            report
                .narrowed
                .insert(intent.step_id.clone(), intent.narrowed.clone());
            if matches!(report.adjustments.get(&intent.step_id), Some(Adjustment::Proceed) | None) {
                report.adjustments.insert(
                    intent.step_id.clone(),
                    Adjustment::Narrow {
                        dropped: intent.narrowed.clone(),
                    },
                );
            }
        }

        report.stability = intents
            .iter()
            .map(|i| (i.step_id.clone(), i.stability))
            .collect();
        report.min_stability = intents
            .iter()
            .map(|i| i.stability)
            .fold(f64::INFINITY, f64::min);
        report.mean_stability =
            intents.iter().map(|i| i.stability).sum::<f64>() / intents.len() as f64;

        info!(
            converged = report.converged,
            passes = report.passes,
            mean_stability = report.mean_stability,
            yielded = report.yielded().len(),
            "Coordination resolved"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_graph::NodeKind;

    #[test]
    fn test_intent_from_role() {
        let node = GraphNode::new("t", NodeKind::AgentCall)
            .with_role("tester")
            .with_params(serde_json::json!({"provides": ["coverage"]}));
        let intent = Intent::for_node(&node).unwrap();
        assert!(intent.provides.contains("testing"));
        assert!(intent.provides.contains("coverage"));
        assert!(intent.requires.contains("implementation"));

        let custom = GraphNode::new("c", NodeKind::AgentCall).with_role("translator");
        assert!(Intent::for_node(&custom).unwrap().provides.contains("translator"));

        let plain = GraphNode::new("p", NodeKind::Shell);
        assert!(Intent::for_node(&plain).is_none());
    }

    #[test]
    fn test_zero_publishers_converge_immediately() {
        let report = StabilityGate::new(3, 0.8).run(vec![]).unwrap();
        assert!(report.converged);
        assert_eq!(report.passes, 0);
    }

    #[test]
    fn test_all_stable_single_pass() {
        let intents = vec![
            Intent::new("a").providing(&["implementation"]),
            Intent::new("b").providing(&["documentation"]),
        ];
        let report = StabilityGate::new(3, 0.8).run(intents).unwrap();
        assert!(report.converged);
        assert_eq!(report.passes, 1);
        assert!((report.mean_stability - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duplicate_work_yields() {
        let intents = vec![
            Intent::new("build_a").providing(&["implementation"]),
            Intent::new("build_b").providing(&["implementation"]),
        ];
        let report = StabilityGate::new(3, 0.8).run(intents).unwrap();
        assert!(report.converged);
        assert_eq!(report.should_yield("build_b"), Some("build_a"));
        assert_eq!(report.should_yield("build_a"), None);
        assert_eq!(
            report.yielded(),
            vec![("build_b".to_string(), "build_a".to_string())]
        );
    }

    #[test]
    fn test_partial_overlap_narrows_then_settles() {
        let intents = vec![
            Intent::new("a").providing(&["implementation"]),
            Intent::new("b").providing(&["implementation", "documentation"]),
        ];
        let report = StabilityGate::new(3, 0.8).run(intents).unwrap();
        assert!(report.converged);
        assert_eq!(report.passes, 2);
        assert_eq!(report.narrowed["b"], vec!["implementation"]);
        assert!(matches!(report.adjustments["b"], Adjustment::Narrow { .. }));
    }

    #[test]
    fn test_unstable_exhausts_passes() {
        let intents = vec![
            Intent::new("build").providing(&["implementation"]),
            Intent::new("test").providing(&["testing"]).requiring(&["implementation"]),
        ];
        let report = StabilityGate::new(4, 0.8).run(intents).unwrap();
        assert!(!report.converged);
        assert_eq!(report.passes, 4);
        assert_eq!(report.conflicts.len(), 1);
        assert!((report.min_stability - 0.5).abs() < f64::EPSILON);
    }

    struct Broken;

    impl IntentResolver for Broken {
        fn resolve(&self, _intents: &[Intent], _pass: usize) -> Result<Resolution> {
            Err(WeftError::Coordination("resolver offline".into()))
        }
    }

    #[test]
    fn test_resolver_failure() {
        let gate = StabilityGate::new(2, 0.8).with_resolver(Arc::new(Broken));
        let err = gate.run(vec![Intent::new("a").providing(&["x"])]).unwrap_err();
        assert!(matches!(err, WeftError::Coordination(_)));
    }
}
