//! Step state machine and wavefront scheduler.
//!
//! The executor repeatedly asks the walker which nodes are ready, resolves
//! control nodes inline, and dispatches the remaining steps as one wavefront
//! to a bounded worker pool. Each task performs a single attempt; retries and
//! fallbacks are re-spawned from the scheduling loop, which is the only place
//! run state is mutated.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::checkpoint::{Checkpoint, RunSnapshot};
use weft_core::config::AppConfig;
use weft_core::context::ExecutionContext;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::{
    CheckpointStore, ComplexityClassifier, ContractRegistry, LogSink, StepInvocation, StepOutput,
    UsageHook,
};
use weft_core::types::*;
use weft_graph::condition::evaluate_condition;
use weft_graph::edge::{HANDLE_BODY, HANDLE_DONE};
use weft_graph::{
    GraphNode, GraphWalker, NodeKind, OnFailure, ReduceOp, WorkflowDescriptor, WorkflowGraph,
    WorkflowSettings,
};

use crate::coordinator::{Intent, IntentResolver, StabilityGate};
use crate::handlers::{run_with_timeout, DryRunHandler, HandlerRegistry};
use crate::retry::calculate_backoff;
use crate::run_log::EventSink;
use crate::state::StepResult;

/// Stage name of the checkpoint written when a run finishes.
pub const RUN_STAGE: &str = "_run";

/// Per-run inputs to [`Executor::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub inputs: HashMap<String, Value>,
    /// Task description handed to the complexity classifier.
    pub task: Option<String>,
    pub run_id: Option<RunId>,
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = Some(task.into());
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// An error recorded during a run, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

/// Final outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub workflow_id: String,
    pub status: RunStatus,
    pub resumed: bool,
    pub duration_ms: u64,
    pub usage: Usage,
    pub errors: Vec<RunError>,
    /// Every terminal step result, loop iterations included, in finish order.
    pub results: Vec<StepResult>,
    /// Pending steps blocked behind a failure.
    pub unreachable: Vec<String>,
    /// Pending steps behind a handle that was not chosen.
    pub not_taken: Vec<String>,
    /// Declared workflow outputs found in the final context.
    pub outputs: BTreeMap<String, Value>,
    #[serde(skip)]
    pub context: ExecutionContext,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Latest result of a step.
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.results.iter().rev().find(|r| r.step_id == step_id)
    }

    /// How many times a step reached a terminal status in this session.
    pub fn runs_of(&self, step_id: &str) -> usize {
        self.results.iter().filter(|r| r.step_id == step_id).count()
    }
}

/// Outcome of the precondition gate for one step.
#[derive(Debug)]
pub enum Precondition {
    Run,
    Skip(String),
    Fail(WeftError),
}

/// Checks applied just before dispatch, in order: condition, minimum
/// complexity, allowed roles, required context, input contract.
pub fn check_preconditions(
    node: &GraphNode,
    context: &ExecutionContext,
    classification: Option<&Classification>,
    contracts: Option<&dyn ContractRegistry>,
) -> Precondition {
    if let Some(expr) = &node.data.condition {
        if !evaluate_condition(expr, context) {
            return Precondition::Skip(format!("condition '{}' is false", expr));
        }
    }
    if let (Some(min), Some(c)) = (node.data.min_complexity, classification) {
        if min > c.tier {
            return Precondition::Skip(format!(
                "requires {} complexity, run is {}",
                min, c.tier
            ));
        }
    }
    if let (Some(c), Some(role)) = (classification, &node.data.agent_role) {
        if !c.allowed_roles.is_empty() && !c.allowed_roles.contains(role) {
            return Precondition::Skip(format!("role '{}' not allowed for this run", role));
        }
    }
    if let (Some(registry), Some(role)) = (contracts, &node.data.agent_role) {
        if let Some(contract) = registry.get_contract(role) {
            let missing: Vec<&str> = contract
                .required_context
                .iter()
                .filter(|key| !context.contains(key))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Precondition::Fail(WeftError::ContractViolation {
                    role: role.clone(),
                    direction: Direction::Input,
                    message: format!("missing context keys: {}", missing.join(", ")),
                });
            }
        }
        if let Err(e) = registry.validate(role, &node.data.params, Direction::Input) {
            return Precondition::Fail(e);
        }
    }
    Precondition::Run
}

/// Fold map-reduce item outputs.
pub fn reduce(op: ReduceOp, items: Vec<Value>) -> Value {
    match op {
        ReduceOp::Collect => Value::Array(items),
        ReduceOp::Concat => {
            if !items.is_empty() && items.iter().all(Value::is_string) {
                let parts: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
                return Value::String(parts.join("\n"));
            }
            let mut out = Vec::new();
            for item in items {
                match item {
                    Value::Array(inner) => out.extend(inner),
                    other => out.push(other),
                }
            }
            Value::Array(out)
        }
        ReduceOp::Merge => {
            let mut out = serde_json::Map::new();
            for item in items {
                if let Value::Object(map) = item {
                    out.extend(map);
                }
            }
            Value::Object(out)
        }
        ReduceOp::Sum => {
            if items.iter().all(|v| v.is_i64()) {
                Value::from(items.iter().filter_map(Value::as_i64).sum::<i64>())
            } else {
                Value::from(items.iter().filter_map(Value::as_f64).sum::<f64>())
            }
        }
    }
}

/// Effective limits of one run: workflow settings over engine config.
struct Limits {
    mode: ExecutionMode,
    width: usize,
    step_timeout: u64,
    run_timeout: Option<u64>,
    max_tokens: Option<u64>,
    max_passes: usize,
    min_stability: f64,
}

/// Mutable state of one run, owned by the scheduling loop.
struct RunState {
    run_id: RunId,
    workflow_id: String,
    completed: HashSet<String>,
    skipped: HashSet<String>,
    failed: HashSet<String>,
    decisions: HashMap<String, String>,
    loop_iterations: HashMap<String, u32>,
    attempts: HashMap<String, u32>,
    outputs: HashMap<String, Value>,
    context: Arc<ExecutionContext>,
    usage: Usage,
    /// Current result per step (current loop iteration only).
    results: HashMap<String, StepResult>,
    history: Vec<StepResult>,
    errors: Vec<RunError>,
    aborted: bool,
}

impl RunState {
    fn new(run_id: RunId, workflow_id: String, context: ExecutionContext) -> Self {
        Self {
            run_id,
            workflow_id,
            completed: HashSet::new(),
            skipped: HashSet::new(),
            failed: HashSet::new(),
            decisions: HashMap::new(),
            loop_iterations: HashMap::new(),
            attempts: HashMap::new(),
            outputs: HashMap::new(),
            context: Arc::new(context),
            usage: Usage::default(),
            results: HashMap::new(),
            history: Vec::new(),
            errors: Vec::new(),
            aborted: false,
        }
    }

    /// Failed steps are left out so a resumed run tries them again.
    fn restore(run_id: RunId, workflow_id: String, snapshot: RunSnapshot) -> Self {
        let mut state = Self::new(run_id, workflow_id, snapshot.context);
        state.completed = snapshot.completed.into_iter().collect();
        state.skipped = snapshot.skipped.into_iter().collect();
        state.decisions = snapshot.decisions.into_iter().collect();
        state.loop_iterations = snapshot.loop_iterations.into_iter().collect();
        state.attempts = snapshot.attempts.into_iter().collect();
        state.outputs = snapshot.outputs.into_iter().collect();
        state.usage = snapshot.usage;
        state
    }

    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            completed: self.completed.iter().cloned().collect(),
            skipped: self.skipped.iter().cloned().collect(),
            failed: self.failed.iter().cloned().collect(),
            decisions: self.decisions.clone().into_iter().collect(),
            loop_iterations: self.loop_iterations.clone().into_iter().collect(),
            attempts: self.attempts.clone().into_iter().collect(),
            outputs: self.outputs.clone().into_iter().collect(),
            context: (*self.context).clone(),
            usage: self.usage,
        }
    }

    fn record_error(&mut self, step_id: Option<&str>, message: impl Into<String>) {
        self.errors.push(RunError {
            step_id: step_id.map(String::from),
            message: message.into(),
        });
    }
}

/// Cancellation signals for one run.
///
/// `interrupt` fires on an external cancel or the run timer and is the only
/// token handlers see. `halt` is its child and additionally fires when a
/// failure aborts the run; it only stops work that has not reached a handler.
#[derive(Clone)]
struct RunSignals {
    interrupt: CancellationToken,
    halt: CancellationToken,
}

impl RunSignals {
    fn new(cancel: &CancellationToken) -> Self {
        let interrupt = cancel.child_token();
        let halt = interrupt.child_token();
        Self { interrupt, halt }
    }

    fn halted(&self) -> bool {
        self.halt.is_cancelled()
    }
}

/// One attempt as returned by a worker task.
struct Attempt {
    step_id: String,
    result: Result<StepOutput>,
    duration: Duration,
}

/// The part of the executor worker tasks need.
#[derive(Clone)]
struct Dispatcher {
    handlers: Arc<HandlerRegistry>,
    dry_run: bool,
}

impl Dispatcher {
    async fn invoke(
        &self,
        node: &GraphNode,
        invocation: StepInvocation,
        fallback: bool,
        timeout_secs: u64,
    ) -> Result<StepOutput> {
        match (&node.data.map, node.kind) {
            (Some(map), NodeKind::MapReduce) => {
                let items = match map_items(&invocation.context, &map.collection) {
                    Ok(items) => items,
                    Err(message) => return Err(WeftError::step(&node.id, message)),
                };
                let kind = map.step_type.clone();
                let concurrency = map.concurrency.max(1);
                let results: Vec<Result<StepOutput>> = futures::stream::iter(items.into_iter().map(|item| {
                    let mut inv = invocation.clone();
                    inv.kind = kind.clone();
                    inv.outputs = vec![];
                    inv.item = Some(item);
                    let kind = kind.clone();
                    async move { self.call(&kind, inv, fallback, timeout_secs).await }
                }))
                .buffered(concurrency)
                .collect()
                .await;

                let mut usage = Usage::default();
                let mut values = Vec::with_capacity(results.len());
                for (i, r) in results.into_iter().enumerate() {
                    let out = r.map_err(|e| match e {
                        WeftError::Cancelled => e,
                        e => WeftError::step(&node.id, format!("item {}: {}", i, e)),
                    })?;
                    if let Some(u) = out.usage {
                        usage.add(u);
                    }
                    values.push(out.value);
                }
                Ok(StepOutput {
                    value: reduce(map.reduce, values),
                    usage: (usage != Usage::default()).then_some(usage),
                })
            }
            _ => self.call(node.kind.as_str(), invocation, fallback, timeout_secs).await,
        }
    }

    async fn call(
        &self,
        kind: &str,
        invocation: StepInvocation,
        fallback: bool,
        timeout_secs: u64,
    ) -> Result<StepOutput> {
        if self.dry_run {
            return run_with_timeout(Arc::new(DryRunHandler), invocation, timeout_secs).await;
        }
        if fallback {
            return self
                .handlers
                .execute_fallback(kind, invocation, timeout_secs)
                .await;
        }
        if kind == NodeKind::Checkpoint.as_str() && !self.handlers.has(kind) {
            return Ok(StepOutput::new(
                serde_json::json!({ "checkpoint": invocation.step_id }),
            ));
        }
        self.handlers.execute(kind, invocation, timeout_secs).await
    }
}

fn map_items(context: &ExecutionContext, collection: &str) -> std::result::Result<Vec<Value>, String> {
    match context.get(collection) {
        None | Some(Value::Null) => Ok(vec![]),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(_) => Err(format!("collection '{}' is not an array", collection)),
    }
}

/// Workflow executor. Collaborators are handed in through [`ExecutorBuilder`].
pub struct Executor {
    config: AppConfig,
    handlers: Arc<HandlerRegistry>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    contracts: Option<Arc<dyn ContractRegistry>>,
    classifier: Option<Arc<dyn ComplexityClassifier>>,
    resolver: Option<Arc<dyn IntentResolver>>,
    usage_hook: Arc<dyn UsageHook>,
    log_sink: Arc<dyn LogSink>,
    event_bus: Arc<EventBus>,
    dry_run: bool,
}

pub struct ExecutorBuilder {
    config: AppConfig,
    handlers: HandlerRegistry,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    contracts: Option<Arc<dyn ContractRegistry>>,
    classifier: Option<Arc<dyn ComplexityClassifier>>,
    resolver: Option<Arc<dyn IntentResolver>>,
    usage_hook: Option<Arc<dyn UsageHook>>,
    log_sink: Option<Arc<dyn LogSink>>,
    event_bus: Option<Arc<EventBus>>,
    dry_run: bool,
}

impl ExecutorBuilder {
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn contracts(mut self, contracts: Arc<dyn ContractRegistry>) -> Self {
        self.contracts = Some(contracts);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ComplexityClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn IntentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn usage_hook(mut self, hook: Arc<dyn UsageHook>) -> Self {
        self.usage_hook = Some(hook);
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Replace every handler with the dry-run simulator.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Logs and usage go to the event bus unless a sink or hook was given.
    pub fn build(self) -> Executor {
        let event_bus = self.event_bus.unwrap_or_default();
        let sink = Arc::new(EventSink::new(event_bus.clone()));
        Executor {
            config: self.config,
            handlers: Arc::new(self.handlers),
            checkpoints: self.checkpoints,
            contracts: self.contracts,
            classifier: self.classifier,
            resolver: self.resolver,
            usage_hook: self.usage_hook.unwrap_or_else(|| sink.clone()),
            log_sink: self.log_sink.unwrap_or(sink),
            event_bus,
            dry_run: self.dry_run,
        }
    }
}

impl Executor {
    pub fn builder(handlers: HandlerRegistry) -> ExecutorBuilder {
        ExecutorBuilder {
            config: AppConfig::default(),
            handlers,
            checkpoints: None,
            contracts: None,
            classifier: None,
            resolver: None,
            usage_hook: None,
            log_sink: None,
            event_bus: None,
            dry_run: false,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Load, validate and run a workflow from scratch.
    ///
    /// Structural problems and missing required inputs are returned as
    /// errors; everything that happens once the run starts is reported in
    /// the [`RunReport`].
    pub async fn run(&self, workflow: &WorkflowDescriptor, options: RunOptions) -> Result<RunReport> {
        let graph = workflow.to_graph()?;
        let inputs = workflow.resolve_inputs(options.inputs.clone())?;
        let run_id = options.run_id.clone().unwrap_or_default();
        let state = RunState::new(run_id, workflow.id.clone(), ExecutionContext::from_inputs(inputs));
        self.drive(&graph, &workflow.settings, &workflow.outputs, state, options, false)
            .await
    }

    /// Run a prebuilt graph with engine defaults.
    pub async fn run_graph(&self, graph: &WorkflowGraph, options: RunOptions) -> Result<RunReport> {
        graph.validate()?;
        let run_id = options.run_id.clone().unwrap_or_default();
        let state = RunState::new(
            run_id,
            graph.id.clone(),
            ExecutionContext::from_inputs(options.inputs.clone()),
        );
        self.drive(graph, &WorkflowSettings::default(), &[], state, options, false)
            .await
    }

    /// Continue a run from its latest checkpoint. Steps that completed
    /// before the checkpoint are not executed again.
    pub async fn resume(
        &self,
        workflow: &WorkflowDescriptor,
        run_id: &RunId,
        options: RunOptions,
    ) -> Result<RunReport> {
        let store = self
            .checkpoints
            .as_ref()
            .ok_or_else(|| WeftError::Config("resume needs a checkpoint store".into()))?;
        let latest = store
            .load_latest(run_id)?
            .ok_or_else(|| WeftError::Config(format!("no checkpoint for run {}", run_id)))?;
        if latest.workflow_id != workflow.id {
            return Err(WeftError::Config(format!(
                "run {} belongs to workflow '{}', not '{}'",
                run_id, latest.workflow_id, workflow.id
            )));
        }
        if latest.run_status == Some(RunStatus::Success) {
            return Err(WeftError::Config(format!("run {} already succeeded", run_id)));
        }

        let graph = workflow.to_graph()?;
        info!(
            run_id = %run_id,
            stage = %latest.stage,
            completed = latest.state.completed.len(),
            "Resuming run from checkpoint"
        );
        let state = RunState::restore(run_id.clone(), workflow.id.clone(), latest.state);
        self.drive(&graph, &workflow.settings, &workflow.outputs, state, options, true)
            .await
    }

    fn limits(&self, settings: &WorkflowSettings, classification: Option<&Classification>) -> Limits {
        let mut width = settings.max_workers.unwrap_or(self.config.engine.max_workers);
        if let Some(max_agents) = classification.and_then(|c| c.max_agents) {
            width = width.min(max_agents);
        }
        Limits {
            mode: settings.mode.unwrap_or(self.config.engine.mode),
            width: width.max(1),
            step_timeout: settings
                .step_timeout_secs
                .unwrap_or(self.config.engine.step_timeout_secs),
            run_timeout: settings
                .budget
                .max_duration_secs
                .or(self.config.engine.run_timeout_secs),
            max_tokens: settings.budget.max_tokens,
            max_passes: settings
                .coordination
                .max_passes
                .unwrap_or(self.config.coordination.max_passes),
            min_stability: settings
                .coordination
                .min_stability
                .unwrap_or(self.config.coordination.min_stability),
        }
    }

    async fn classify(&self, task: Option<&str>) -> Option<Classification> {
        let (Some(classifier), Some(task)) = (&self.classifier, task) else {
            return None;
        };
        match classifier.classify(task).await {
            Ok(c) => {
                info!(tier = %c.tier, roles = c.allowed_roles.len(), "Task classified");
                Some(c)
            }
            Err(e) => {
                warn!(error = %e, "Complexity classification failed, running unclassified");
                None
            }
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        self.event_bus.publish(event);
    }

    fn log(&self, run_id: &RunId, step_id: Option<&str>, level: LogLevel, message: &str) {
        self.log_sink.record_log(run_id, step_id, level, message);
    }

    async fn drive(
        &self,
        graph: &WorkflowGraph,
        settings: &WorkflowSettings,
        workflow_outputs: &[String],
        mut state: RunState,
        options: RunOptions,
        resumed: bool,
    ) -> Result<RunReport> {
        let walker = graph.walker();
        let order = walker.execution_order()?;
        let rank: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let started = Instant::now();
        let run_id = state.run_id.clone();
        let classification = self.classify(options.task.as_deref()).await;
        let limits = self.limits(settings, classification.as_ref());

        let cancel = options.cancel.unwrap_or_default();
        let signals = RunSignals::new(&cancel);
        let timed_out = Arc::new(AtomicBool::new(false));
        let timer = limits.run_timeout.map(|secs| {
            let interrupt = signals.interrupt.clone();
            let flag = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                flag.store(true, Ordering::SeqCst);
                interrupt.cancel();
            })
        });

        info!(
            run_id = %run_id,
            workflow = %graph.id,
            mode = %limits.mode,
            workers = limits.width,
            resumed,
            "Run started"
        );
        self.emit(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            workflow_id: state.workflow_id.clone(),
            resumed,
        });

        let mut wavefront = 0usize;
        loop {
            if signals.halted() || state.aborted {
                break;
            }
            if let Some(max) = limits.max_tokens {
                if state.usage.tokens > max {
                    warn!(run_id = %run_id, used = state.usage.tokens, max, "Token budget exceeded");
                    state.record_error(None, "token budget exceeded");
                    state.aborted = true;
                    break;
                }
            }

            let ready = self.ready(&walker, &state);
            if self.advance_loops(&walker, &mut state, &ready) {
                continue;
            }
            if ready.is_empty() {
                break;
            }

            let (control, work): (Vec<String>, Vec<String>) = ready
                .into_iter()
                .partition(|id| walker.node(id).is_some_and(|n| n.kind.is_control()));
            if !control.is_empty() {
                for id in control {
                    if let Some(node) = walker.node(&id) {
                        self.resolve_control(&walker, &mut state, node);
                    }
                }
                continue;
            }

            let batch = match limits.mode {
                ExecutionMode::Sequential => {
                    let mut work = work;
                    work.sort_by_key(|id| rank.get(id.as_str()).copied().unwrap_or(usize::MAX));
                    work.truncate(1);
                    work
                }
                _ => work,
            };
            self.run_wavefront(
                &walker,
                &mut state,
                batch,
                wavefront,
                &limits,
                classification.as_ref(),
                &signals,
            )
            .await;
            wavefront += 1;
        }

        if let Some(timer) = timer {
            timer.abort();
        }

        let status = if cancel.is_cancelled() {
            RunStatus::Cancelled
        } else if timed_out.load(Ordering::SeqCst) {
            let secs = limits.run_timeout.unwrap_or_default();
            state.record_error(None, format!("run timed out after {}s", secs));
            RunStatus::Failed
        } else if state.aborted {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };

        let (not_taken, pending) = self.classify_pending(&walker, &state, &order);
        let unreachable = if status == RunStatus::Success {
            pending
        } else {
            let reason = match status {
                RunStatus::Cancelled => "run cancelled",
                _ => "run aborted",
            };
            for id in &pending {
                let mut result = StepResult::new(id);
                if result.cancel(reason).is_ok() {
                    self.emit(WorkflowEvent::StepFinished {
                        run_id: run_id.clone(),
                        step_id: id.clone(),
                        status: StepStatus::Cancelled,
                        duration_ms: 0,
                        error: None,
                    });
                    state.history.push(result);
                }
            }
            vec![]
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.save_checkpoint(
            &state,
            Checkpoint {
                run_id: run_id.clone(),
                workflow_id: state.workflow_id.clone(),
                stage: RUN_STAGE.to_string(),
                status: match status {
                    RunStatus::Success => StepStatus::Success,
                    RunStatus::Failed => StepStatus::Failed,
                    RunStatus::Cancelled => StepStatus::Cancelled,
                },
                attempt: 0,
                input: Value::Null,
                output: None,
                error: state.errors.last().map(|e| e.message.clone()),
                tokens: state.usage.tokens,
                cost: state.usage.cost,
                duration_ms,
                timestamp: Utc::now(),
                state: state.snapshot(),
                run_status: Some(status),
            },
        );

        info!(
            run_id = %run_id,
            status = %status,
            duration_ms,
            steps = state.history.len(),
            errors = state.errors.len(),
            tokens = state.usage.tokens,
            "Run finished"
        );
        self.emit(WorkflowEvent::RunFinished {
            run_id: run_id.clone(),
            status,
            duration_ms,
            usage: state.usage,
        });

        let outputs = workflow_outputs
            .iter()
            .filter_map(|k| state.context.get(k).map(|v| (k.clone(), v.clone())))
            .collect();

        Ok(RunReport {
            run_id,
            workflow_id: state.workflow_id.clone(),
            status,
            resumed,
            duration_ms,
            usage: state.usage,
            errors: state.errors,
            results: state.history,
            unreachable,
            not_taken,
            outputs,
            context: (*state.context).clone(),
        })
    }

    /// Ready nodes that do not already have a result for this iteration.
    fn ready(&self, walker: &GraphWalker<'_>, state: &RunState) -> Vec<String> {
        walker
            .ready_nodes(&state.completed, &state.decisions)
            .into_iter()
            .filter(|id| !state.results.contains_key(id))
            .collect()
    }

    fn iteration_of(&self, walker: &GraphWalker<'_>, state: &RunState, step_id: &str) -> u32 {
        walker
            .graph()
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Loop)
            .find(|n| walker.loop_body(&n.id).iter().any(|b| b == step_id))
            .and_then(|n| state.loop_iterations.get(&n.id).copied())
            .unwrap_or(0)
    }

    fn resolve_control(&self, walker: &GraphWalker<'_>, state: &mut RunState, node: &GraphNode) {
        let mut result =
            StepResult::new(&node.id).with_iteration(self.iteration_of(walker, state, &node.id));
        let output = match node.kind {
            NodeKind::Branch => {
                let handle = GraphWalker::evaluate_branch(node, &state.context);
                debug!(step_id = %node.id, handle, "Branch resolved");
                state.decisions.insert(node.id.clone(), handle.to_string());
                serde_json::json!({ "handle": handle })
            }
            NodeKind::Loop => {
                let iteration = state.loop_iterations.get(&node.id).copied().unwrap_or(0);
                let handle = self.enter_loop_iteration(state, node, iteration);
                serde_json::json!({ "handle": handle, "iteration": iteration })
            }
            _ => Value::Null,
        };
        if result.start().and_then(|_| result.succeed(output)).is_err() {
            return;
        }
        self.finish(walker, state, result, &Value::Null, true);
    }

    /// Decide whether a loop runs `iteration`, publishing its iteration
    /// counter and current item when it does.
    fn enter_loop_iteration(&self, state: &mut RunState, node: &GraphNode, iteration: u32) -> &'static str {
        state.loop_iterations.insert(node.id.clone(), iteration);
        if !GraphWalker::should_continue_loop(node, &state.context, iteration) {
            debug!(step_id = %node.id, iteration, "Loop done");
            state.decisions.insert(node.id.clone(), HANDLE_DONE.to_string());
            return HANDLE_DONE;
        }
        self.begin_iteration(state, node, iteration);
        HANDLE_BODY
    }

    fn begin_iteration(&self, state: &mut RunState, node: &GraphNode, iteration: u32) {
        state.loop_iterations.insert(node.id.clone(), iteration);
        let item = GraphWalker::loop_item(node, &state.context, iteration).unwrap_or(Value::Null);
        let ctx = Arc::make_mut(&mut state.context);
        for (key, value) in [
            (format!("{}.iteration", node.id), Value::from(iteration)),
            (format!("{}.item", node.id), item),
        ] {
            if let Err(e) = ctx.publish(key, value, &node.id) {
                warn!(step_id = %node.id, error = %e, "Failed to publish loop variable");
            }
        }
        debug!(step_id = %node.id, iteration, "Loop iteration");
        state.decisions.insert(node.id.clone(), HANDLE_BODY.to_string());
    }

    /// Move a loop whose body finished the current iteration on to the next
    /// one, or to its done side. The continuation test sees the body's
    /// outputs; they are only retracted when the body runs again. Returns
    /// true when some loop advanced.
    fn advance_loops(&self, walker: &GraphWalker<'_>, state: &mut RunState, ready: &[String]) -> bool {
        for node in walker.graph().nodes.iter().filter(|n| n.kind == NodeKind::Loop) {
            let in_body = state.completed.contains(&node.id)
                && state.decisions.get(&node.id).map(String::as_str) == Some(HANDLE_BODY);
            if !in_body {
                continue;
            }
            let back_sources: Vec<String> = walker
                .loop_back_sources(&node.id)
                .into_iter()
                .filter(|s| s != &node.id)
                .collect();
            if !back_sources.iter().any(|s| state.completed.contains(s)) {
                continue;
            }
            let body = walker.loop_body(&node.id);
            if body.iter().any(|b| ready.contains(b)) {
                continue;
            }

            let next = state.loop_iterations.get(&node.id).copied().unwrap_or(0) + 1;
            if !GraphWalker::should_continue_loop(node, &state.context, next) {
                state.loop_iterations.insert(node.id.clone(), next);
                state.decisions.insert(node.id.clone(), HANDLE_DONE.to_string());
                info!(step_id = %node.id, iterations = next, "Loop done");
                return true;
            }

            let ctx = Arc::make_mut(&mut state.context);
            for step in &body {
                state.results.remove(step);
                state.completed.remove(step);
                state.skipped.remove(step);
                state.failed.remove(step);
                state.decisions.remove(step);
                state.loop_iterations.remove(step);
                state.attempts.remove(step);
                state.outputs.remove(step);
                ctx.retract_owned_by(step);
            }
            self.begin_iteration(state, node, next);
            info!(step_id = %node.id, iteration = next, "Loop advanced");
            return true;
        }
        false
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_wavefront(
        &self,
        walker: &GraphWalker<'_>,
        state: &mut RunState,
        batch: Vec<String>,
        index: usize,
        limits: &Limits,
        classification: Option<&Classification>,
        signals: &RunSignals,
    ) {
        let run_id = state.run_id.clone();
        debug!(run_id = %run_id, index, steps = ?batch, "Wavefront");
        self.emit(WorkflowEvent::WavefrontStarted {
            run_id: run_id.clone(),
            index,
            steps: batch.clone(),
        });

        let mut batch = batch;
        let mut yields: Vec<(String, String)> = Vec::new();
        let mut narrowed: HashMap<String, Vec<String>> = HashMap::new();

        if limits.mode == ExecutionMode::CoordinatedParallel {
            let intents: Vec<Intent> = batch
                .iter()
                .filter_map(|id| walker.node(id))
                .filter_map(Intent::for_node)
                .collect();
            let mut gate = StabilityGate::new(limits.max_passes, limits.min_stability);
            if let Some(resolver) = &self.resolver {
                gate = gate.with_resolver(resolver.clone());
            }
            match gate.run(intents) {
                Ok(report) => {
                    let yielded = report.yielded();
                    self.emit(WorkflowEvent::CoordinationResolved {
                        run_id: run_id.clone(),
                        converged: report.converged,
                        passes: report.passes,
                        yielded: yielded.iter().map(|(s, _)| s.clone()).collect(),
                    });
                    if !report.converged {
                        self.log(
                            &run_id,
                            None,
                            LogLevel::Warn,
                            &format!(
                                "coordination did not converge after {} passes (min stability {:.2})",
                                report.passes, report.min_stability
                            ),
                        );
                    }
                    for (step, source) in yielded {
                        let Some(node) = walker.node(&step) else {
                            continue;
                        };
                        let mut result = StepResult::new(&step)
                            .with_iteration(self.iteration_of(walker, state, &step));
                        if result.skip(format!("yielded to {}", source)).is_ok() {
                            self.finish(walker, state, result, &node.data.params, false);
                        }
                        batch.retain(|s| s != &step);
                        yields.push((step, source));
                    }
                    narrowed = report.narrowed;
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Coordination failed, dispatching uncoordinated");
                    self.log(&run_id, None, LogLevel::Warn, &e.to_string());
                }
            }
        }

        let mut dispatch: Vec<&GraphNode> = Vec::new();
        for id in &batch {
            let Some(node) = walker.node(id) else {
                continue;
            };
            let iteration = self.iteration_of(walker, state, id);
            match check_preconditions(node, &state.context, classification, self.contracts.as_deref()) {
                Precondition::Run => dispatch.push(node),
                Precondition::Skip(reason) => {
                    info!(step_id = %id, reason = %reason, "Step skipped");
                    let mut result = StepResult::new(id).with_iteration(iteration);
                    if result.skip(reason).is_ok() {
                        self.finish(walker, state, result, &node.data.params, false);
                    }
                }
                Precondition::Fail(err) => {
                    let mut result = StepResult::new(id).with_iteration(iteration);
                    let message = err.to_string();
                    if result.fail(&message).is_ok() {
                        self.fail_step(walker, state, node, result, message, &signals.halt);
                    }
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(limits.width));
        let mut tasks: JoinSet<Attempt> = JoinSet::new();
        let mut params: HashMap<String, Value> = HashMap::new();

        for node in dispatch {
            if signals.halted() {
                break;
            }
            let mut node_params = node.data.params.clone();
            if let Some(dropped) = narrowed.get(&node.id) {
                if node_params.is_null() {
                    node_params = Value::Object(Default::default());
                }
                if let Some(obj) = node_params.as_object_mut() {
                    obj.insert("narrowed".into(), serde_json::json!(dropped));
                }
            }
            let result = StepResult::new(&node.id)
                .with_iteration(self.iteration_of(walker, state, &node.id));
            params.insert(node.id.clone(), node_params);
            state.results.insert(node.id.clone(), result);
            self.spawn_attempt(
                &mut tasks,
                state,
                &semaphore,
                node,
                &params[&node.id],
                false,
                Duration::ZERO,
                limits.step_timeout,
                signals,
            );
        }

        while let Some(joined) = tasks.join_next().await {
            let attempt = match joined {
                Ok(a) => a,
                Err(e) => {
                    error!(error = %e, "Step task failed to join");
                    continue;
                }
            };
            let Some(node) = walker.node(&attempt.step_id) else {
                continue;
            };
            let Some(mut result) = state.results.remove(&attempt.step_id) else {
                continue;
            };
            result.duration_ms += attempt.duration.as_millis() as u64;
            let input = params.get(&node.id).cloned().unwrap_or(Value::Null);

            let failure = match attempt.result {
                Ok(output) => match self.accept_output(state, node, &output) {
                    Ok(()) => {
                        if let Some(u) = output.usage {
                            result.usage.add(u);
                            state.usage.add(u);
                            self.usage_hook.record_usage(&run_id, &node.id, u.tokens, u.cost);
                        }
                        if result.succeed(output.value).is_ok() {
                            self.finish(walker, state, result, &input, false);
                        }
                        continue;
                    }
                    Err(e) => e,
                },
                Err(WeftError::Cancelled) => {
                    if result.cancel("run cancelled").is_ok() {
                        self.finish(walker, state, result, &input, false);
                    }
                    continue;
                }
                Err(e) => e,
            };

            let message = failure.to_string();
            let attempts = state.attempts.get(&node.id).copied().unwrap_or(0);
            let max_retries = node.data.max_retries.unwrap_or(self.config.retry.max_retries);

            if node.data.on_failure == OnFailure::Retry
                && failure.is_retryable()
                && attempts <= max_retries
                && !signals.halted()
                && result.retrying(&message).is_ok()
            {
                let delay = calculate_backoff(attempts.saturating_sub(1), &self.config.retry);
                warn!(
                    step_id = %node.id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Step failed, retrying"
                );
                self.emit(WorkflowEvent::StepRetrying {
                    run_id: run_id.clone(),
                    step_id: node.id.clone(),
                    attempt: attempts,
                    error: message.clone(),
                });
                self.checkpoint_step(state, &result, &input);
                state.results.insert(node.id.clone(), result);
                self.spawn_attempt(
                    &mut tasks,
                    state,
                    &semaphore,
                    node,
                    &input,
                    false,
                    delay,
                    limits.step_timeout,
                    signals,
                );
                continue;
            }

            let has_fallback = self.dry_run || self.handlers.get_fallback(node.kind.as_str()).is_some();
            if node.data.on_failure == OnFailure::Fallback
                && !result.fallback_used
                && has_fallback
                && !signals.halted()
                && result.retrying(&message).is_ok()
            {
                warn!(step_id = %node.id, error = %message, "Step failed, using fallback handler");
                result.fallback_used = true;
                state.results.insert(node.id.clone(), result);
                self.spawn_attempt(
                    &mut tasks,
                    state,
                    &semaphore,
                    node,
                    &input,
                    true,
                    Duration::ZERO,
                    limits.step_timeout,
                    signals,
                );
                continue;
            }

            if result.fail(&message).is_ok() {
                self.fail_step(walker, state, node, result, message, &signals.halt);
            }
        }

        // Steps whose task vanished without reporting back.
        let lost: Vec<String> = state
            .results
            .iter()
            .filter(|(_, r)| !r.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in lost {
            if let (Some(node), Some(mut result)) = (walker.node(&id), state.results.remove(&id)) {
                let message = "step task ended without a result".to_string();
                if result.fail(&message).is_ok() {
                    self.fail_step(walker, state, node, result, message, &signals.halt);
                }
            }
        }

        for (step, source) in yields {
            self.alias_yielded(walker, state, &step, &source);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_attempt(
        &self,
        tasks: &mut JoinSet<Attempt>,
        state: &mut RunState,
        semaphore: &Arc<Semaphore>,
        node: &GraphNode,
        params: &Value,
        fallback: bool,
        delay: Duration,
        default_timeout: u64,
        signals: &RunSignals,
    ) {
        let attempt = {
            let n = state.attempts.entry(node.id.clone()).or_default();
            *n += 1;
            *n
        };
        if let Some(result) = state.results.get_mut(&node.id) {
            if let Err(e) = result.start() {
                warn!(step_id = %node.id, error = %e, "Could not start step");
            }
        }
        self.emit(WorkflowEvent::StepStarted {
            run_id: state.run_id.clone(),
            step_id: node.id.clone(),
            attempt,
        });

        let halt = signals.halt.clone();
        let invocation = StepInvocation {
            run_id: state.run_id.clone(),
            step_id: node.id.clone(),
            kind: node.kind.as_str().to_string(),
            params: params.clone(),
            outputs: node.data.outputs.clone(),
            agent_role: node.data.agent_role.clone(),
            context: state.context.clone(),
            attempt,
            item: None,
            cancel: signals.interrupt.child_token(),
        };
        let dispatcher = Dispatcher {
            handlers: self.handlers.clone(),
            dry_run: self.dry_run,
        };
        let semaphore = semaphore.clone();
        let node = node.clone();
        let timeout = node.data.timeout.unwrap_or(default_timeout);

        tasks.spawn(async move {
            let step_id = node.id.clone();
            let cancelled = |step_id| Attempt {
                step_id,
                result: Err(WeftError::Cancelled),
                duration: Duration::ZERO,
            };
            if !delay.is_zero() {
                tokio::select! {
                    _ = halt.cancelled() => return cancelled(step_id),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let _permit = tokio::select! {
                biased;
                _ = halt.cancelled() => return cancelled(step_id),
                permit = semaphore.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return cancelled(step_id),
                },
            };
            // Past this point the handler owns the attempt; it sees
            // cancellation only through its invocation token.
            let started = Instant::now();
            let result = AssertUnwindSafe(dispatcher.invoke(&node, invocation, fallback, timeout))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(WeftError::step(&step_id, "handler panicked")));
            Attempt {
                step_id,
                result,
                duration: started.elapsed(),
            }
        });
    }

    /// Output contract check plus context ingestion.
    fn accept_output(&self, state: &mut RunState, node: &GraphNode, output: &StepOutput) -> Result<()> {
        if !self.dry_run {
            if let (Some(contracts), Some(role)) = (&self.contracts, &node.data.agent_role) {
                contracts.validate(role, &output.value, Direction::Output)?;
            }
        }
        let run_id = state.run_id.clone();
        let ctx = Arc::make_mut(&mut state.context);
        let conflicts = ctx.ingest_output(&node.id, &node.data.outputs, &output.value);
        for conflict in conflicts {
            warn!(run_id = %run_id, step_id = %node.id, error = %conflict, "Skipped output key");
            self.log(&run_id, Some(&node.id), LogLevel::Warn, &conflict.to_string());
        }
        state.outputs.insert(node.id.clone(), output.value.clone());
        Ok(())
    }

    /// Record a final failure and apply the failure policy. Anything but
    /// `continue` halts the run: steps not yet handed to a handler are
    /// cancelled, in-flight ones finish.
    fn fail_step(
        &self,
        walker: &GraphWalker<'_>,
        state: &mut RunState,
        node: &GraphNode,
        result: StepResult,
        message: String,
        halt: &CancellationToken,
    ) {
        state.record_error(Some(node.id.as_str()), message.clone());
        let input = node.data.params.clone();
        self.finish(walker, state, result, &input, false);
        if node.data.on_failure == OnFailure::Continue {
            warn!(step_id = %node.id, error = %message, "Step failed, continuing");
            return;
        }
        error!(step_id = %node.id, error = %message, policy = ?node.data.on_failure, "Step failed, aborting run");
        state.aborted = true;
        halt.cancel();
    }

    /// Publish a yielded step's declared outputs from its source's output.
    fn alias_yielded(&self, walker: &GraphWalker<'_>, state: &mut RunState, step: &str, source: &str) {
        let succeeded = state
            .results
            .get(source)
            .is_some_and(|r| r.status == StepStatus::Success);
        let (Some(node), Some(output), true) = (walker.node(step), state.outputs.get(source).cloned(), succeeded) else {
            return;
        };
        let ctx = Arc::make_mut(&mut state.context);
        for key in &node.data.outputs {
            if ctx.contains(key) {
                continue;
            }
            let value = output
                .as_object()
                .and_then(|o| o.get(key))
                .cloned()
                .unwrap_or_else(|| output.clone());
            if let Err(e) = ctx.publish(key.clone(), value, step) {
                warn!(step_id = %step, error = %e, "Failed to alias yielded output");
            }
        }
    }

    /// Bookkeeping for a terminal result: sets, status key, events,
    /// checkpoint, progress.
    fn finish(
        &self,
        walker: &GraphWalker<'_>,
        state: &mut RunState,
        result: StepResult,
        input: &Value,
        control: bool,
    ) {
        let id = result.step_id.clone();
        let status_value = match result.status {
            StepStatus::Success => {
                state.completed.insert(id.clone());
                Some("success")
            }
            StepStatus::Skipped => {
                state.completed.insert(id.clone());
                state.skipped.insert(id.clone());
                Some("skipped")
            }
            StepStatus::Failed => {
                state.failed.insert(id.clone());
                Some("failure")
            }
            _ => None,
        };
        if let (Some(value), false) = (status_value, control) {
            let ctx = Arc::make_mut(&mut state.context);
            if let Err(e) = ctx.publish(format!("{}_status", id), Value::from(value), &id) {
                warn!(step_id = %id, error = %e, "Failed to publish step status");
            }
        }

        match result.status {
            StepStatus::Failed => self.log(
                &state.run_id,
                Some(id.as_str()),
                LogLevel::Error,
                result.error.as_deref().unwrap_or("failed"),
            ),
            StepStatus::Skipped | StepStatus::Cancelled => self.log(
                &state.run_id,
                Some(id.as_str()),
                LogLevel::Info,
                result.reason.as_deref().unwrap_or(result.status.as_str()),
            ),
            _ => {}
        }
        if !control {
            info!(
                step_id = %id,
                status = %result.status,
                attempts = result.attempt_count,
                duration_ms = result.duration_ms,
                "Step finished"
            );
        }
        self.emit(WorkflowEvent::StepFinished {
            run_id: state.run_id.clone(),
            step_id: id.clone(),
            status: result.status,
            duration_ms: result.duration_ms,
            error: result.error.clone(),
        });

        state.history.push(result.clone());
        if !control {
            self.checkpoint_step(state, &result, input);
        }
        state.results.insert(id.clone(), result);

        let total = walker.graph().nodes.len().max(1);
        let done = state
            .results
            .values()
            .filter(|r| r.is_terminal())
            .count()
            .max(state.completed.len());
        let percent = (done as f64 / total as f64 * 100.0).min(100.0);
        self.log_sink.record_progress(&state.run_id, percent, Some(id.as_str()));
    }

    fn checkpoint_step(&self, state: &RunState, result: &StepResult, input: &Value) {
        if self.checkpoints.is_none() {
            return;
        }
        self.save_checkpoint(
            state,
            Checkpoint {
                run_id: state.run_id.clone(),
                workflow_id: state.workflow_id.clone(),
                stage: result.step_id.clone(),
                status: result.status,
                attempt: state.attempts.get(&result.step_id).copied().unwrap_or(0),
                input: input.clone(),
                output: result.output.clone(),
                error: result.error.clone(),
                tokens: result.usage.tokens,
                cost: result.usage.cost,
                duration_ms: result.duration_ms,
                timestamp: Utc::now(),
                state: state.snapshot(),
                run_status: None,
            },
        );
    }

    /// Durability is best-effort: failures are logged and the run goes on.
    fn save_checkpoint(&self, state: &RunState, checkpoint: Checkpoint) {
        let Some(store) = &self.checkpoints else {
            return;
        };
        if let Err(e) = store.save(&checkpoint) {
            let e = WeftError::CheckpointWrite(e.to_string());
            warn!(run_id = %state.run_id, stage = %checkpoint.stage, error = %e, "Checkpoint write failed");
            self.log(&state.run_id, Some(checkpoint.stage.as_str()), LogLevel::Warn, &e.to_string());
        }
    }

    /// Split steps without a result into those behind an unchosen handle
    /// and those blocked by a failure.
    fn classify_pending(
        &self,
        walker: &GraphWalker<'_>,
        state: &RunState,
        order: &[String],
    ) -> (Vec<String>, Vec<String>) {
        let ran: HashSet<&str> = state.history.iter().map(|r| r.step_id.as_str()).collect();
        let graph = walker.graph();
        let mut not_taken: Vec<String> = Vec::new();
        let mut pending = Vec::new();

        for id in order {
            if state.results.contains_key(id) || state.completed.contains(id) || ran.contains(id.as_str()) {
                continue;
            }
            let is_start = walker.node(id).is_some_and(|n| n.kind == NodeKind::Start);
            let behind_dead = !is_start
                && graph
                    .edges
                    .iter()
                    .filter(|e| &e.target == id && !walker.is_back_edge(e))
                    .any(|e| not_taken.contains(&e.source));
            if walker.is_excluded(id, &state.decisions) || behind_dead {
                not_taken.push(id.clone());
            } else {
                pending.push(id.clone());
            }
        }
        (not_taken, pending)
    }
}
