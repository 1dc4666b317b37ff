use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use weft_core::traits::{CheckpointStore, RoleContract};
use weft_core::types::{
    Classification, ComplexityTier, ExecutionMode, LogLevel, RunId, RunStatus, StepStatus,
    WorkflowEvent,
};
use weft_core::WeftError;
use weft_engine::{
    Executor, HandlerRegistry, MemoryCheckpointStore, RunOptions, SchemaContractRegistry,
    SqliteCheckpointStore,
};
use weft_test_utils::*;

fn executor(handlers: HandlerRegistry) -> Executor {
    Executor::builder(handlers).config(fast_config()).build()
}

fn recording_shell() -> (HandlerRegistry, Arc<RecordingHandler>) {
    let recorder = RecordingHandler::new();
    let mut handlers = HandlerRegistry::new();
    handlers.register_arc("shell", recorder.clone());
    (handlers, recorder)
}

#[tokio::test]
async fn test_linear_workflow_runs_in_order() {
    let (handlers, recorder) = recording_shell();
    let report = executor(handlers)
        .run(&workflow(LINEAR), RunOptions::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert!(report.errors.is_empty());
    assert_eq!(recorder.steps(), vec!["a", "b", "c"]);
    assert_eq!(report.context.get("a_out"), Some(&json!({"step": "a", "attempt": 1})));
    assert_eq!(report.context.get("c_status"), Some(&json!("success")));
    assert!(report.unreachable.is_empty());
    assert!(report.not_taken.is_empty());
}

#[tokio::test]
async fn test_handlers_see_upstream_outputs() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", StaticHandler::new(json!({"a_out": 42})));
    handlers.register("agent-call", ContextProbe::new("a_out"));
    let wf = workflow(
        r#"
id: handoff
name: Handoff
outputs: [seen]
steps:
  - id: a
    type: shell
    outputs: [a_out]
  - id: b
    type: agent-call
    depends_on: [a]
    outputs: [seen]
"#,
    );
    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.outputs.get("seen"), Some(&json!(42)));
}

#[tokio::test]
async fn test_diamond_runs_branches_in_parallel() {
    let recorder = RecordingHandler::with_delay(Duration::from_millis(50));
    let mut handlers = HandlerRegistry::new();
    handlers.register_arc("shell", recorder.clone());

    let report = executor(handlers)
        .run(&workflow(DIAMOND), RunOptions::new())
        .await
        .unwrap();

    assert!(report.is_success());
    let steps = recorder.steps();
    assert_eq!(steps.first().map(String::as_str), Some("root"));
    assert_eq!(steps.last().map(String::as_str), Some("join"));
    assert_eq!(recorder.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_sequential_mode_runs_one_at_a_time() {
    let recorder = RecordingHandler::with_delay(Duration::from_millis(20));
    let mut handlers = HandlerRegistry::new();
    handlers.register_arc("shell", recorder.clone());
    let mut wf = workflow(DIAMOND);
    wf.settings.mode = Some(ExecutionMode::Sequential);

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.peak_concurrency(), 1);
    assert_eq!(recorder.steps().len(), 4);
}

#[tokio::test]
async fn test_max_workers_caps_concurrency() {
    let recorder = RecordingHandler::with_delay(Duration::from_millis(30));
    let mut handlers = HandlerRegistry::new();
    handlers.register_arc("shell", recorder.clone());
    let wf = workflow(
        r#"
id: wide
name: Wide
settings: { max_workers: 2 }
steps:
  - { id: a, type: shell }
  - { id: b, type: shell }
  - { id: c, type: shell }
  - { id: d, type: shell }
"#,
    );
    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.steps().len(), 4);
    assert_eq!(recorder.peak_concurrency(), 2);
}

#[tokio::test]
async fn test_branch_takes_one_side() {
    let (handlers, recorder) = recording_shell();
    let exec = executor(handlers);

    let report = exec.run(&workflow(BRANCHING), RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.steps(), vec!["approve"]);
    assert_eq!(report.not_taken, vec!["reject", "after_reject"]);

    let report = exec
        .run(&workflow(BRANCHING), RunOptions::new().with_input("flag", json!(false)))
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.steps(), vec!["approve", "reject", "after_reject"]);
    assert_eq!(report.not_taken, vec!["approve"]);
}

#[tokio::test]
async fn test_retry_succeeds_on_later_attempt() {
    let flaky = Arc::new(FlakyHandler::new(2));
    let mut handlers = HandlerRegistry::new();
    handlers.register_arc("shell", flaky.clone());
    let wf = workflow(
        r#"
id: retry
name: Retry
steps:
  - id: fetch
    type: shell
    on_failure: retry
    max_retries: 3
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(flaky.calls(), 3);
    let result = report.result("fetch").unwrap();
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.attempt_count, 3);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let flaky = Arc::new(FlakyHandler::new(10));
    let mut handlers = HandlerRegistry::new();
    handlers.register_arc("shell", flaky.clone());
    let wf = workflow(
        r#"
id: retry
name: Retry
steps:
  - id: fetch
    type: shell
    on_failure: retry
    max_retries: 2
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(flaky.calls(), 3);
    assert_eq!(report.result("fetch").unwrap().status, StepStatus::Failed);
    assert_eq!(report.errors.len(), 1);
}

#[tokio::test]
async fn test_timeout_triggers_failure_policy() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", SleepHandler::new(Duration::from_secs(10)));
    let wf = workflow(
        r#"
id: slow
name: Slow
steps:
  - id: wait
    type: shell
    timeout: 1
  - id: next
    type: shell
    depends_on: [wait]
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    let wait = report.result("wait").unwrap();
    assert_eq!(wait.status, StepStatus::Failed);
    assert!(wait.error.as_deref().unwrap().contains("timeout"));
    assert_eq!(report.result("next").unwrap().status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_fallback_handler_is_used() {
    let primary = Arc::new(FailingHandler::new("primary down"));
    let mut handlers = HandlerRegistry::new();
    handlers.register_arc("agent-call", primary.clone());
    handlers.register_fallback("agent-call", StaticHandler::new(json!({"answer": "cached"})));
    let wf = workflow(
        r#"
id: fallback
name: Fallback
steps:
  - id: ask
    type: agent-call
    on_failure: fallback
    outputs: [answer]
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(primary.calls(), 1);
    let ask = report.result("ask").unwrap();
    assert!(ask.fallback_used);
    assert_eq!(ask.attempt_count, 2);
    assert_eq!(report.context.get("answer"), Some(&json!("cached")));
}

const FAIL_THEN_CONTINUE: &str = r#"
id: policies
name: Policies
steps:
  - id: risky
    type: agent-call
    on_failure: __POLICY__
  - id: dependent
    type: shell
    depends_on: [risky]
  - id: independent
    type: shell
"#;

#[tokio::test]
async fn test_abort_cancels_pending_steps() {
    let (mut handlers, _recorder) = recording_shell();
    handlers.register("agent-call", FailingHandler::new("boom"));
    let wf = workflow(&FAIL_THEN_CONTINUE.replace("__POLICY__", "abort"));

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.errors[0].step_id.as_deref(), Some("risky"));
    assert!(report.errors[0].message.contains("boom"));
    assert_eq!(report.result("dependent").unwrap().status, StepStatus::Cancelled);
    assert!(report.unreachable.is_empty());
}

#[tokio::test]
async fn test_continue_reports_unreachable_dependents() {
    let (mut handlers, recorder) = recording_shell();
    handlers.register("agent-call", FailingHandler::new("boom"));
    let wf = workflow(&FAIL_THEN_CONTINUE.replace("__POLICY__", "continue"));

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.result("risky").unwrap().status, StepStatus::Failed);
    assert_eq!(report.unreachable, vec!["dependent"]);
    assert_eq!(recorder.steps(), vec!["independent"]);
    assert_eq!(report.context.get("risky_status"), Some(&json!("failure")));
}

#[tokio::test]
async fn test_condition_skips_step_but_not_dependents() {
    let (handlers, recorder) = recording_shell();
    let wf = workflow(
        r#"
id: conditional
name: Conditional
inputs:
  - name: deploy
    default: false
steps:
  - id: ship
    type: shell
    condition: "deploy == true"
  - id: notify
    type: shell
    depends_on: [ship]
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.result("ship").unwrap().status, StepStatus::Skipped);
    assert_eq!(recorder.steps(), vec!["notify"]);
}

#[tokio::test]
async fn test_min_complexity_gates_by_tier() {
    let (handlers, recorder) = recording_shell();
    let exec = Executor::builder(handlers)
        .config(fast_config())
        .classifier(Arc::new(FixedClassifier(Classification::tier(ComplexityTier::Simple))))
        .build();
    let wf = workflow(
        r#"
id: tiers
name: Tiers
steps:
  - id: quick
    type: shell
  - id: deep_review
    type: shell
    min_complexity: complex
"#,
    );

    let report = exec
        .run(&wf, RunOptions::new().with_task("fix a typo"))
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.steps(), vec!["quick"]);
    assert_eq!(report.result("deep_review").unwrap().status, StepStatus::Skipped);

    // Without a task there is nothing to classify, so nothing is gated.
    let report = exec.run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.count("deep_review"), 1);
}

#[tokio::test]
async fn test_failing_classifier_runs_unclassified() {
    let (handlers, recorder) = recording_shell();
    let exec = Executor::builder(handlers)
        .config(fast_config())
        .classifier(Arc::new(FailingClassifier))
        .build();
    let report = exec
        .run(&workflow(LINEAR), RunOptions::new().with_task("anything"))
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.steps().len(), 3);
}

#[tokio::test]
async fn test_resume_skips_completed_steps() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let wf = workflow(
        r#"
id: resumable
name: Resumable
steps:
  - id: prepare
    type: shell
    outputs: [prepared]
  - id: analyse
    type: agent-call
    depends_on: [prepare]
"#,
    );
    let run_id = RunId::from_string("run-resume");

    let (mut handlers, first) = recording_shell();
    handlers.register("agent-call", FailingHandler::new("model unavailable"));
    let report = Executor::builder(handlers)
        .config(fast_config())
        .checkpoint_store(store.clone())
        .build()
        .run(&wf, RunOptions::new().with_run_id(run_id.clone()))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(first.steps(), vec!["prepare"]);
    assert_eq!(store.list_resumable().unwrap().len(), 1);

    let (mut handlers, second) = recording_shell();
    let analyst = RecordingHandler::new();
    handlers.register_arc("agent-call", analyst.clone());
    let report = Executor::builder(handlers)
        .config(fast_config())
        .checkpoint_store(store.clone())
        .build()
        .resume(&wf, &run_id, RunOptions::new())
        .await
        .unwrap();

    assert!(report.resumed);
    assert!(report.is_success());
    assert!(second.steps().is_empty());
    assert_eq!(analyst.steps(), vec!["analyse"]);
    assert!(report.context.contains("prepared"));
    assert!(store.list_resumable().unwrap().is_empty());

    // A finished run cannot be resumed again.
    let (handlers, _) = recording_shell();
    let err = Executor::builder(handlers)
        .checkpoint_store(store.clone())
        .build()
        .resume(&wf, &run_id, RunOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
}

#[tokio::test]
async fn test_resume_from_sqlite_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("checkpoints.db");
    let run_id = RunId::from_string("sqlite-run");

    let (mut handlers, _) = recording_shell();
    handlers.register("agent-call", FailingHandler::new("flaky network"));
    let store = Arc::new(SqliteCheckpointStore::open(&db).unwrap());
    let wf = workflow(&FAIL_THEN_CONTINUE.replace("__POLICY__", "abort"));
    let report = Executor::builder(handlers)
        .config(fast_config())
        .checkpoint_store(store)
        .build()
        .run(&wf, RunOptions::new().with_run_id(run_id.clone()))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);

    let store = Arc::new(SqliteCheckpointStore::open(&db).unwrap());
    let resumable = store.list_resumable().unwrap();
    assert_eq!(resumable.len(), 1);
    assert_eq!(resumable[0].run_id, run_id);

    let (mut handlers, recorder) = recording_shell();
    handlers.register("agent-call", StaticHandler::new(json!({"ok": true})));
    let report = Executor::builder(handlers)
        .config(fast_config())
        .checkpoint_store(store.clone())
        .build()
        .resume(&wf, &run_id, RunOptions::new())
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.count("dependent"), 1);
    assert!(store.list_resumable().unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_without_checkpoint_fails() {
    let (handlers, _) = recording_shell();
    let err = Executor::builder(handlers)
        .checkpoint_store(Arc::new(MemoryCheckpointStore::new()))
        .build()
        .resume(&workflow(LINEAR), &RunId::from_string("nope"), RunOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
}

#[tokio::test]
async fn test_coordinated_mode_skips_yielded_duplicates() {
    let (mut handlers, _) = recording_shell();
    let researcher = RecordingHandler::new();
    handlers.register_arc("agent-call", researcher.clone());
    let wf = workflow(
        r#"
id: coordinated
name: Coordinated
settings:
  mode: coordinated-parallel
steps:
  - id: survey_a
    type: agent-call
    agent_role: researcher
    outputs: [notes_a]
  - id: survey_b
    type: agent-call
    agent_role: researcher
    outputs: [notes_b]
  - id: summarise
    type: shell
    depends_on: [survey_a, survey_b]
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(researcher.steps(), vec!["survey_a"]);
    let b = report.result("survey_b").unwrap();
    assert_eq!(b.status, StepStatus::Skipped);
    assert_eq!(b.reason.as_deref(), Some("yielded to survey_a"));
    assert_eq!(report.context.get("notes_b"), report.context.get("notes_a"));
    assert_eq!(report.result("summarise").unwrap().status, StepStatus::Success);
}

#[tokio::test]
async fn test_coordination_failure_dispatches_uncoordinated() {
    let (mut handlers, _) = recording_shell();
    let researcher = RecordingHandler::new();
    handlers.register_arc("agent-call", researcher.clone());
    let exec = Executor::builder(handlers)
        .config(fast_config())
        .resolver(Arc::new(FailingResolver))
        .build();
    let wf = workflow(
        r#"
id: coordinated
name: Coordinated
settings: { mode: coordinated-parallel }
steps:
  - { id: survey_a, type: agent-call, agent_role: researcher }
  - { id: survey_b, type: agent-call, agent_role: researcher }
"#,
    );

    let report = exec.run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(researcher.steps().len(), 2);
}

#[tokio::test]
async fn test_unconverged_coordination_still_yields() {
    let (mut handlers, _) = recording_shell();
    let researcher = RecordingHandler::new();
    handlers.register_arc("agent-call", researcher.clone());
    let sink = Arc::new(RecordingSink::new());
    let exec = Executor::builder(handlers)
        .config(fast_config())
        .resolver(Arc::new(WaveringResolver))
        .log_sink(sink.clone())
        .build();
    let mut rx = exec.event_bus().subscribe();
    let wf = workflow(
        r#"
id: coordinated
name: Coordinated
settings: { mode: coordinated-parallel }
steps:
  - { id: survey_a, type: agent-call, agent_role: researcher, outputs: [notes_a] }
  - { id: survey_b, type: agent-call, agent_role: researcher, outputs: [notes_b] }
"#,
    );

    let report = exec.run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(researcher.steps(), vec!["survey_a"]);
    let b = report.result("survey_b").unwrap();
    assert_eq!(b.status, StepStatus::Skipped);
    assert_eq!(b.reason.as_deref(), Some("yielded to survey_a"));
    assert_eq!(report.context.get("notes_b"), report.context.get("notes_a"));

    let mut resolved = None;
    while let Ok(event) = rx.try_recv() {
        if let WorkflowEvent::CoordinationResolved { converged, yielded, .. } = event {
            resolved = Some((converged, yielded));
        }
    }
    assert_eq!(resolved, Some((false, vec!["survey_b".to_string()])));
    assert!(sink
        .logs()
        .iter()
        .any(|l| l.level == LogLevel::Warn && l.message.contains("did not converge")));
}

#[tokio::test]
async fn test_count_loop_runs_body_count_times() {
    let (handlers, recorder) = recording_shell();
    let report = executor(handlers)
        .run(&workflow(COUNT_LOOP), RunOptions::new())
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(recorder.count("work"), 3);
    assert_eq!(recorder.count("after"), 1);
    let iterations: Vec<u32> = report
        .results
        .iter()
        .filter(|r| r.step_id == "work")
        .map(|r| r.iteration)
        .collect();
    assert_eq!(iterations, vec![0, 1, 2]);
    assert!(report.not_taken.is_empty());
    assert!(report.unreachable.is_empty());
    // The last iteration's output survives into the done side.
    assert_eq!(report.context.get("work_out"), Some(&json!({"step": "work", "attempt": 1})));
}

#[tokio::test]
async fn test_while_loop_sees_body_output() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", StaticHandler::new(json!({"finished": true})));
    handlers.register("agent-call", ContextProbe::new("finished"));
    let wf = workflow(
        r#"
id: polling
name: Polling
steps:
  - id: until_done
    type: loop
    loop: { type: while, condition: "!finished", max_iterations: 5 }
    depends_on: [poll]
  - id: poll
    type: shell
    depends_on: ["until_done:body"]
    outputs: [finished]
  - id: report
    type: agent-call
    depends_on: ["until_done:done"]
    outputs: [seen]
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.runs_of("poll"), 1);
    assert_eq!(report.context.get("finished"), Some(&json!(true)));
    assert_eq!(report.context.get("seen"), Some(&json!(true)));
    assert_eq!(report.result("report").unwrap().status, StepStatus::Success);
}

#[tokio::test]
async fn test_for_each_loop_exposes_items() {
    let (handlers, recorder) = recording_shell();
    let wf = workflow(
        r#"
id: each
name: Each
inputs:
  - name: files
    default: ["a.rs", "b.rs"]
steps:
  - id: per_file
    type: loop
    loop: { type: for_each, collection: files }
    depends_on: [lint]
  - id: lint
    type: shell
    depends_on: ["per_file:body"]
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(recorder.count("lint"), 2);
    let seen: Vec<serde_json::Value> = recorder
        .invocations()
        .iter()
        .map(|i| i.context.get("per_file.item").cloned().unwrap_or_default())
        .collect();
    assert_eq!(seen, vec![json!("a.rs"), json!("b.rs")]);
}

#[tokio::test]
async fn test_map_reduce_collects_item_outputs() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", EchoHandler);
    let wf = workflow(
        r#"
id: mapped
name: Mapped
inputs:
  - name: numbers
    default: [1, 2, 3]
steps:
  - id: total
    type: map-reduce
    map: { collection: numbers, step_type: shell, reduce: sum, concurrency: 2 }
    outputs: [sum]
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.context.get("sum"), Some(&json!(6)));
}

#[tokio::test]
async fn test_token_budget_stops_run() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", StaticHandler::new(json!({"ok": true})).with_usage(600, 0.01));
    let sink = Arc::new(RecordingSink::new());
    let mut wf = workflow(LINEAR);
    wf.settings.budget.max_tokens = Some(1000);

    let report = Executor::builder(handlers)
        .config(fast_config())
        .usage_hook(sink.clone())
        .build()
        .run(&wf, RunOptions::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.usage.tokens, 1200);
    assert_eq!(sink.total_tokens(), 1200);
    assert!(report.errors.iter().any(|e| e.message.contains("budget")));
    assert_eq!(report.result("c").unwrap().status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_dry_run_simulates_outputs() {
    let exec = Executor::builder(HandlerRegistry::new())
        .config(fast_config())
        .dry_run(true)
        .build();
    let report = exec.run(&workflow(LINEAR), RunOptions::new()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.context.get("b_out"), Some(&json!("<dry-run b.b_out>")));
}

#[tokio::test]
async fn test_missing_handler_fails_step() {
    let report = executor(HandlerRegistry::new())
        .run(&workflow(LINEAR), RunOptions::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.errors[0].message.contains("No handler"));
}

#[tokio::test]
async fn test_panicking_handler_fails_step() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", PanicHandler);
    let report = executor(handlers)
        .run(&workflow(LINEAR), RunOptions::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.result("a").unwrap().error.as_deref().unwrap().contains("panicked"));
}

#[tokio::test]
async fn test_output_contract_violation_fails_step() {
    let mut contracts = SchemaContractRegistry::new();
    contracts
        .register(RoleContract {
            role: "tester".into(),
            output_schema: Some(json!({"type": "object", "required": ["passed"]})),
            ..Default::default()
        })
        .unwrap();
    let mut handlers = HandlerRegistry::new();
    handlers.register("agent-call", StaticHandler::new(json!({"summary": "looks fine"})));
    let wf = workflow(
        r#"
id: contracts
name: Contracts
steps:
  - id: test
    type: agent-call
    agent_role: tester
"#,
    );

    let report = Executor::builder(handlers)
        .config(fast_config())
        .contracts(Arc::new(contracts))
        .build()
        .run(&wf, RunOptions::new())
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.errors[0].message.contains("Contract violation"));
}

#[tokio::test]
async fn test_cancellation_stops_run() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", SleepHandler::new(Duration::from_millis(500)));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = executor(handlers)
        .run(&workflow(LINEAR), RunOptions::new().with_cancel(cancel))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    // `a` was already running and does not watch its token.
    assert_eq!(report.result("a").unwrap().status, StepStatus::Success);
    assert_eq!(report.context.get("a_out"), Some(&json!({"slept_ms": 500})));
    assert_eq!(report.result("b").unwrap().status, StepStatus::Cancelled);
    assert_eq!(report.result("c").unwrap().status, StepStatus::Cancelled);
    assert_eq!(report.runs_of("b"), 1);
}

#[tokio::test]
async fn test_cancellation_reaches_observing_handler() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", SleepHandler::new(Duration::from_secs(10)).observing_cancel());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let report = executor(handlers)
        .run(&workflow(LINEAR), RunOptions::new().with_cancel(cancel))
        .await
        .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.result("a").unwrap().status, StepStatus::Cancelled);
    assert_eq!(report.result("c").unwrap().status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_abort_lets_running_sibling_finish() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", SleepHandler::new(Duration::from_millis(300)));
    handlers.register("agent-call", FailingHandler::new("boom"));
    let wf = workflow(
        r#"
id: siblings
name: Siblings
steps:
  - id: risky
    type: agent-call
  - id: slow
    type: shell
    outputs: [slow_out]
  - id: after_slow
    type: shell
    depends_on: [slow]
"#,
    );

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.result("risky").unwrap().status, StepStatus::Failed);
    assert_eq!(report.result("slow").unwrap().status, StepStatus::Success);
    assert!(report.context.contains("slow_out"));
    assert_eq!(report.result("after_slow").unwrap().status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_run_timeout_fails_run() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", SleepHandler::new(Duration::from_secs(10)).observing_cancel());
    let mut wf = workflow(LINEAR);
    wf.settings.budget.max_duration_secs = Some(1);

    let report = executor(handlers).run(&wf, RunOptions::new()).await.unwrap();
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.errors.iter().any(|e| e.message.contains("timed out")));
    assert_eq!(report.result("a").unwrap().status, StepStatus::Cancelled);
    assert_eq!(report.result("c").unwrap().status, StepStatus::Cancelled);
}

#[tokio::test]
async fn test_output_conflict_is_logged_not_fatal() {
    let mut handlers = HandlerRegistry::new();
    handlers.register("shell", StaticHandler::new(json!({"summary": "final", "words": 120})));
    let sink = Arc::new(RecordingSink::new());
    let wf = workflow(
        r#"
id: drafting
name: Drafting
steps:
  - id: write
    type: shell
    outputs: [summary, words]
"#,
    );

    let report = Executor::builder(handlers)
        .config(fast_config())
        .log_sink(sink.clone())
        .build()
        .run(&wf, RunOptions::new().with_input("summary", json!("draft")))
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.result("write").unwrap().status, StepStatus::Success);
    assert_eq!(report.context.get("summary"), Some(&json!("draft")));
    assert_eq!(report.context.get("words"), Some(&json!(120)));
    assert!(sink.logs().iter().any(|l| {
        l.level == LogLevel::Warn
            && l.step_id.as_deref() == Some("write")
            && l.message.contains("summary")
    }));
}

#[tokio::test]
async fn test_output_shadowing_declared_input_rejected_at_load() {
    let wf = workflow(
        r#"
id: drafting
name: Drafting
inputs:
  - name: summary
    default: draft
steps:
  - id: write
    type: shell
    outputs: [summary]
"#,
    );
    let (handlers, recorder) = recording_shell();
    let err = executor(handlers).run(&wf, RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, WeftError::Structural(_)));
    assert!(recorder.steps().is_empty());
}

#[tokio::test]
async fn test_missing_required_input_is_rejected() {
    let wf = workflow(
        r#"
id: needs_input
name: Needs input
inputs:
  - name: target
    required: true
steps:
  - { id: a, type: shell }
"#,
    );
    let (handlers, recorder) = recording_shell();
    let err = executor(handlers).run(&wf, RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
    assert!(recorder.steps().is_empty());
}

#[tokio::test]
async fn test_events_and_log_sink() {
    let (handlers, _) = recording_shell();
    let sink = Arc::new(RecordingSink::new());
    let exec = Executor::builder(handlers)
        .config(fast_config())
        .log_sink(sink.clone())
        .build();
    let mut rx = exec.event_bus().subscribe();

    let report = exec.run(&workflow(LINEAR), RunOptions::new()).await.unwrap();
    assert!(report.is_success());

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first(), Some(WorkflowEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::RunFinished { status: RunStatus::Success, .. })
    ));
    let finished = events
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::StepFinished { .. }))
        .count();
    assert_eq!(finished, 3);

    let progress = sink.progress();
    assert_eq!(progress.len(), 3);
    assert_eq!(progress.last().copied(), Some(100.0));
}
