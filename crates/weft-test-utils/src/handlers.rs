use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use weft_core::error::{Result, WeftError};
use weft_core::traits::{StepHandler, StepInvocation, StepOutput};
use weft_core::types::Usage;

/// Returns the same value for every step, optionally reporting usage.
pub struct StaticHandler {
    value: Value,
    usage: Option<Usage>,
}

impl StaticHandler {
    pub fn new(value: Value) -> Self {
        Self { value, usage: None }
    }

    pub fn with_usage(mut self, tokens: u64, cost: f64) -> Self {
        self.usage = Some(Usage { tokens, cost });
        self
    }
}

impl StepHandler for StaticHandler {
    fn name(&self) -> &str {
        "static"
    }

    fn execute(&self, _invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            Ok(StepOutput {
                value: self.value.clone(),
                usage: self.usage,
            })
        })
    }
}

/// Echoes `params`, or the map/loop item when there is one.
pub struct EchoHandler;

impl StepHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let value = invocation.item.clone().unwrap_or(invocation.params);
            Ok(StepOutput::new(value))
        })
    }
}

/// Fails the first `failures` calls with a retryable error, then succeeds.
pub struct FlakyHandler {
    failures: u32,
    calls: AtomicU32,
    value: Value,
}

impl FlakyHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            value: json!({"ok": true}),
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = value;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StepHandler for FlakyHandler {
    fn name(&self) -> &str {
        "flaky"
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(WeftError::step(
                    &invocation.step_id,
                    format!("transient failure {}", n + 1),
                ));
            }
            Ok(StepOutput::new(self.value.clone()))
        })
    }
}

/// Always fails with a step error.
pub struct FailingHandler {
    message: String,
    calls: AtomicU32,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StepHandler for FailingHandler {
    fn name(&self) -> &str {
        "failing"
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(WeftError::step(&invocation.step_id, self.message.clone()))
        })
    }
}

/// Sleeps for a fixed time. Ignores cancellation unless built with
/// [`observing_cancel`](Self::observing_cancel).
pub struct SleepHandler {
    duration: Duration,
    observe_cancel: bool,
}

impl SleepHandler {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            observe_cancel: false,
        }
    }

    /// Stop early with `Cancelled` when the invocation token fires.
    pub fn observing_cancel(mut self) -> Self {
        self.observe_cancel = true;
        self
    }
}

impl StepHandler for SleepHandler {
    fn name(&self) -> &str {
        "sleep"
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let done = Ok(StepOutput::new(json!({"slept_ms": self.duration.as_millis() as u64})));
            if !self.observe_cancel {
                tokio::time::sleep(self.duration).await;
                return done;
            }
            tokio::select! {
                _ = invocation.cancel.cancelled() => Err(WeftError::Cancelled),
                _ = tokio::time::sleep(self.duration) => done,
            }
        })
    }
}

pub struct PanicHandler;

impl StepHandler for PanicHandler {
    fn name(&self) -> &str {
        "panic"
    }

    fn execute(&self, _invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move { explode() })
    }
}

fn explode() -> Result<StepOutput> {
    panic!("handler blew up")
}

/// Records invocations and the peak number running at once.
///
/// Output is `{"step": <id>, "attempt": n}` merged with `params` when it is
/// an object.
#[derive(Default)]
pub struct RecordingHandler {
    delay: Duration,
    calls: Mutex<Vec<StepInvocation>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    /// Step ids in call order.
    pub fn steps(&self) -> Vec<String> {
        self.calls
            .lock()
            .map(|c| c.iter().map(|i| i.step_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn invocations(&self) -> Vec<StepInvocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, step_id: &str) -> usize {
        self.steps().iter().filter(|s| s.as_str() == step_id).count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl StepHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(invocation.clone());
            }
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            let mut out = json!({"step": invocation.step_id, "attempt": invocation.attempt});
            if let (Some(obj), Some(params)) = (out.as_object_mut(), invocation.params.as_object()) {
                for (k, v) in params {
                    obj.insert(k.clone(), v.clone());
                }
            }
            Ok(StepOutput::new(out))
        })
    }
}

/// Reads a context key and returns it as `{"seen": value}`.
pub struct ContextProbe {
    key: String,
}

impl ContextProbe {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl StepHandler for ContextProbe {
    fn name(&self) -> &str {
        "probe"
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let seen = invocation.context.get(&self.key).cloned().unwrap_or(Value::Null);
            Ok(StepOutput::new(json!({"seen": seen})))
        })
    }
}
