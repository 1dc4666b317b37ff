use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{StepHandler, StepInvocation, StepOutput};

/// Step handlers keyed by step type, each with an optional fallback.
#[derive(Default)]
pub struct HandlerRegistry {
    primary: HashMap<String, Arc<dyn StepHandler>>,
    fallback: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the primary handler for a step type.
    pub fn register(&mut self, kind: impl Into<String>, handler: impl StepHandler) {
        self.primary.insert(kind.into(), Arc::new(handler));
    }

    pub fn register_arc(&mut self, kind: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.primary.insert(kind.into(), handler);
    }

    /// Register the handler used by steps with `on_failure: fallback`.
    pub fn register_fallback(&mut self, kind: impl Into<String>, handler: impl StepHandler) {
        self.fallback.insert(kind.into(), Arc::new(handler));
    }

    pub fn unregister(&mut self, kind: &str) -> bool {
        self.fallback.remove(kind);
        self.primary.remove(kind).is_some()
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn StepHandler>> {
        self.primary.get(kind).cloned()
    }

    pub fn get_fallback(&self, kind: &str) -> Option<Arc<dyn StepHandler>> {
        self.fallback.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.primary.contains_key(kind)
    }

    /// Registered step types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.primary.keys().map(|s| s.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Run the primary handler for `kind`, raced against `timeout_secs`.
    pub async fn execute(
        &self,
        kind: &str,
        invocation: StepInvocation,
        timeout_secs: u64,
    ) -> Result<StepOutput> {
        let handler = self
            .get(kind)
            .ok_or_else(|| WeftError::HandlerNotFound(kind.to_string()))?;
        run_with_timeout(handler, invocation, timeout_secs).await
    }

    /// Run the fallback handler for `kind`, raced against `timeout_secs`.
    pub async fn execute_fallback(
        &self,
        kind: &str,
        invocation: StepInvocation,
        timeout_secs: u64,
    ) -> Result<StepOutput> {
        let handler = self
            .get_fallback(kind)
            .ok_or_else(|| WeftError::HandlerNotFound(format!("{} (fallback)", kind)))?;
        run_with_timeout(handler, invocation, timeout_secs).await
    }
}

pub(crate) async fn run_with_timeout(
    handler: Arc<dyn StepHandler>,
    invocation: StepInvocation,
    timeout_secs: u64,
) -> Result<StepOutput> {
    let step = invocation.step_id.clone();
    let timeout = Duration::from_secs(timeout_secs);
    match tokio::time::timeout(timeout, handler.execute(invocation)).await {
        Ok(result) => result,
        Err(_) => Err(WeftError::StepTimeout { step, timeout_secs }),
    }
}

/// Stands in for every handler during a dry run.
///
/// Produces each declared output key as a placeholder string so downstream
/// steps, branches and contracts see a plausible shape.
pub struct DryRunHandler;

impl DryRunHandler {
    pub fn simulate(invocation: &StepInvocation) -> serde_json::Value {
        if invocation.outputs.is_empty() {
            return serde_json::json!({
                "dry_run": true,
                "step": invocation.step_id,
            });
        }
        let fields = invocation
            .outputs
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    serde_json::Value::String(format!(
                        "<dry-run {}.{}>",
                        invocation.step_id, key
                    )),
                )
            })
            .collect();
        serde_json::Value::Object(fields)
    }
}

impl StepHandler for DryRunHandler {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move { Ok(StepOutput::new(Self::simulate(&invocation))) })
    }
}
