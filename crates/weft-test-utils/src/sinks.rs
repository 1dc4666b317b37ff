use std::sync::Mutex;

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{ComplexityClassifier, LogSink, UsageHook};
use weft_core::types::{Classification, LogLevel, RunId};
use weft_engine::coordinator::{Adjustment, Intent, IntentResolver, Resolution};

#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub step_id: Option<String>,
    pub level: LogLevel,
    pub message: String,
}

/// Collects everything the engine reports through the sink and usage hook.
#[derive(Default)]
pub struct RecordingSink {
    logs: Mutex<Vec<LogLine>>,
    progress: Mutex<Vec<f64>>,
    usage: Mutex<Vec<(String, u64, f64)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logs(&self) -> Vec<LogLine> {
        self.logs.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn progress(&self) -> Vec<f64> {
        self.progress.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn usage(&self) -> Vec<(String, u64, f64)> {
        self.usage.lock().map(|u| u.clone()).unwrap_or_default()
    }

    pub fn total_tokens(&self) -> u64 {
        self.usage().iter().map(|(_, t, _)| t).sum()
    }
}

impl LogSink for RecordingSink {
    fn record_log(&self, _run_id: &RunId, step_id: Option<&str>, level: LogLevel, message: &str) {
        if let Ok(mut logs) = self.logs.lock() {
            logs.push(LogLine {
                step_id: step_id.map(String::from),
                level,
                message: message.to_string(),
            });
        }
    }

    fn record_progress(&self, _run_id: &RunId, percent: f64, _current_step: Option<&str>) {
        if let Ok(mut progress) = self.progress.lock() {
            progress.push(percent);
        }
    }
}

impl UsageHook for RecordingSink {
    fn record_usage(&self, _run_id: &RunId, step_id: &str, tokens: u64, cost: f64) {
        if let Ok(mut usage) = self.usage.lock() {
            usage.push((step_id.to_string(), tokens, cost));
        }
    }
}

/// Classifier that always answers the same.
pub struct FixedClassifier(pub Classification);

impl ComplexityClassifier for FixedClassifier {
    fn classify(&self, _task: &str) -> BoxFuture<'_, Result<Classification>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

pub struct FailingClassifier;

impl ComplexityClassifier for FailingClassifier {
    fn classify(&self, _task: &str) -> BoxFuture<'_, Result<Classification>> {
        Box::pin(async move { Err(WeftError::Config("classifier offline".into())) })
    }
}

/// Resolver that errors on every pass.
pub struct FailingResolver;

impl IntentResolver for FailingResolver {
    fn resolve(&self, _intents: &[Intent], _pass: usize) -> Result<Resolution> {
        Err(WeftError::Coordination("resolver unavailable".into()))
    }
}

/// Resolver that never settles: every intent after the first consumes the
/// first, always at low stability.
pub struct WaveringResolver;

impl IntentResolver for WaveringResolver {
    fn resolve(&self, intents: &[Intent], _pass: usize) -> Result<Resolution> {
        let mut res = Resolution::default();
        let Some(first) = intents.first() else {
            return Ok(res);
        };
        for intent in intents {
            let adjustment = if intent.step_id == first.step_id {
                Adjustment::Proceed
            } else {
                Adjustment::ConsumeInstead {
                    source: first.step_id.clone(),
                }
            };
            res.adjustments.insert(intent.step_id.clone(), adjustment);
            res.stability.insert(intent.step_id.clone(), 0.3);
        }
        Ok(res)
    }
}
