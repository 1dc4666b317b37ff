use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::event::EventBus;
use weft_core::traits::{LogSink, UsageHook};
use weft_core::types::{LogLevel, RunId, WorkflowEvent};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line for the
/// events of a single run. Lines already written survive a crash.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1 = run summary, 2 = per-step outcomes, 3 = everything.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Write events for `run_id` to `{log_dir}/{run_id}/{timestamp}.jsonl`
    /// until the run finishes or `cancel` fires.
    pub async fn run(self, event_bus: Arc<EventBus>, run_id: RunId, cancel: CancellationToken) {
        let mut rx = event_bus.subscribe();
        let run_dir = self.log_dir.join(run_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id() != &run_id {
                                continue;
                            }
                            let finished = matches!(event, WorkflowEvent::RunFinished { .. });
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Ok(json) = serde_json::to_string(&entry) {
                                    let line = format!("{}\n", json);
                                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                                        error!(error = %e, "Failed to write log entry");
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!(error = %e, "Failed to flush log");
                                    }
                                }
                            }
                            if finished {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// `None` when the event is filtered out at this level.
    fn event_to_entry(&self, event: &WorkflowEvent) -> Option<LogEntry> {
        let entry = |event_type, step_id: Option<&str>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: event.run_id().to_string(),
            event_type,
            step_id: step_id.map(String::from),
            detail,
        };

        match event {
            // L1: run summary
            WorkflowEvent::RunStarted {
                workflow_id,
                resumed,
                ..
            } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({"workflow_id": workflow_id, "resumed": resumed})),
            )),
            WorkflowEvent::RunFinished {
                status,
                duration_ms,
                usage,
                ..
            } => Some(entry(
                "run_finished",
                None,
                Some(serde_json::json!({
                    "status": status.as_str(),
                    "duration_ms": duration_ms,
                    "tokens": usage.tokens,
                    "cost": usage.cost,
                })),
            )),

            // L2: step outcomes and coordination
            WorkflowEvent::StepFinished {
                step_id,
                status,
                duration_ms,
                error,
                ..
            } if self.level >= 2 => Some(entry(
                "step_finished",
                Some(step_id.as_str()),
                Some(serde_json::json!({
                    "status": status.as_str(),
                    "duration_ms": duration_ms,
                    "error": error.as_deref().map(|e| truncate_str(e, 500)),
                })),
            )),
            WorkflowEvent::WavefrontStarted { index, steps, .. } if self.level >= 2 => Some(entry(
                "wavefront_started",
                None,
                Some(serde_json::json!({"index": index, "steps": steps})),
            )),
            WorkflowEvent::CoordinationResolved {
                converged,
                passes,
                yielded,
                ..
            } if self.level >= 2 => Some(entry(
                "coordination_resolved",
                None,
                Some(serde_json::json!({
                    "converged": converged,
                    "passes": passes,
                    "yielded": yielded,
                })),
            )),
            WorkflowEvent::Log {
                step_id,
                level,
                message,
                ..
            } if self.level >= 2 && matches!(level, LogLevel::Warn | LogLevel::Error) => {
                Some(entry(
                    "log",
                    step_id.as_deref(),
                    Some(serde_json::json!({"level": level.to_string(), "message": message})),
                ))
            }

            // L3: attempts, usage, progress and chatter
            WorkflowEvent::StepStarted {
                step_id, attempt, ..
            } if self.level >= 3 => Some(entry(
                "step_started",
                Some(step_id.as_str()),
                Some(serde_json::json!({"attempt": attempt})),
            )),
            WorkflowEvent::StepRetrying {
                step_id,
                attempt,
                error,
                ..
            } if self.level >= 3 => Some(entry(
                "step_retrying",
                Some(step_id.as_str()),
                Some(serde_json::json!({"attempt": attempt, "error": truncate_str(error, 500)})),
            )),
            WorkflowEvent::UsageReported {
                step_id,
                tokens,
                cost,
                ..
            } if self.level >= 3 => Some(entry(
                "usage",
                Some(step_id.as_str()),
                Some(serde_json::json!({"tokens": tokens, "cost": cost})),
            )),
            WorkflowEvent::Progress {
                percent,
                current_step,
                ..
            } if self.level >= 3 => Some(entry(
                "progress",
                current_step.as_deref(),
                Some(serde_json::json!({"percent": percent})),
            )),
            WorkflowEvent::Log {
                step_id,
                level,
                message,
                ..
            } if self.level >= 3 => Some(entry(
                "log",
                step_id.as_deref(),
                Some(serde_json::json!({"level": level.to_string(), "message": message})),
            )),

            _ => None,
        }
    }
}

/// Truncate a string for logging without splitting a character.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Forwards engine logs, progress and usage onto the EventBus.
pub struct EventSink {
    event_bus: Arc<EventBus>,
}

impl EventSink {
    pub fn new(event_bus: Arc<EventBus>) -> Self {
        Self { event_bus }
    }
}

impl LogSink for EventSink {
    fn record_log(&self, run_id: &RunId, step_id: Option<&str>, level: LogLevel, message: &str) {
        self.event_bus.publish(WorkflowEvent::Log {
            run_id: run_id.clone(),
            step_id: step_id.map(String::from),
            level,
            message: message.to_string(),
        });
    }

    fn record_progress(&self, run_id: &RunId, percent: f64, current_step: Option<&str>) {
        self.event_bus.publish(WorkflowEvent::Progress {
            run_id: run_id.clone(),
            percent,
            current_step: current_step.map(String::from),
        });
    }
}

impl UsageHook for EventSink {
    fn record_usage(&self, run_id: &RunId, step_id: &str, tokens: u64, cost: f64) {
        self.event_bus.publish(WorkflowEvent::UsageReported {
            run_id: run_id.clone(),
            step_id: step_id.to_string(),
            tokens,
            cost,
        });
    }
}
