use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use weft_core::context::ExecutionContext;
use weft_core::error::{Result, WeftError};
use weft_core::traits::{StepHandler, StepInvocation, StepOutput};

const MAX_OUTPUT: usize = 30_000;

/// Runs `params.command` through `sh -c`.
///
/// `{{key}}` placeholders are filled from the run context (`{{item}}` from the
/// loop or map item). A non-zero exit status fails the step.
pub struct ShellHandler;

#[derive(Deserialize)]
struct ShellParams {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    /// Parse stdout as JSON and use it as the step output.
    #[serde(default)]
    json: bool,
}

impl ShellHandler {
    fn render(template: &str, context: &ExecutionContext, item: Option<&Value>) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            let key = after[..end].trim();
            let value = if key == "item" { item } else { context.get(key) };
            match value {
                Some(Value::String(s)) => out.push_str(s),
                Some(other) => out.push_str(&other.to_string()),
                None => {}
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }
}

fn truncate(mut s: String) -> String {
    if s.len() > MAX_OUTPUT {
        let mut end = MAX_OUTPUT;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
        s.push_str("\n... (output truncated)");
    }
    s
}

impl StepHandler for ShellHandler {
    fn name(&self) -> &str {
        "shell"
    }

    fn execute(&self, invocation: StepInvocation) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let params: ShellParams = serde_json::from_value(invocation.params.clone())
                .map_err(|e| WeftError::step(&invocation.step_id, format!("invalid params: {}", e)))?;
            let command = Self::render(&params.command, &invocation.context, invocation.item.as_ref());
            debug!(step_id = %invocation.step_id, command = %command, "Executing shell step");

            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(&command).kill_on_drop(true);
            if let Some(dir) = &params.cwd {
                cmd.current_dir(dir);
            }

            let output = tokio::select! {
                _ = invocation.cancel.cancelled() => return Err(WeftError::Cancelled),
                out = cmd.output() => out.map_err(|e| WeftError::step(&invocation.step_id, e.to_string()))?,
            };

            let stdout = truncate(String::from_utf8_lossy(&output.stdout).into_owned());
            let stderr = truncate(String::from_utf8_lossy(&output.stderr).into_owned());
            let code = output.status.code().unwrap_or(-1);
            if !output.status.success() {
                return Err(WeftError::step(
                    &invocation.step_id,
                    format!("exit code {}: {}", code, stderr.trim()),
                ));
            }

            if params.json {
                let value: Value = serde_json::from_str(stdout.trim()).map_err(|e| {
                    WeftError::step(&invocation.step_id, format!("stdout is not JSON: {}", e))
                })?;
                return Ok(StepOutput::new(value));
            }
            Ok(StepOutput::new(json!({
                "stdout": stdout.trim_end(),
                "stderr": stderr.trim_end(),
                "exit_code": code,
            })))
        })
    }
}
