use serde::Serialize;

use weft_core::error::{Result, WeftError};
use weft_core::types::{StepStatus, Usage};

/// Outcome of one step (one loop iteration of it, for loop bodies).
///
/// Every status change goes through [`transition`](Self::transition), which
/// rejects moves the state machine does not allow. Terminal results never
/// change again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempt_count: u32,
    pub duration_ms: u64,
    /// Why the step was skipped, yielded or cancelled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub usage: Usage,
    /// Loop iteration the result belongs to (0 outside loops).
    pub iteration: u32,
    pub fallback_used: bool,
}

impl StepResult {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            output: None,
            error: None,
            attempt_count: 0,
            duration_ms: 0,
            reason: None,
            usage: Usage::default(),
            iteration: 0,
            fallback_used: false,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn transition(&mut self, next: StepStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(WeftError::InvalidTransition {
                step: self.step_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Begin an attempt. Counts attempts.
    pub fn start(&mut self) -> Result<()> {
        self.transition(StepStatus::Running)?;
        self.attempt_count += 1;
        Ok(())
    }

    pub fn retrying(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(StepStatus::Retrying)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn succeed(&mut self, output: serde_json::Value) -> Result<()> {
        self.transition(StepStatus::Success)?;
        self.output = Some(output);
        self.error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(StepStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(StepStatus::Skipped)?;
        self.reason = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(StepStatus::Cancelled)?;
        self.reason = Some(reason.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut r = StepResult::new("build");
        r.start().unwrap();
        r.succeed(serde_json::json!("ok")).unwrap();
        assert_eq!(r.status, StepStatus::Success);
        assert_eq!(r.attempt_count, 1);
        assert!(r.is_terminal());
    }

    #[test]
    fn test_retry_cycle() {
        let mut r = StepResult::new("flaky");
        r.start().unwrap();
        r.retrying("boom").unwrap();
        r.start().unwrap();
        r.succeed(serde_json::json!(1)).unwrap();
        assert_eq!(r.attempt_count, 2);
        assert!(r.error.is_none());
    }

    #[test]
    fn test_terminal_is_immutable() {
        let mut r = StepResult::new("done");
        r.skip("condition false").unwrap();
        let err = r.start().unwrap_err();
        assert!(matches!(err, WeftError::InvalidTransition { .. }));
        assert!(r.fail("late").is_err());
        assert_eq!(r.status, StepStatus::Skipped);
        assert_eq!(r.attempt_count, 0);
    }

    #[test]
    fn test_pending_cannot_succeed() {
        let mut r = StepResult::new("x");
        assert!(r.succeed(serde_json::json!(null)).is_err());
        assert!(r.fail("contract").is_ok());
    }
}
