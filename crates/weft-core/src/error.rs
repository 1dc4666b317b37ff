use thiserror::Error;

use crate::types::Direction;

#[derive(Debug, Error)]
pub enum WeftError {
    // Structural errors (load time, always fatal)
    #[error("Structural error: {0}")]
    Structural(String),

    // Contract errors
    #[error("Contract violation for role {role} ({direction}): {message}")]
    ContractViolation {
        role: String,
        direction: Direction,
        message: String,
    },

    // Step errors
    #[error("Step execution failed: {step}: {message}")]
    StepExecution { step: String, message: String },

    #[error("Step timeout after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    #[error("No handler registered for step type: {0}")]
    HandlerNotFound(String),

    #[error("Invalid state transition for step {step}: {from} -> {to}")]
    InvalidTransition {
        step: String,
        from: String,
        to: String,
    },

    #[error("Context key '{key}' already published by {owner}")]
    ContextConflict { key: String, owner: String },

    // Coordination errors (non-fatal, degrade to uncoordinated dispatch)
    #[error("Coordination failure: {0}")]
    Coordination(String),

    // Checkpoint errors (non-fatal, durability is best-effort)
    #[error("Checkpoint write failed: {0}")]
    CheckpointWrite(String),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl WeftError {
    /// Shorthand for a step execution failure.
    pub fn step(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StepExecution {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Whether a failed attempt with this error is worth retrying.
    ///
    /// Input-side contract violations and structural problems will fail the
    /// same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            WeftError::StepExecution { .. }
            | WeftError::StepTimeout { .. }
            | WeftError::Io(_) => true,
            WeftError::ContractViolation { direction, .. } => *direction == Direction::Output,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_mentions_step() {
        let e = WeftError::StepTimeout {
            step: "build".into(),
            timeout_secs: 30,
        };
        assert_eq!(e.to_string(), "Step timeout after 30s: build");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(WeftError::step("a", "boom").is_retryable());
        assert!(WeftError::StepTimeout {
            step: "a".into(),
            timeout_secs: 1
        }
        .is_retryable());
        assert!(!WeftError::ContractViolation {
            role: "tester".into(),
            direction: Direction::Input,
            message: "missing field".into(),
        }
        .is_retryable());
        assert!(WeftError::ContractViolation {
            role: "tester".into(),
            direction: Direction::Output,
            message: "bad output".into(),
        }
        .is_retryable());
        assert!(!WeftError::Structural("cycle".into()).is_retryable());
    }
}
