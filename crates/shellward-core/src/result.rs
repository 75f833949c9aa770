//! Uniform execution result

use serde::{Deserialize, Serialize};

use crate::backend::{BackendOutput, Tier};
use crate::error::{ErrorKind, ExecutionError, SandboxError};

/// What every `execute` call returns, whatever happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// `None` when the command never ran
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub backend_used: Option<Tier>,
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    /// Rejected by the policy; nothing ran
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration_ms: 0,
            backend_used: None,
            error: Some(ExecutionError::new(ErrorKind::PolicyViolation, reason)),
        }
    }

    /// The command ran to completion. A non-zero exit is not an error.
    pub fn from_output(output: BackendOutput, tier: Tier, duration_ms: u64) -> Self {
        Self {
            success: output.exit_code == 0,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: Some(output.exit_code),
            duration_ms,
            backend_used: Some(tier),
            error: None,
        }
    }

    pub fn from_error(err: &SandboxError, tier: Tier, duration_ms: u64) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: err.to_string(),
            exit_code: err.exit_code(),
            duration_ms,
            backend_used: Some(tier),
            error: Some(ExecutionError::from(err)),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_requires_zero_exit() {
        let ok = ExecutionResult::from_output(
            BackendOutput {
                stdout: "hi\n".into(),
                stderr: String::new(),
                exit_code: 0,
            },
            Tier::Subprocess,
            12,
        );
        assert!(ok.success);
        assert!(ok.error.is_none());

        let failed = ExecutionResult::from_output(
            BackendOutput {
                exit_code: 2,
                ..BackendOutput::default()
            },
            Tier::Container,
            5,
        );
        assert!(!failed.success);
        assert_eq!(failed.exit_code, Some(2));
        assert!(failed.error.is_none());
    }

    #[test]
    fn test_denied_never_ran() {
        let result = ExecutionResult::denied("Pipelines (|) are not supported");
        assert!(!result.success);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.backend_used, None);
        assert_eq!(result.error_kind(), Some(ErrorKind::PolicyViolation));
    }

    #[test]
    fn test_from_error() {
        let result = ExecutionResult::from_error(&SandboxError::Timeout(30), Tier::Container, 35_000);
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(124));
        assert_eq!(result.error_kind(), Some(ErrorKind::SandboxTimeout));
        assert_eq!(result.backend_used, Some(Tier::Container));
    }

    #[test]
    fn test_serializes_for_callers() {
        let json = serde_json::to_value(ExecutionResult::denied("nope")).unwrap();
        assert_eq!(json["exit_code"], serde_json::Value::Null);
        assert_eq!(json["error"]["kind"], "policy_violation");
    }
}
