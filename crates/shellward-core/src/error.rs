//! Error taxonomy for sandboxed execution
//!
//! Backends report failures as [`SandboxError`]. The orchestrator folds them
//! into [`ExecutionError`] values on the result, so no error ever crosses the
//! `execute` boundary as an `Err`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of failure classes a caller can observe on an execution result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected by the command policy before anything ran
    PolicyViolation,
    /// Killed for exceeding memory, CPU or process bounds
    ResourceLimit,
    /// Killed for exceeding the wall-clock budget
    SandboxTimeout,
    /// The isolation primitive was created but failed
    Sandbox,
    /// The isolation primitive could not be created at all
    InfrastructureUnavailable,
    /// OS-level failure in the subprocess tier
    System,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::ResourceLimit => "resource_limit",
            ErrorKind::SandboxTimeout => "sandbox_timeout",
            ErrorKind::Sandbox => "sandbox",
            ErrorKind::InfrastructureUnavailable => "infrastructure_unavailable",
            ErrorKind::System => "system",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by an isolation backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("killed for exceeding resource limits: {0}")]
    ResourceLimit(String),

    #[error("execution timed out after {0}s")]
    Timeout(u64),

    #[error("sandbox failure: {0}")]
    Sandbox(String),

    #[error("isolation infrastructure unavailable: {0}")]
    InfrastructureUnavailable(String),

    #[error("system error: {message}")]
    System {
        message: String,
        exit_code: Option<i32>,
    },
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::ResourceLimit(_) => ErrorKind::ResourceLimit,
            SandboxError::Timeout(_) => ErrorKind::SandboxTimeout,
            SandboxError::Sandbox(_) => ErrorKind::Sandbox,
            SandboxError::InfrastructureUnavailable(_) => ErrorKind::InfrastructureUnavailable,
            SandboxError::System { .. } => ErrorKind::System,
        }
    }

    /// Infrastructure failures are the only kind that trigger a tier downgrade
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SandboxError::InfrastructureUnavailable(_))
    }

    /// Exit code attached to the failure, if the process got far enough to have one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SandboxError::ResourceLimit(_) => Some(137),
            SandboxError::Timeout(_) => Some(124),
            SandboxError::System { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub(crate) fn system(message: impl Into<String>) -> Self {
        SandboxError::System {
            message: message.into(),
            exit_code: None,
        }
    }
}

/// Classified error carried on an [`ExecutionResult`](crate::ExecutionResult)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&SandboxError> for ExecutionError {
    fn from(err: &SandboxError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}
