//! shellward-core - Policy-gated, tiered execution of agent-generated commands
//!
//! This crate provides:
//! - A static command policy (allowlist, denylist, dangerous patterns)
//! - Isolation backends: docker containers, firejail, plain subprocesses
//! - An orchestrator that degrades to a weaker tier when a stronger one fails
//! - An append-only NDJSON audit log

pub mod audit;
pub mod backend;
pub mod backoff;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod policy;
pub mod result;

pub use audit::{AuditEntry, AuditLog, Decision};
pub use backend::{
    BackendOutput, ContainerBackend, IsolationBackend, LightweightBackend, RunRequest,
    SubprocessBackend, Tier,
};
pub use config::{ExecutionConfig, MountMode, ShellwardConfig};
pub use error::{ErrorKind, ExecutionError, SandboxError};
pub use health::{BackendHealth, HealthReport, TierStatus};
pub use orchestrator::Orchestrator;
pub use policy::{Command, CommandPolicy, CommandRule, PolicyDecision, ValidatedCommand};
pub use result::ExecutionResult;
