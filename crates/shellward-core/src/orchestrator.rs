//! Execution orchestrator - the single entry point for running a command
//!
//! Each call is validated, then run on the active isolation tier. An
//! infrastructure failure moves the whole orchestrator one tier down (once,
//! however many calls observe it) and the same validated command is retried
//! on the new tier. Every outcome becomes an [`ExecutionResult`] and an
//! audit entry.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditLog};
use crate::backend::{
    BackendOutput, ContainerBackend, IsolationBackend, LightweightBackend, RunRequest,
    SubprocessBackend, Tier,
};
use crate::config::ShellwardConfig;
use crate::error::SandboxError;
use crate::health::{BackendHealth, Downgrade, HealthReport};
use crate::policy::{CommandPolicy, PolicyDecision, ValidatedCommand};
use crate::result::ExecutionResult;

pub struct Orchestrator {
    config: ShellwardConfig,
    policy: CommandPolicy,
    /// Indexed by [`Tier::index`]
    backends: [Option<Arc<dyn IsolationBackend>>; 3],
    health: BackendHealth,
    audit: AuditLog,
    workers: Semaphore,
}

impl Orchestrator {
    /// Build the backends enabled in `config` and probe them
    pub async fn new(config: ShellwardConfig) -> Self {
        let mut backends: Vec<Arc<dyn IsolationBackend>> = Vec::new();
        if config.is_tier_enabled(Tier::Container) {
            backends.push(Arc::new(ContainerBackend::new(&config.scratch.root)));
        }
        if config.is_tier_enabled(Tier::Lightweight) {
            backends.push(Arc::new(LightweightBackend::new()));
        }
        backends.push(Arc::new(SubprocessBackend::new()));

        let audit = AuditLog::new(&config.audit.dir);
        Self::with_backends(config, backends, audit).await
    }

    /// Use exactly the given backends. A later backend for the same tier
    /// replaces an earlier one; the subprocess tier is added if missing.
    pub async fn with_backends(
        config: ShellwardConfig,
        backends: Vec<Arc<dyn IsolationBackend>>,
        audit: AuditLog,
    ) -> Self {
        let mut slots: [Option<Arc<dyn IsolationBackend>>; 3] = [None, None, None];
        for backend in backends {
            let index = backend.tier().index();
            slots[index] = Some(backend);
        }
        if slots[Tier::Subprocess.index()].is_none() {
            slots[Tier::Subprocess.index()] = Some(Arc::new(SubprocessBackend::new()));
        }

        let probes = probe_all(&slots).await;
        let workers = Semaphore::new(config.max_concurrent.max(1));

        Self {
            config,
            policy: CommandPolicy::new(),
            backends: slots,
            health: BackendHealth::new(&probes),
            audit,
            workers,
        }
    }

    /// Validate and run `command` in `workspace` on behalf of `user_id`.
    ///
    /// Never fails: every error is reported on the returned result.
    pub async fn execute(&self, command: &str, workspace: &Path, user_id: &str) -> ExecutionResult {
        let execution_id = Uuid::new_v4().to_string();

        let validated = match self.policy.validate(command).into_validated() {
            Ok(validated) => validated,
            Err(reason) => {
                warn!("Orchestrator: denied command from {}: {}", user_id, reason);
                let result = ExecutionResult::denied(reason);
                self.record(&execution_id, user_id, command, &result, self.health.active());
                return result;
            }
        };

        // The semaphore is never closed, so acquire only fails if that changes
        let _permit = self.workers.acquire().await.ok();

        let started = Instant::now();
        let tier = self.health.active();
        let (tier, outcome) = match self.run_on(tier, &validated, workspace, &execution_id).await {
            Err(e) if e.is_infrastructure() => {
                self.retry_after_infra_failure(tier, e, &validated, workspace, &execution_id)
                    .await
            }
            outcome => (tier, outcome),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(output) => {
                info!(
                    "Orchestrator: {} ran '{}' on {} tier, exit {} in {}ms",
                    user_id,
                    validated.command().program(),
                    tier,
                    output.exit_code,
                    duration_ms
                );
                ExecutionResult::from_output(output, tier, duration_ms)
            }
            Err(e) => {
                warn!(
                    "Orchestrator: {} '{}' failed on {} tier: {}",
                    user_id,
                    validated.command().program(),
                    tier,
                    e
                );
                ExecutionResult::from_error(&e, tier, duration_ms)
            }
        };

        self.record(&execution_id, user_id, command, &result, tier);
        result
    }

    /// Downgrade from `failed` and retry once. A second infrastructure
    /// failure marks that tier down too and is returned as is.
    async fn retry_after_infra_failure(
        &self,
        failed: Tier,
        err: SandboxError,
        command: &ValidatedCommand,
        workspace: &Path,
        execution_id: &str,
    ) -> (Tier, Result<BackendOutput, SandboxError>) {
        warn!("Orchestrator: {} tier failed: {}", failed, err);

        let next = match self.health.downgrade(failed) {
            Downgrade::Performed { to, .. } => to,
            Downgrade::AlreadyMoved(current) if current != failed => current,
            Downgrade::AlreadyMoved(_) | Downgrade::Exhausted => return (failed, Err(err)),
        };

        debug!("Orchestrator: retrying {} on {} tier", execution_id, next);
        let outcome = self.run_on(next, command, workspace, execution_id).await;
        if let Err(e) = &outcome {
            if e.is_infrastructure() {
                error!("Orchestrator: {} tier also failed: {}", next, e);
                self.health.downgrade(next);
            }
        }
        (next, outcome)
    }

    async fn run_on(
        &self,
        tier: Tier,
        command: &ValidatedCommand,
        workspace: &Path,
        execution_id: &str,
    ) -> Result<BackendOutput, SandboxError> {
        let Some(backend) = self.backends[tier.index()].clone() else {
            return Err(SandboxError::InfrastructureUnavailable(format!(
                "no backend configured for the {} tier",
                tier
            )));
        };

        let config = self.config.execution_for(tier).clone();
        let timeout_seconds = config.timeout_seconds;
        let budget = Duration::from_secs(timeout_seconds + self.config.grace_seconds);
        let request = RunRequest {
            command: command.clone(),
            workspace: workspace.to_path_buf(),
            config,
            execution_id: execution_id.to_string(),
        };

        let runner = Arc::clone(&backend);
        let mut handle = tokio::spawn(async move { runner.run(&request).await });

        match tokio::time::timeout(budget, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_err)) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                error!("Orchestrator: {} backend panicked: {}", tier, message);
                Err(SandboxError::Sandbox(format!("backend panicked: {}", message)))
            }
            Ok(Err(join_err)) => Err(SandboxError::Sandbox(format!(
                "execution task failed: {}",
                join_err
            ))),
            Err(_) => {
                handle.abort();
                warn!(
                    "Orchestrator: {} exceeded {}s on {} tier, abandoning it",
                    execution_id,
                    budget.as_secs(),
                    tier
                );
                let id = execution_id.to_string();
                tokio::spawn(async move { backend.reap(&id).await });
                Err(SandboxError::Timeout(timeout_seconds))
            }
        }
    }

    fn record(&self, execution_id: &str, user_id: &str, command: &str, result: &ExecutionResult, tier: Tier) {
        let entry = AuditEntry::new(
            execution_id,
            user_id,
            command,
            result,
            self.config.execution_for(tier),
        );
        self.audit.record(entry);
    }

    /// Policy decision for `command` without running it
    pub fn validate(&self, command: &str) -> PolicyDecision {
        self.policy.validate(command)
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn config(&self) -> &ShellwardConfig {
        &self.config
    }

    pub fn active_tier(&self) -> Tier {
        self.health.active()
    }

    pub fn health(&self) -> HealthReport {
        self.health.snapshot()
    }

    /// Re-probe every backend and start again from the strongest healthy tier
    pub async fn reset_health(&self) -> HealthReport {
        let probes = probe_all(&self.backends).await;
        self.health.reset(&probes);
        self.health.snapshot()
    }

    /// Wait for queued audit writes
    pub async fn flush_audit(&self) {
        self.audit.flush().await;
    }
}

async fn probe_all(backends: &[Option<Arc<dyn IsolationBackend>>; 3]) -> Vec<(Tier, bool)> {
    let mut probes = Vec::with_capacity(backends.len());
    for backend in backends.iter().flatten() {
        let healthy = backend.health_check().await;
        if healthy {
            info!("Orchestrator: {} tier is available", backend.tier());
        } else {
            warn!("Orchestrator: {} tier is unavailable", backend.tier());
        }
        probes.push((backend.tier(), healthy));
    }
    probes
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
