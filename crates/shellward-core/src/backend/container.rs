//! Container backend - run validated commands in ephemeral docker containers

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    BackendOutput, IsolationBackend, RunRequest, Tier, decode_output, prepare_workspace,
    wait_with_capped_output,
};
use crate::cleanup::ScratchArea;
use crate::config::{ExecutionConfig, MountMode};
use crate::error::SandboxError;

const CONTAINER_PREFIX: &str = "shellward-";
const CONTAINER_WORKSPACE: &str = "/workspace";
const CONTAINER_SCRATCH: &str = "/tmp";
const CONTAINER_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Exit codes of `docker run` and of the in-container `timeout` enforcer
const ENGINE_ERROR_EXIT: i32 = 125;
const CANNOT_INVOKE_EXIT: i32 = 126;
const NOT_FOUND_EXIT: i32 = 127;
const TIMEOUT_EXIT: i32 = 124;
const OOM_KILL_EXIT: i32 = 137;

/// Seconds `timeout` waits after SIGTERM before SIGKILL
const KILL_AFTER_SECS: u64 = 2;
/// Container start and teardown allowance on top of the command timeout
const CLIENT_WAIT_SLACK_SECS: u64 = 5;
const PULL_TIMEOUT: Duration = Duration::from_secs(300);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

enum Attempt {
    Finished(BackendOutput),
    MissingImage(String),
    Failed(SandboxError),
}

/// Docker-backed isolation: read-only root, no network, all capabilities dropped
pub struct ContainerBackend {
    docker: String,
    scratch: ScratchArea,
}

impl ContainerBackend {
    /// Create the backend and sweep scratch directories a previous process
    /// failed to remove.
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        let scratch = ScratchArea::new(scratch_root);
        scratch.sweep_marked();
        Self {
            docker: "docker".to_string(),
            scratch,
        }
    }

    /// Use a specific docker-compatible CLI (e.g. `podman`)
    pub fn with_docker_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    pub fn container_name(execution_id: &str) -> String {
        format!("{}{}", CONTAINER_PREFIX, execution_id)
    }

    fn run_args(
        &self,
        request: &RunRequest,
        workspace: &Path,
        scratch: &Path,
    ) -> Result<Vec<String>, SandboxError> {
        let config = &request.config;
        let scratch_bytes = config
            .scratch_bytes()
            .map_err(|e| SandboxError::Sandbox(format!("{:#}", e)))?;

        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            Self::container_name(&request.execution_id),
            "--pull".to_string(),
            "never".to_string(),
            "--workdir".to_string(),
            CONTAINER_WORKSPACE.to_string(),
            // Mounts
            "--volume".to_string(),
            volume_spec(workspace, CONTAINER_WORKSPACE, config.workspace_mount_mode)?,
            "--volume".to_string(),
            volume_spec(scratch, CONTAINER_SCRATCH, MountMode::Rw)?,
            // Resource limits
            "--memory".to_string(),
            config.memory_limit.clone(),
            "--cpu-quota".to_string(),
            config.cpu_quota.to_string(),
            "--cpu-period".to_string(),
            config.cpu_period.to_string(),
            "--pids-limit".to_string(),
            config.pids_limit.to_string(),
            "--ulimit".to_string(),
            format!("fsize={}:{}", scratch_bytes, scratch_bytes),
        ];

        for (key, value) in [
            ("WORKSPACE", CONTAINER_WORKSPACE),
            ("HOME", CONTAINER_SCRATCH),
            ("PATH", CONTAINER_PATH),
            ("TERM", "xterm"),
        ] {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        if config.network_disabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }

        if config.read_only_root {
            args.push("--read-only".to_string());
        }

        // Security options
        args.push("--cap-drop".to_string());
        args.push("ALL".to_string());
        args.push("--security-opt".to_string());
        args.push("no-new-privileges".to_string());

        args.push(config.base_image.clone());

        // In-container enforcer, independent of the orchestrator's own timeout
        args.push("timeout".to_string());
        args.push("-k".to_string());
        args.push(KILL_AFTER_SECS.to_string());
        args.push(config.timeout_seconds.to_string());
        args.extend(request.command.argv().iter().cloned());

        Ok(args)
    }

    async fn attempt(&self, args: &[String], request: &RunRequest) -> Attempt {
        let config = &request.config;
        let name = Self::container_name(&request.execution_id);
        let wait = Duration::from_secs(config.timeout_seconds + KILL_AFTER_SECS + CLIENT_WAIT_SLACK_SECS);

        let child = Command::new(&self.docker)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                return Attempt::Failed(SandboxError::InfrastructureUnavailable(format!(
                    "cannot launch '{}': {}",
                    self.docker, e
                )));
            }
        };

        let started = Instant::now();
        match tokio::time::timeout(wait, wait_with_capped_output(child, config.max_output_bytes)).await {
            Ok(Ok(output)) => classify(
                output.status.code(),
                &output.stdout,
                &output.stderr,
                started.elapsed(),
                config,
            ),
            Ok(Err(e)) => Attempt::Failed(SandboxError::Sandbox(format!(
                "waiting for container {} failed: {}",
                name, e
            ))),
            Err(_) => {
                warn!(
                    "Sandbox: container {} outlived its {}s budget, removing it",
                    name, config.timeout_seconds
                );
                self.remove_container(&name).await;
                Attempt::Failed(SandboxError::Timeout(config.timeout_seconds))
            }
        }
    }

    async fn pull(&self, image: &str) -> Result<(), SandboxError> {
        let pull = Command::new(&self.docker)
            .args(["pull", image])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(PULL_TIMEOUT, pull).await {
            Ok(Ok(output)) if output.status.success() => {
                info!("Sandbox: pulled image {}", image);
                Ok(())
            }
            Ok(Ok(output)) => Err(SandboxError::InfrastructureUnavailable(format!(
                "image {} is missing and could not be pulled: {}",
                image,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
            Ok(Err(e)) => Err(SandboxError::InfrastructureUnavailable(format!(
                "cannot launch '{}' to pull {}: {}",
                self.docker, image, e
            ))),
            Err(_) => Err(SandboxError::InfrastructureUnavailable(format!(
                "pulling image {} timed out",
                image
            ))),
        }
    }

    async fn remove_container(&self, name: &str) {
        let result = Command::new(&self.docker)
            .args(["rm", "-f", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            Ok(status) if status.success() => debug!("Sandbox: removed container {}", name),
            Ok(status) => debug!("Sandbox: docker rm -f {} exited with {}", name, status),
            Err(e) => warn!("Sandbox: could not remove container {}: {}", name, e),
        }
    }

    async fn run_in(
        &self,
        request: &RunRequest,
        workspace: &Path,
        scratch: &Path,
    ) -> Result<BackendOutput, SandboxError> {
        let args = self.run_args(request, workspace, scratch)?;
        let image = &request.config.base_image;

        info!(
            "Sandbox: running '{}' in {} ({})",
            preview(request.command.raw()),
            image,
            Self::container_name(&request.execution_id)
        );

        match self.attempt(&args, request).await {
            Attempt::Finished(output) => Ok(output),
            Attempt::Failed(e) => Err(e),
            Attempt::MissingImage(_) => {
                warn!("Sandbox: image {} not present locally, pulling", image);
                self.pull(image).await?;
                match self.attempt(&args, request).await {
                    Attempt::Finished(output) => Ok(output),
                    Attempt::Failed(e) => Err(e),
                    Attempt::MissingImage(detail) => Err(SandboxError::InfrastructureUnavailable(
                        format!("image {} still missing after pull: {}", image, detail.trim()),
                    )),
                }
            }
        }
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    fn tier(&self) -> Tier {
        Tier::Container
    }

    async fn health_check(&self) -> bool {
        let probe = Command::new(&self.docker)
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(HEALTH_TIMEOUT, probe).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                warn!("Sandbox: docker daemon unavailable ({})", status);
                false
            }
            Ok(Err(e)) => {
                warn!("Sandbox: cannot run '{}': {}", self.docker, e);
                false
            }
            Err(_) => {
                warn!("Sandbox: docker info timed out");
                false
            }
        }
    }

    async fn run(&self, request: &RunRequest) -> Result<BackendOutput, SandboxError> {
        let workspace = prepare_workspace(&request.workspace).await?;
        let scratch = self
            .scratch
            .create(&request.execution_id)
            .await
            .map_err(|e| {
                SandboxError::InfrastructureUnavailable(format!(
                    "cannot create scratch directory under {}: {}",
                    self.scratch.root().display(),
                    e
                ))
            })?;

        let result = self.run_in(request, &workspace, scratch.path()).await;
        self.scratch.release(scratch).await;
        result
    }

    async fn reap(&self, execution_id: &str) {
        self.remove_container(&Self::container_name(execution_id)).await;
    }
}

fn volume_spec(host: &Path, target: &str, mode: MountMode) -> Result<String, SandboxError> {
    let host = host.to_string_lossy();
    if host.contains(':') {
        return Err(SandboxError::Sandbox(format!(
            "path {} cannot be mounted: contains ':'",
            host
        )));
    }
    Ok(format!("{}:{}:{}", host, target, mode.as_str()))
}

/// Map a finished `docker run` to an outcome. `timeout` exits 124 after
/// SIGTERM and 137 when it had to follow up with SIGKILL, so both only count
/// as a timeout once `elapsed` has reached the limit. A 137 before that point
/// is the kernel's OOM kill, and a 124 is the command's own exit status.
fn classify(
    code: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
    elapsed: Duration,
    config: &ExecutionConfig,
) -> Attempt {
    let stderr_text = decode_output(stderr, config.max_output_bytes);
    let timed_out = elapsed >= Duration::from_secs(config.timeout_seconds);

    let Some(code) = code else {
        return Attempt::Failed(SandboxError::Sandbox(
            "docker client was terminated by a signal".to_string(),
        ));
    };

    if matches!(code, ENGINE_ERROR_EXIT | 1) && is_daemon_unreachable(&stderr_text) {
        return Attempt::Failed(SandboxError::InfrastructureUnavailable(
            stderr_text.trim().to_string(),
        ));
    }

    match code {
        ENGINE_ERROR_EXIT if is_missing_image(&stderr_text) => Attempt::MissingImage(stderr_text),
        ENGINE_ERROR_EXIT => Attempt::Failed(SandboxError::Sandbox(format!(
            "container engine error: {}",
            stderr_text.trim()
        ))),
        CANNOT_INVOKE_EXIT => Attempt::Failed(SandboxError::Sandbox(format!(
            "command cannot be invoked in container: {}",
            stderr_text.trim()
        ))),
        NOT_FOUND_EXIT => Attempt::Failed(SandboxError::Sandbox(format!(
            "command not found in image {}",
            config.base_image
        ))),
        TIMEOUT_EXIT | OOM_KILL_EXIT if timed_out => {
            Attempt::Failed(SandboxError::Timeout(config.timeout_seconds))
        }
        OOM_KILL_EXIT => Attempt::Failed(SandboxError::ResourceLimit(format!(
            "container was killed (exit 137), memory limit {}",
            config.memory_limit
        ))),
        code => Attempt::Finished(BackendOutput {
            stdout: decode_output(stdout, config.max_output_bytes),
            stderr: stderr_text,
            exit_code: code,
        }),
    }
}

fn is_missing_image(stderr: &str) -> bool {
    stderr.contains("No such image") || stderr.contains("Unable to find image")
}

fn is_daemon_unreachable(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("Is the docker daemon running")
        || stderr.contains("error during connect")
}

fn preview(command: &str) -> &str {
    match command.char_indices().nth(100) {
        Some((idx, _)) => &command[..idx],
        None => command,
    }
}
