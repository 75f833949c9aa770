//! Lightweight backend - firejail restriction without a container engine

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    BackendOutput, IsolationBackend, RunRequest, Tier, decode_output, prepare_workspace,
    wait_with_capped_output,
};
use crate::error::SandboxError;

const JAIL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
/// Slack for firejail's own `--timeout` to fire before ours does
const KILL_SLACK_SECS: u64 = 2;
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
/// `timeout`-style exit status
const TIMEOUT_EXIT: i32 = 124;
/// Exits above this mean the jailed process died from a signal
const SIGNAL_EXIT_BASE: i32 = 128;

pub struct LightweightBackend {
    firejail: String,
}

impl Default for LightweightBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LightweightBackend {
    pub fn new() -> Self {
        Self {
            firejail: "firejail".to_string(),
        }
    }

    pub fn with_firejail_binary(mut self, firejail: impl Into<String>) -> Self {
        self.firejail = firejail.into();
        self
    }

    fn jail_args(&self, request: &RunRequest, workspace: &Path) -> Result<Vec<String>, SandboxError> {
        let config = &request.config;
        let memory = config
            .memory_bytes()
            .map_err(|e| SandboxError::Sandbox(format!("{:#}", e)))?;
        let scratch = config
            .scratch_bytes()
            .map_err(|e| SandboxError::Sandbox(format!("{:#}", e)))?;
        let workspace = workspace.to_string_lossy();

        let mut args = vec![
            "--quiet".to_string(),
            "--noprofile".to_string(),
            "--caps.drop=all".to_string(),
            "--nonewprivs".to_string(),
            "--noroot".to_string(),
            "--seccomp".to_string(),
            "--private-tmp".to_string(),
            "--private-dev".to_string(),
            format!("--whitelist={}", workspace),
        ];
        if config.network_disabled {
            args.push("--net=none".to_string());
        }
        if config.workspace_mount_mode.is_read_only() {
            args.push(format!("--read-only={}", workspace));
        }
        args.push(format!("--rlimit-as={}", memory));
        args.push(format!("--rlimit-nproc={}", config.pids_limit));
        args.push(format!("--rlimit-fsize={}", scratch));
        args.push(format!("--timeout={}", hms(config.timeout_seconds)));
        args.push("--".to_string());
        args.extend(request.command.argv().iter().cloned());
        Ok(args)
    }
}

#[async_trait]
impl IsolationBackend for LightweightBackend {
    fn tier(&self) -> Tier {
        Tier::Lightweight
    }

    async fn health_check(&self) -> bool {
        if !cfg!(target_os = "linux") {
            debug!("Sandbox: firejail tier needs Linux");
            return false;
        }

        let probe = Command::new(&self.firejail)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        match tokio::time::timeout(HEALTH_TIMEOUT, probe).await {
            Ok(Ok(status)) if status.success() => true,
            Ok(Ok(status)) => {
                warn!("Sandbox: firejail --version failed ({})", status);
                false
            }
            Ok(Err(e)) => {
                warn!("Sandbox: firejail not usable: {}", e);
                false
            }
            Err(_) => {
                warn!("Sandbox: firejail --version timed out");
                false
            }
        }
    }

    async fn run(&self, request: &RunRequest) -> Result<BackendOutput, SandboxError> {
        let workspace = prepare_workspace(&request.workspace).await?;
        let args = self.jail_args(request, &workspace)?;
        let config = &request.config;

        info!("Sandbox: running {:?} under firejail", request.command.command().program());

        let child = Command::new(&self.firejail)
            .args(&args)
            .current_dir(&workspace)
            .env_clear()
            .env("PATH", JAIL_PATH)
            .env("HOME", &workspace)
            .env("TERM", "xterm")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SandboxError::InfrastructureUnavailable(format!(
                    "cannot launch '{}': {}",
                    self.firejail, e
                ))
            })?;

        let started = Instant::now();
        let limit = Duration::from_secs(config.timeout_seconds + KILL_SLACK_SECS);
        let output = match tokio::time::timeout(
            limit,
            wait_with_capped_output(child, config.max_output_bytes),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SandboxError::Sandbox(format!("waiting for firejail failed: {}", e)));
            }
            Err(_) => {
                warn!("Sandbox: firejail run exceeded {}s, killed", config.timeout_seconds);
                return Err(SandboxError::Timeout(config.timeout_seconds));
            }
        };

        let Some(code) = output.status.code() else {
            return Err(SandboxError::Sandbox(
                "firejail was terminated by a signal".to_string(),
            ));
        };
        if hit_jail_timeout(code, started.elapsed(), config.timeout_seconds) {
            return Err(SandboxError::Timeout(config.timeout_seconds));
        }

        Ok(BackendOutput {
            stdout: decode_output(&output.stdout, config.max_output_bytes),
            stderr: decode_output(&output.stderr, config.max_output_bytes),
            exit_code: code,
        })
    }
}

/// firejail's `--timeout` kills the jailed process, so a timeout shows up as a
/// kill status once the limit has passed. Ordinary failures of a slow command
/// stay output.
fn hit_jail_timeout(code: i32, elapsed: Duration, timeout_seconds: u64) -> bool {
    elapsed >= Duration::from_secs(timeout_seconds) && (code == TIMEOUT_EXIT || code > SIGNAL_EXIT_BASE)
}

/// firejail's `--timeout` takes `hh:mm:ss`
fn hms(seconds: u64) -> String {
    format!("{:02}:{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, MountMode};
    use crate::policy::CommandPolicy;
    use std::path::PathBuf;

    fn request(command: &str, config: ExecutionConfig, workspace: PathBuf) -> RunRequest {
        RunRequest {
            command: CommandPolicy::new().validate(command).into_validated().unwrap(),
            workspace,
            config,
            execution_id: "jail-test".to_string(),
        }
    }

    #[test]
    fn test_hms() {
        assert_eq!(hms(30), "00:00:30");
        assert_eq!(hms(3725), "01:02:05");
    }

    #[test]
    fn test_hit_jail_timeout() {
        let past = Duration::from_secs(31);
        let before = Duration::from_secs(5);

        assert!(hit_jail_timeout(124, past, 30));
        assert!(hit_jail_timeout(137, past, 30));
        assert!(hit_jail_timeout(143, past, 30));
        // a slow grep that matched nothing
        assert!(!hit_jail_timeout(1, past, 30));
        assert!(!hit_jail_timeout(0, past, 30));
        // killed before the limit is not a timeout
        assert!(!hit_jail_timeout(137, before, 30));
        assert!(!hit_jail_timeout(124, before, 30));
    }

    #[test]
    fn test_jail_args() {
        let backend = LightweightBackend::new();
        let req = request("ls -la", ExecutionConfig::default(), PathBuf::from("/work"));
        let args = backend.jail_args(&req, Path::new("/work")).unwrap();

        for flag in [
            "--noprofile",
            "--net=none",
            "--caps.drop=all",
            "--nonewprivs",
            "--noroot",
            "--seccomp",
            "--whitelist=/work",
            "--read-only=/work",
            "--rlimit-nproc=100",
            "--rlimit-as=536870912",
            "--timeout=00:00:30",
        ] {
            assert!(args.contains(&flag.to_string()), "missing {flag}");
        }

        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], ["ls", "-la"]);
    }

    #[test]
    fn test_jail_args_rw_workspace_with_network() {
        let backend = LightweightBackend::new();
        let config = ExecutionConfig {
            workspace_mount_mode: MountMode::Rw,
            network_disabled: false,
            ..ExecutionConfig::default()
        };
        let req = request("pwd", config, PathBuf::from("/work"));
        let args = backend.jail_args(&req, Path::new("/work")).unwrap();
        assert!(!args.iter().any(|a| a.starts_with("--read-only")));
        assert!(!args.contains(&"--net=none".to_string()));
    }

    #[tokio::test]
    async fn test_missing_firejail() {
        let workspace = tempfile::tempdir().unwrap();
        let backend = LightweightBackend::new().with_firejail_binary("/nonexistent/firejail");
        assert!(!backend.health_check().await);

        let req = request("ls", ExecutionConfig::default(), workspace.path().to_path_buf());
        let err = backend.run(&req).await.unwrap_err();
        assert!(err.is_infrastructure());
    }
}
