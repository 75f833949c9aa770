//! Subprocess backend - last resort, the command policy is the only guard
//!
//! Runs the validated argv directly with a cleared environment. There is no
//! filesystem or network isolation on this tier. On unix the child gets
//! rlimits for CPU time, address space, open files and processes, and its
//! wall-clock cap is kept short regardless of configuration.

use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use super::{
    BackendOutput, IsolationBackend, RunRequest, Tier, decode_output, prepare_workspace,
    wait_with_capped_output,
};
#[cfg(unix)]
use crate::config::ExecutionConfig;
use crate::error::SandboxError;

const SUBPROCESS_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_TIMEOUT_SECS: u64 = 30;
const NOT_FOUND_EXIT: i32 = 127;
#[cfg(unix)]
const MAX_OPEN_FILES: u64 = 1024;

/// rlimits applied to the child between fork and exec
#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChildLimits {
    cpu_seconds: u64,
    address_space: u64,
    open_files: u64,
    processes: u64,
}

#[cfg(unix)]
impl ChildLimits {
    fn from_config(config: &ExecutionConfig, timeout: u64) -> Result<Self, SandboxError> {
        let address_space = config
            .memory_bytes()
            .map_err(|e| SandboxError::Sandbox(format!("{:#}", e)))?;
        Ok(Self {
            cpu_seconds: timeout,
            address_space,
            open_files: MAX_OPEN_FILES,
            processes: config.pids_limit,
        })
    }

    /// Runs in the forked child, so only async-signal-safe calls are made
    fn apply(&self) -> std::io::Result<()> {
        set_rlimit(libc::RLIMIT_CPU as _, self.cpu_seconds)?;
        set_rlimit(libc::RLIMIT_AS as _, self.address_space)?;
        set_rlimit(libc::RLIMIT_NOFILE as _, self.open_files)?;
        set_rlimit(libc::RLIMIT_NPROC as _, self.processes)?;
        Ok(())
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RlimitResource = libc::__rlimit_resource_t;
#[cfg(all(unix, not(all(target_os = "linux", target_env = "gnu"))))]
type RlimitResource = libc::c_int;

/// Lower soft and hard limits to `value`, never above the current hard limit
#[cfg(unix)]
fn set_rlimit(resource: RlimitResource, value: u64) -> std::io::Result<()> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `current` is a valid rlimit for getrlimit to fill
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let value = (value as libc::rlim_t).min(current.rlim_max);
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: setrlimit only reads `limit`
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct SubprocessBackend;

impl SubprocessBackend {
    pub fn new() -> Self {
        Self
    }

    fn effective_timeout(configured: u64) -> u64 {
        configured.min(MAX_TIMEOUT_SECS)
    }
}

#[async_trait]
impl IsolationBackend for SubprocessBackend {
    fn tier(&self) -> Tier {
        Tier::Subprocess
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn run(&self, request: &RunRequest) -> Result<BackendOutput, SandboxError> {
        let workspace = prepare_workspace(&request.workspace).await?;
        let config = &request.config;
        let timeout = Self::effective_timeout(config.timeout_seconds);

        let Some((program, args)) = request.command.argv().split_first() else {
            return Err(SandboxError::system("empty command"));
        };

        warn!(
            "Sandbox: running '{}' as a plain subprocess, no isolation",
            program
        );

        let mut command = Command::new(program);
        #[cfg(unix)]
        {
            let limits = ChildLimits::from_config(config, timeout)?;
            // SAFETY: the hook only calls getrlimit and setrlimit
            unsafe {
                command.pre_exec(move || limits.apply());
            }
        }

        let child = command
            .args(args)
            .current_dir(&workspace)
            .env_clear()
            .env("PATH", SUBPROCESS_PATH)
            .env("HOME", &workspace)
            .env("TERM", "xterm")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(SandboxError::System {
                    message: format!("command not found: {}", program),
                    exit_code: Some(NOT_FOUND_EXIT),
                });
            }
            Err(e) => {
                return Err(SandboxError::system(format!("failed to start '{}': {}", program, e)));
            }
        };

        let output = match tokio::time::timeout(
            Duration::from_secs(timeout),
            wait_with_capped_output(child, config.max_output_bytes),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SandboxError::system(format!("failed to wait for '{}': {}", program, e)));
            }
            Err(_) => {
                warn!("Sandbox: subprocess '{}' exceeded {}s, killed", program, timeout);
                return Err(SandboxError::Timeout(timeout));
            }
        };

        let Some(code) = output.status.code() else {
            return Err(SandboxError::system(format!("'{}' was terminated by a signal", program)));
        };

        info!("Sandbox: subprocess '{}' exited with {}", program, code);
        Ok(BackendOutput {
            stdout: decode_output(&output.stdout, config.max_output_bytes),
            stderr: decode_output(&output.stderr, config.max_output_bytes),
            exit_code: code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::error::ErrorKind;
    use crate::policy::CommandPolicy;
    use std::path::Path;

    fn request(command: &str, workspace: &Path, timeout_seconds: u64) -> RunRequest {
        request_with(
            command,
            workspace,
            ExecutionConfig {
                timeout_seconds,
                ..ExecutionConfig::default()
            },
        )
    }

    fn request_with(command: &str, workspace: &Path, config: ExecutionConfig) -> RunRequest {
        RunRequest {
            command: CommandPolicy::new().validate(command).into_validated().unwrap(),
            workspace: workspace.to_path_buf(),
            config,
            execution_id: "sub-test".to_string(),
        }
    }

    /// Peak resident set size of this process in kB
    #[cfg(target_os = "linux")]
    fn peak_rss_kb() -> u64 {
        std::fs::read_to_string("/proc/self/status")
            .unwrap()
            .lines()
            .find_map(|l| l.strip_prefix("VmHWM:"))
            .and_then(|v| v.trim().trim_end_matches("kB").trim().parse().ok())
            .unwrap()
    }

    #[test]
    fn test_timeout_is_capped() {
        assert_eq!(SubprocessBackend::effective_timeout(5), 5);
        assert_eq!(SubprocessBackend::effective_timeout(300), 30);
    }

    #[tokio::test]
    async fn test_always_healthy() {
        assert!(SubprocessBackend::new().health_check().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_lists_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();

        let out = SubprocessBackend::new()
            .run(&request("ls -la", dir.path(), 10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("hello.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = SubprocessBackend::new()
            .run(&request("cat missing.txt", dir.path(), 10))
            .await
            .unwrap();
        assert_ne!(out.exit_code, 0);
        assert!(!out.stderr.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_workspace_with_clean_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = SubprocessBackend::new()
            .run(&request("pwd", dir.path(), 10))
            .await
            .unwrap();
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(out.stdout.trim(), canonical.to_string_lossy());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = SubprocessBackend::new()
            .run(&request("sleep 5", dir.path(), 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SandboxTimeout);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_limits_from_config() {
        let limits = ChildLimits::from_config(&ExecutionConfig::default(), 30).unwrap();
        assert_eq!(
            limits,
            ChildLimits {
                cpu_seconds: 30,
                address_space: 512 * 1024 * 1024,
                open_files: 1024,
                processes: 100,
            }
        );

        let bad = ExecutionConfig {
            memory_limit: "lots".to_string(),
            ..ExecutionConfig::default()
        };
        assert!(ChildLimits::from_config(&bad, 30).is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_child_runs_under_rlimits() {
        let dir = tempfile::tempdir().unwrap();
        let out = SubprocessBackend::new()
            .run(&request("cat /proc/self/limits", dir.path(), 10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);

        let row = |name: &str| -> Vec<String> {
            let line = out.stdout.lines().find(|l| l.starts_with(name)).unwrap();
            line[name.len()..].split_whitespace().map(str::to_string).collect()
        };
        // soft and hard limits can only go down from the parent's values
        for (name, expected) in [
            ("Max cpu time", 10u64),
            ("Max address space", 512 * 1024 * 1024),
            ("Max open files", 1024),
            ("Max processes", 100),
        ] {
            let fields = row(name);
            for value in &fields[..2] {
                let value: u64 = value.parse().unwrap();
                assert!(value <= expected, "{name}: {value} > {expected}");
            }
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_large_output_is_capped_while_reading() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExecutionConfig {
            timeout_seconds: 20,
            max_output_bytes: 1024,
            ..ExecutionConfig::default()
        };

        let before = peak_rss_kb();
        let out = SubprocessBackend::new()
            .run(&request_with("head -c 400000000 /dev/zero", dir.path(), config))
            .await
            .unwrap();
        let grown_kb = peak_rss_kb().saturating_sub(before);

        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.ends_with("[output truncated]"));
        assert!(out.stdout.len() < 1100);
        assert!(grown_kb < 100 * 1024, "peak RSS grew by {grown_kb} kB");
    }

    #[tokio::test]
    async fn test_missing_workspace() {
        let err = SubprocessBackend::new()
            .run(&request("ls", Path::new("/nonexistent/shellward-ws"), 10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sandbox);
    }
}
