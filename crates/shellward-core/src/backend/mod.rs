//! Isolation backends - the three tiers a validated command can run on
//!
//! Tiers are ordered from strongest to weakest isolation:
//!
//! 1. [`ContainerBackend`] - docker, capabilities dropped, no network
//! 2. [`LightweightBackend`] - firejail, no container engine needed
//! 3. [`SubprocessBackend`] - plain child process, policy is the only guard
//!
//! No tier runs the command through a shell: the validated tokens are
//! passed as argv.

pub mod container;
pub mod lightweight;
pub mod subprocess;

pub use container::ContainerBackend;
pub use lightweight::LightweightBackend;
pub use subprocess::SubprocessBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;

use crate::config::ExecutionConfig;
use crate::error::SandboxError;
use crate::policy::ValidatedCommand;

/// Longest canonical workspace path accepted by any tier
const MAX_WORKSPACE_PATH_LEN: usize = 4096;

/// Isolation tier, strongest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Container,
    Lightweight,
    Subprocess,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Container, Tier::Lightweight, Tier::Subprocess];

    pub fn index(self) -> usize {
        match self {
            Tier::Container => 0,
            Tier::Lightweight => 1,
            Tier::Subprocess => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Tier> {
        Tier::ALL.get(index).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Container => "container",
            Tier::Lightweight => "lightweight",
            Tier::Subprocess => "subprocess",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a backend needs for one run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: ValidatedCommand,
    pub workspace: PathBuf,
    pub config: ExecutionConfig,
    /// Unique per attempt; names the isolation unit so it can be reaped
    pub execution_id: String,
}

/// Raw output of a process that ran to completion
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// A way of running a validated command in isolation
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn tier(&self) -> Tier;

    /// Whether the isolation primitive can currently be created
    async fn health_check(&self) -> bool;

    /// Run the command. Non-zero exits of the command itself are `Ok`.
    async fn run(&self, request: &RunRequest) -> Result<BackendOutput, SandboxError>;

    /// Best-effort removal of an isolation unit the orchestrator gave up on
    async fn reap(&self, _execution_id: &str) {}
}

/// Check and canonicalize the workspace before any tier touches it
pub(crate) async fn prepare_workspace(path: &Path) -> Result<PathBuf, SandboxError> {
    let metadata = tokio::fs::metadata(path).await.map_err(|e| {
        SandboxError::Sandbox(format!("workspace {} is not accessible: {}", path.display(), e))
    })?;
    if !metadata.is_dir() {
        return Err(SandboxError::Sandbox(format!(
            "workspace {} is not a directory",
            path.display()
        )));
    }

    let resolved = tokio::fs::canonicalize(path).await.map_err(|e| {
        SandboxError::Sandbox(format!("cannot resolve workspace {}: {}", path.display(), e))
    })?;
    let len = resolved.as_os_str().len();
    if len > MAX_WORKSPACE_PATH_LEN {
        return Err(SandboxError::Sandbox(format!(
            "workspace path too long: {} characters",
            len
        )));
    }
    Ok(resolved)
}

/// Output of a finished child, each stream holding at most `max_bytes + 1` bytes
pub(crate) struct CapturedOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Wait for a child with piped stdout and stderr, keeping only the first
/// `max_bytes + 1` bytes of each stream. The rest is read and discarded so
/// the child never blocks on a full pipe.
pub(crate) async fn wait_with_capped_output(
    mut child: Child,
    max_bytes: usize,
) -> std::io::Result<CapturedOutput> {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (stdout, stderr, status) = tokio::try_join!(
        read_capped(stdout, max_bytes),
        read_capped(stderr, max_bytes),
        child.wait(),
    )?;
    Ok(CapturedOutput {
        status,
        stdout,
        stderr,
    })
}

async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    max_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut kept = Vec::new();
    // One byte past the cap marks the output as truncated
    (&mut reader)
        .take(max_bytes as u64 + 1)
        .read_to_end(&mut kept)
        .await?;
    tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok(kept)
}

/// Decode process output, capping it at `max_bytes` on a char boundary
pub(crate) fn decode_output(bytes: &[u8], max_bytes: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > max_bytes {
        let mut cut = max_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push_str("\n... [output truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order() {
        assert!(Tier::Container < Tier::Lightweight);
        assert!(Tier::Lightweight < Tier::Subprocess);
        for tier in Tier::ALL {
            assert_eq!(Tier::from_index(tier.index()), Some(tier));
        }
        assert_eq!(Tier::from_index(3), None);
    }

    #[test]
    fn test_tier_serde() {
        assert_eq!(serde_json::to_string(&Tier::Lightweight).unwrap(), "\"lightweight\"");
        assert_eq!(Tier::Container.to_string(), "container");
    }

    #[tokio::test]
    async fn test_prepare_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = prepare_workspace(dir.path()).await.unwrap();
        assert!(resolved.is_absolute());

        let missing = prepare_workspace(&dir.path().join("missing")).await;
        assert!(matches!(missing, Err(SandboxError::Sandbox(_))));

        let file = dir.path().join("file.txt");
        std::fs::write(&file, "x").unwrap();
        let err = prepare_workspace(&file).await.unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn test_read_capped_keeps_prefix_and_drains_rest() {
        let mut source = tokio::io::repeat(b'z').take(8 * 1024 * 1024);
        let kept = read_capped(Some(&mut source), 1024).await.unwrap();
        assert_eq!(kept.len(), 1025);
        assert!(kept.iter().all(|b| *b == b'z'));

        // everything past the cap was consumed, not left in the pipe
        let mut rest = Vec::new();
        source.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let short = read_capped(Some(&b"abc"[..]), 1024).await.unwrap();
        assert_eq!(short, b"abc");
        assert!(read_capped::<&[u8]>(None, 10).await.unwrap().is_empty());
    }

    #[test]
    fn test_decode_output_truncates_on_char_boundary() {
        assert_eq!(decode_output(b"hello", 10), "hello");

        let text = "héllo".as_bytes(); // 'é' is two bytes at index 1..3
        let out = decode_output(text, 2);
        assert!(out.starts_with('h'));
        assert!(out.ends_with("[output truncated]"));
    }
}
