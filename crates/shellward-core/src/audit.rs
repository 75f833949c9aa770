//! Audit log - append-only NDJSON record of every execution decision
//!
//! Writing is best-effort. `record` never blocks the caller and never fails;
//! if the configured directory is unusable the entry goes to a temp-dir
//! fallback, and if that fails too it is logged and dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::backend::Tier;
use crate::config::ExecutionConfig;
use crate::error::ErrorKind;
use crate::result::ExecutionResult;

pub const AUDIT_FILE_NAME: &str = "sandbox_audit.log";

const MAX_COMMAND_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allowed,
    Denied,
}

/// Resource settings in force for an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub image: String,
    pub memory_limit: String,
    pub timeout: u64,
}

impl From<&ExecutionConfig> for ConfigSnapshot {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            image: config.base_image.clone(),
            memory_limit: config.memory_limit.clone(),
            timeout: config.timeout_seconds,
        }
    }
}

/// One line of the audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub execution_id: String,
    pub user_id: String,
    pub command: String,
    /// `null` when the command never ran
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    pub backend: Option<Tier>,
    pub decision: Decision,
    pub error_kind: Option<ErrorKind>,
    pub sandbox_config: ConfigSnapshot,
}

impl AuditEntry {
    pub fn new(
        execution_id: &str,
        user_id: &str,
        command: &str,
        result: &ExecutionResult,
        config: &ExecutionConfig,
    ) -> Self {
        let error_kind = result.error_kind();
        Self {
            timestamp: Utc::now(),
            execution_id: execution_id.to_string(),
            user_id: user_id.to_string(),
            command: command.chars().take(MAX_COMMAND_CHARS).collect(),
            exit_code: result.exit_code,
            execution_time_ms: result.duration_ms,
            backend: result.backend_used,
            decision: if error_kind == Some(ErrorKind::PolicyViolation) {
                Decision::Denied
            } else {
                Decision::Allowed
            },
            error_kind,
            sandbox_config: ConfigSnapshot::from(config),
        }
    }
}

struct AuditInner {
    /// Directories tried in order until one accepts the write
    candidates: Vec<PathBuf>,
    tracker: TaskTracker,
    write_lock: Mutex<()>,
}

#[derive(Clone)]
pub struct AuditLog {
    inner: Arc<AuditInner>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let temp = std::env::temp_dir();
        let mut candidates = vec![dir.into(), temp.join("shellward_logs").join("sandbox"), temp];
        candidates.dedup();

        Self {
            inner: Arc::new(AuditInner {
                candidates,
                tracker: TaskTracker::new(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Directory entries are written to when it is usable
    pub fn primary_dir(&self) -> &Path {
        &self.inner.candidates[0]
    }

    /// Queue an entry for writing. Never blocks and never fails.
    pub fn record(&self, entry: AuditEntry) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("Audit: no async runtime, dropping entry for '{}'", entry.execution_id);
            return;
        };
        let log = self.clone();
        self.inner.tracker.spawn_on(
            async move {
                log.write(&entry).await;
            },
            &handle,
        );
    }

    /// Append one entry, falling back through the candidate directories.
    /// Returns the file written to, or `None` if every candidate failed.
    pub async fn write(&self, entry: &AuditEntry) -> Option<PathBuf> {
        let mut line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("Audit: failed to serialize entry: {}", e);
                return None;
            }
        };
        line.push('\n');

        let _guard = self.inner.write_lock.lock().await;
        for dir in &self.inner.candidates {
            match append_line(dir, &line).await {
                Ok(path) => {
                    debug!("Audit: wrote entry {} to {:?}", entry.execution_id, path);
                    return Some(path);
                }
                Err(e) => warn!("Audit: cannot write to {:?}: {}", dir, e),
            }
        }
        warn!("Audit: every location failed, dropping entry {}", entry.execution_id);
        None
    }

    /// Wait for every queued write to finish
    pub async fn flush(&self) {
        let tracker = &self.inner.tracker;
        tracker.close();
        tracker.wait().await;
        tracker.reopen();
    }
}

async fn append_line(dir: &Path, line: &str) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(AUDIT_FILE_NAME);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, result: &ExecutionResult) -> AuditEntry {
        AuditEntry::new(id, "u1", "ls -la", result, &ExecutionConfig::default())
    }

    fn read_lines(path: &Path) -> Vec<AuditEntry> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_denied_entry_has_null_exit_code() {
        let e = entry("a", &ExecutionResult::denied("Command 'rm' is denylisted"));
        assert_eq!(e.decision, Decision::Denied);
        assert_eq!(e.exit_code, None);
        assert_eq!(e.error_kind, Some(ErrorKind::PolicyViolation));

        let json = serde_json::to_value(&e).unwrap();
        assert!(json["exit_code"].is_null());
        assert_eq!(json["decision"], "denied");
        assert_eq!(json["sandbox_config"]["image"], "alpine:latest");
        assert_eq!(json["sandbox_config"]["timeout"], 30);
    }

    #[test]
    fn test_command_is_truncated() {
        let long = "x".repeat(5000);
        let e = AuditEntry::new(
            "a",
            "u1",
            &long,
            &ExecutionResult::denied("too long"),
            &ExecutionConfig::default(),
        );
        assert_eq!(e.command.chars().count(), 1000);
    }

    #[tokio::test]
    async fn test_record_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());

        for i in 0..10 {
            log.record(entry(&format!("id-{i}"), &ExecutionResult::denied("no")));
        }
        log.flush().await;

        let lines = read_lines(&dir.path().join(AUDIT_FILE_NAME));
        assert_eq!(lines.len(), 10);
        assert!(lines.iter().all(|e| e.user_id == "u1"));

        // the log keeps accepting entries after a flush
        log.record(entry("after", &ExecutionResult::denied("no")));
        log.flush().await;
        assert_eq!(read_lines(&dir.path().join(AUDIT_FILE_NAME)).len(), 11);
    }

    #[tokio::test]
    async fn test_falls_back_when_dir_unusable() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the directory should be
        let blocked = dir.path().join("blocked");
        std::fs::write(&blocked, "not a dir").unwrap();

        let log = AuditLog::new(blocked.join("logs"));
        let written = log
            .write(&entry("fallback", &ExecutionResult::denied("no")))
            .await
            .unwrap();
        assert!(written.starts_with(std::env::temp_dir()));
        assert!(written.ends_with(AUDIT_FILE_NAME));
    }
}
