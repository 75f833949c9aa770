//! Configuration - resource limits, tier selection, audit and scratch locations

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::backend::Tier;

/// How the workspace is mounted inside the isolation unit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    #[default]
    Ro,
    Rw,
}

impl MountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountMode::Ro => "ro",
            MountMode::Rw => "rw",
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, MountMode::Ro)
    }
}

/// Resource and isolation settings applied to every execution on a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub base_image: String,
    /// Docker-style size, e.g. "512m"
    pub memory_limit: String,
    pub cpu_quota: u64,
    pub cpu_period: u64,
    pub pids_limit: u64,
    pub timeout_seconds: u64,
    pub network_disabled: bool,
    pub read_only_root: bool,
    pub workspace_mount_mode: MountMode,
    /// Largest file the command may write to scratch, e.g. "100m"
    pub scratch_size: String,
    pub max_output_bytes: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            base_image: "alpine:latest".to_string(),
            memory_limit: "512m".to_string(),
            cpu_quota: 100_000,
            cpu_period: 100_000,
            pids_limit: 100,
            timeout_seconds: 30,
            network_disabled: true,
            read_only_root: true,
            workspace_mount_mode: MountMode::Ro,
            scratch_size: "100m".to_string(),
            max_output_bytes: 1024 * 1024, // 1MB
        }
    }
}

impl ExecutionConfig {
    pub fn memory_bytes(&self) -> Result<u64> {
        parse_size(&self.memory_limit).with_context(|| format!("invalid memory_limit '{}'", self.memory_limit))
    }

    pub fn scratch_bytes(&self) -> Result<u64> {
        parse_size(&self.scratch_size).with_context(|| format!("invalid scratch_size '{}'", self.scratch_size))
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_image.trim().is_empty() {
            bail!("base_image must not be empty");
        }
        self.memory_bytes()?;
        self.scratch_bytes()?;
        if self.timeout_seconds == 0 {
            bail!("timeout_seconds must be greater than zero");
        }
        if self.cpu_period == 0 {
            bail!("cpu_period must be greater than zero");
        }
        if self.pids_limit == 0 {
            bail!("pids_limit must be greater than zero");
        }
        Ok(())
    }
}

/// Per-tier switch with an optional override of the shared execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionConfig>,
}

fn default_true() -> bool {
    true
}

impl TierConfig {
    fn enabled() -> Self {
        Self {
            enabled: true,
            execution: None,
        }
    }

    fn disabled() -> Self {
        Self {
            enabled: false,
            execution: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub container: TierConfig,
    pub lightweight: TierConfig,
    /// The subprocess tier is always available; only its overrides are read
    pub subprocess: TierConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            container: TierConfig::enabled(),
            lightweight: TierConfig::disabled(),
            subprocess: TierConfig::enabled(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_dir")]
    pub dir: PathBuf,
}

fn default_audit_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("shellward").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: default_audit_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScratchConfig {
    #[serde(default = "default_scratch_root")]
    pub root: PathBuf,
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("shellward-scratch")
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            root: default_scratch_root(),
        }
    }
}

/// Top-level configuration, loaded once per process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellwardConfig {
    /// Number of executions that may hold an isolation unit at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Slack on top of `timeout_seconds` before the orchestrator stops waiting
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub tiers: TiersConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub scratch: ScratchConfig,
}

fn default_max_concurrent() -> usize {
    8
}

fn default_grace_seconds() -> u64 {
    10
}

impl Default for ShellwardConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            grace_seconds: default_grace_seconds(),
            execution: ExecutionConfig::default(),
            tiers: TiersConfig::default(),
            audit: AuditConfig::default(),
            scratch: ScratchConfig::default(),
        }
    }
}

impl ShellwardConfig {
    /// Read a TOML file, expanding `${VAR}` references first
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {:?}", path);
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = shellexpand::env(content).context("failed to expand environment variables")?;
        let config: ShellwardConfig = toml::from_str(&expanded).context("failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            bail!("max_concurrent must be greater than zero");
        }
        self.execution.validate().context("[execution]")?;
        for tier in Tier::ALL {
            if let Some(exec) = &self.tier(tier).execution {
                exec.validate()
                    .with_context(|| format!("[tiers.{}.execution]", tier))?;
            }
        }
        Ok(())
    }

    pub fn tier(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Container => &self.tiers.container,
            Tier::Lightweight => &self.tiers.lightweight,
            Tier::Subprocess => &self.tiers.subprocess,
        }
    }

    pub fn is_tier_enabled(&self, tier: Tier) -> bool {
        tier == Tier::Subprocess || self.tier(tier).enabled
    }

    /// Execution settings for a tier: its override if present, else the shared block
    pub fn execution_for(&self, tier: Tier) -> &ExecutionConfig {
        self.tier(tier).execution.as_ref().unwrap_or(&self.execution)
    }
}

/// Parse a size such as `512m`, `1g`, `64k` or `1024` into bytes
pub fn parse_size(input: &str) -> Result<u64> {
    let s = input.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').filter(|rest| !rest.is_empty()).unwrap_or(&s);
    let (digits, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1024),
        Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (s, 1),
        _ => bail!("unrecognized size '{}'", input),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("unrecognized size '{}'", input))?;
    if value == 0 {
        bail!("size must be greater than zero");
    }
    value
        .checked_mul(multiplier)
        .with_context(|| format!("size '{}' overflows", input))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_config_default() {
        let config = ExecutionConfig::default();
        assert_eq!(config.base_image, "alpine:latest");
        assert_eq!(config.memory_limit, "512m");
        assert_eq!(config.timeout_seconds, 30);
        assert!(config.network_disabled);
        assert!(config.read_only_root);
        assert_eq!(config.workspace_mount_mode, MountMode::Ro);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("64kb").unwrap(), 64 * 1024);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("10b").unwrap(), 10);
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("0m").is_err());
        assert!(parse_size("m").is_err());
    }

    #[test]
    fn test_tiers_default() {
        let config = ShellwardConfig::default();
        assert!(config.is_tier_enabled(Tier::Container));
        assert!(!config.is_tier_enabled(Tier::Lightweight));
        assert!(config.is_tier_enabled(Tier::Subprocess));
    }

    #[test]
    fn test_subprocess_tier_cannot_be_disabled() {
        let mut config = ShellwardConfig::default();
        config.tiers.subprocess.enabled = false;
        assert!(config.is_tier_enabled(Tier::Subprocess));
    }

    #[test]
    fn test_from_toml_minimal() {
        let config = ShellwardConfig::from_toml("").unwrap();
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.execution, ExecutionConfig::default());
    }

    #[test]
    fn test_from_toml_overrides() {
        let toml = r#"
max_concurrent = 2

[execution]
base_image = "busybox:latest"
memory_limit = "256m"
workspace_mount_mode = "rw"

[tiers.lightweight]
enabled = true

[tiers.subprocess.execution]
timeout_seconds = 10
"#;
        let config = ShellwardConfig::from_toml(toml).unwrap();
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.execution.base_image, "busybox:latest");
        assert_eq!(config.execution.workspace_mount_mode, MountMode::Rw);
        // unspecified fields keep their defaults
        assert_eq!(config.execution.pids_limit, 100);
        assert!(config.is_tier_enabled(Tier::Lightweight));

        assert_eq!(config.execution_for(Tier::Subprocess).timeout_seconds, 10);
        assert_eq!(config.execution_for(Tier::Container).timeout_seconds, 30);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        assert!(ShellwardConfig::from_toml("max_concurrent = 0").is_err());
        assert!(ShellwardConfig::from_toml("[execution]\nmemory_limit = \"huge\"").is_err());
        assert!(ShellwardConfig::from_toml("[execution]\ntimeout_seconds = 0").is_err());
        assert!(ShellwardConfig::from_toml("[execution]\nworkspace_mount_mode = \"rx\"").is_err());
        assert!(
            ShellwardConfig::from_toml("[tiers.container.execution]\ncpu_period = 0").is_err()
        );
    }

    #[test]
    fn test_toml_roundtrip_of_defaults() {
        let config = ShellwardConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = ShellwardConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shellward.toml");
        std::fs::write(&path, "grace_seconds = 3\n").unwrap();
        let config = ShellwardConfig::load(&path).unwrap();
        assert_eq!(config.grace_seconds, 3);

        assert!(ShellwardConfig::load(dir.path().join("missing.toml")).is_err());
    }
}
