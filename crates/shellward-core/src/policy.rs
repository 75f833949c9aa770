//! Command policy - static allow/deny gate for agent-generated commands
//!
//! Every command is tokenized and checked against dangerous patterns, a
//! denylist and a per-command allowlist before any backend sees it. Pipes,
//! substitution and background jobs are rejected outright so that argument
//! counting and flag checks stay sound.

use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Read-only git subcommands; nothing that writes to the repository
const GIT_SUBCOMMANDS: &[&str] = &[
    "status", "log", "diff", "show", "branch", "remote", "config", "help", "version",
];

/// Commands that are never run, even if they also appear in the allowlist
const DENIED_COMMANDS: &[&str] = &[
    // destructive file and disk tools
    "rm", "rmdir", "del", "delete", "erase", "dd", "mkfs", "fdisk", "parted",
    // privilege escalation
    "sudo", "su", "doas", "pkexec",
    // network scanners and raw sockets
    "nc", "netcat", "nmap", "tcpdump",
    // user and permission management
    "useradd", "usermod", "userdel", "chmod", "chown", "chgrp", "passwd", "chpasswd",
    // firewall and service control
    "iptables", "ufw", "firewall-cmd", "systemctl", "service", "initctl",
    // package managers
    "apt", "apt-get", "yum", "dnf", "pacman", "apk", "pip", "pip3", "npm", "yarn",
    // process control and power
    "kill", "killall", "pkill", "reboot", "shutdown", "halt",
    // schedulers
    "crontab", "at", "batch",
    // mounts
    "mount", "umount",
    // remote shells and copies
    "ssh", "scp", "rsync", "sftp",
    // interactive editors and pagers
    "vi", "vim", "nano", "emacs", "top", "htop", "less", "more", "man", "info",
    // shell launchers
    "bash", "sh", "zsh", "fish", "csh", "tcsh",
];

/// Patterns matched against the raw, unsplit command string
const DANGEROUS_PATTERNS: &[(&str, &str)] = &[
    ("device_redirect", r">\s*/\s*dev\s*/\s*[a-z]"),
    ("fork_bomb", r":\s*\{\s*:\s*\|\s*:&\s*\}\s*;"),
    ("remove_root", r"rm\s+-rf\s+/"),
    ("zero_root_permissions", r"chmod\s+000\s+/"),
    ("disk_zeroing", r"dd\s+if=/dev/zero"),
    ("filesystem_format", r"mkfs\."),
    ("curl_pipe_shell", r"curl\s+.*\|.*sh"),
    ("wget_pipe_shell", r"wget\s+.*\|.*sh"),
    ("eval_injection", r"eval\s+\$"),
    ("exec_redirect", r"exec\s+[0-9]"),
];

/// Allowlist entry for a single command
#[derive(Debug, Clone, Serialize)]
pub struct CommandRule {
    /// Maximum number of tokens after the command name
    pub max_args: usize,
    /// Flags the command may use; empty means flags are not checked
    pub allowed_flags: &'static [&'static str],
    /// Subcommands the command may use; empty means not checked
    pub allowed_subcommands: &'static [&'static str],
    pub description: &'static str,
}

const fn rule(
    max_args: usize,
    allowed_flags: &'static [&'static str],
    description: &'static str,
) -> CommandRule {
    CommandRule {
        max_args,
        allowed_flags,
        allowed_subcommands: &[],
        description,
    }
}

fn default_rules() -> BTreeMap<&'static str, CommandRule> {
    let mut rules = BTreeMap::new();

    // files
    rules.insert("ls", rule(10, &["-a", "-l", "-h", "-F", "-R", "-t", "-r", "-S"], "List directory contents"));
    rules.insert("pwd", rule(0, &[], "Print working directory"));
    rules.insert("cat", rule(5, &["-n", "-b", "-s", "-A"], "Print file contents"));
    rules.insert("head", rule(10, &["-n", "-c", "-q", "-v"], "Print the start of a file"));
    rules.insert("tail", rule(10, &["-n", "-c", "-f", "-q", "-v"], "Print the end of a file"));
    rules.insert(
        "grep",
        rule(
            10,
            &["-i", "-v", "-r", "-n", "-c", "-l", "-w", "-x", "--include", "--exclude", "--exclude-dir"],
            "Search text",
        ),
    );
    rules.insert("find", rule(10, &["-name", "-type", "-maxdepth", "-mindepth", "-size"], "Find files"));
    rules.insert("wc", rule(10, &["-l", "-w", "-c", "-m", "-L"], "Count lines, words and bytes"));
    rules.insert("diff", rule(10, &["-u", "-r", "-q", "-y"], "Compare files"));

    // git, read-only
    rules.insert(
        "git",
        CommandRule {
            max_args: 20,
            allowed_flags: &[],
            allowed_subcommands: GIT_SUBCOMMANDS,
            description: "Read-only git operations",
        },
    );

    // interpreters
    rules.insert("python", rule(10, &["-c", "-m", "-V"], "Run a Python script"));
    rules.insert("python3", rule(10, &["-c", "-m", "-V"], "Run a Python 3 script"));

    // text processing
    rules.insert("echo", rule(20, &["-n", "-e"], "Print text"));
    rules.insert("sort", rule(10, &["-r", "-n", "-u", "-k", "-t"], "Sort lines"));
    rules.insert("uniq", rule(5, &["-c", "-d", "-u"], "Collapse duplicate lines"));
    rules.insert("sed", rule(10, &["-n", "-e", "-i"], "Stream editor"));
    rules.insert("awk", rule(10, &[], "Pattern scanning and processing"));

    // system information
    rules.insert("df", rule(5, &["-h", "-H", "-i", "-T"], "Disk usage by filesystem"));
    rules.insert("du", rule(10, &["-h", "-s", "-d", "-c"], "Disk usage by directory"));
    rules.insert("date", rule(5, &["-d", "-r"], "Print the date"));
    rules.insert("uname", rule(5, &["-a", "-r", "-s", "-n"], "System information"));
    rules.insert("whoami", rule(0, &[], "Current user"));
    rules.insert("id", rule(5, &["-u", "-g", "-G"], "User and group ids"));
    rules.insert("sleep", rule(1, &[], "Delay for a number of seconds"));

    // archives
    rules.insert("tar", rule(10, &["-c", "-x", "-t", "-v", "-f", "-z"], "Archive files"));
    rules.insert("gzip", rule(5, &["-d", "-k", "-v"], "Compress files"));
    rules.insert("gunzip", rule(5, &["-k", "-v"], "Decompress files"));

    // network, read-only
    rules.insert("curl", rule(10, &["-I", "-i", "-s", "-o"], "HTTP request"));
    rules.insert("wget", rule(10, &["-O", "-q", "-S"], "HTTP download"));

    rules
}

/// A command split into argv-style tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Command {
    raw: String,
    tokens: Vec<String>,
}

impl Command {
    /// Tokenize with POSIX shell quoting rules.
    ///
    /// Fails on unbalanced quotes or input with no tokens.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let tokens = shlex::split(raw)
            .ok_or_else(|| "Command could not be parsed: unbalanced quotes or escape".to_string())?;
        if tokens.is_empty() {
            return Err("Empty command".to_string());
        }
        Ok(Self {
            raw: raw.to_string(),
            tokens,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn program(&self) -> &str {
        &self.tokens[0]
    }

    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }
}

/// A command that passed policy validation.
///
/// Only [`CommandPolicy::validate`] can produce one, and backends only
/// accept this type, so a denied command cannot reach a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand(Command);

impl ValidatedCommand {
    pub fn command(&self) -> &Command {
        &self.0
    }

    pub fn raw(&self) -> &str {
        self.0.raw()
    }

    pub fn argv(&self) -> &[String] {
        self.0.tokens()
    }
}

/// Outcome of validating one command
#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    #[serde(skip)]
    validated: Option<ValidatedCommand>,
}

impl PolicyDecision {
    fn allow(command: Command) -> Self {
        Self {
            allowed: true,
            reason: None,
            validated: Some(ValidatedCommand(command)),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            validated: None,
        }
    }

    /// Consume the decision, yielding the validated command or the denial reason
    pub fn into_validated(self) -> Result<ValidatedCommand, String> {
        match self.validated {
            Some(cmd) if self.allowed => Ok(cmd),
            _ => Err(self
                .reason
                .unwrap_or_else(|| "Command denied by policy".to_string())),
        }
    }
}

struct CompiledPattern {
    name: &'static str,
    regex: Regex,
}

/// Static command validator
pub struct CommandPolicy {
    rules: BTreeMap<&'static str, CommandRule>,
    denied: BTreeSet<&'static str>,
    patterns: Vec<CompiledPattern>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandPolicy {
    pub fn new() -> Self {
        let patterns = DANGEROUS_PATTERNS
            .iter()
            .filter_map(|&(name, pattern)| match Regex::new(pattern) {
                Ok(regex) => Some(CompiledPattern { name, regex }),
                Err(e) => {
                    warn!("Failed to compile policy pattern '{}': {}", name, e);
                    None
                }
            })
            .collect();

        Self {
            rules: default_rules(),
            denied: DENIED_COMMANDS.iter().copied().collect(),
            patterns,
        }
    }

    /// Decide whether a command may run. First failing rule wins.
    pub fn validate(&self, command: &str) -> PolicyDecision {
        let decision = self.check(command);
        match &decision.reason {
            Some(reason) => debug!("Policy: denied '{}': {}", preview(command), reason),
            None => debug!("Policy: allowed '{}'", preview(command)),
        }
        decision
    }

    fn check(&self, raw: &str) -> PolicyDecision {
        let command = match Command::parse(raw) {
            Ok(cmd) => cmd,
            Err(reason) => return PolicyDecision::deny(reason),
        };

        if raw.trim_end().ends_with('&') {
            return PolicyDecision::deny("Background execution (&) is not allowed");
        }

        if raw.contains('|') {
            return PolicyDecision::deny("Pipelines (|) are not supported");
        }

        if raw.contains("$(") || raw.contains('`') {
            return PolicyDecision::deny("Command substitution is not allowed");
        }

        if let Some(pattern) = self.patterns.iter().find(|p| p.regex.is_match(raw)) {
            return PolicyDecision::deny(format!(
                "Command matches dangerous pattern '{}'",
                pattern.name
            ));
        }

        let program = command.program();

        if self.denied.contains(program) {
            return PolicyDecision::deny(format!("Command '{}' is denylisted", program));
        }

        let Some(rule) = self.rules.get(program) else {
            return PolicyDecision::deny(format!("Command '{}' is not in the allowlist", program));
        };

        let arg_count = command.args().len();
        if arg_count > rule.max_args {
            return PolicyDecision::deny(format!(
                "Too many arguments for '{}' (max {}, got {})",
                program, rule.max_args, arg_count
            ));
        }

        if !rule.allowed_flags.is_empty() {
            if let Err(reason) = check_flags(command.args(), rule.allowed_flags) {
                return PolicyDecision::deny(reason);
            }
        }

        if program == "git" {
            if let Some(sub) = command.args().first() {
                if !rule.allowed_subcommands.contains(&sub.as_str()) {
                    return PolicyDecision::deny(format!(
                        "Git subcommand '{}' is not allowed (allowed: {})",
                        sub,
                        rule.allowed_subcommands.join(", ")
                    ));
                }
            }
        }

        PolicyDecision::allow(command)
    }

    /// Allowlist entry for a command name
    pub fn command_info(&self, name: &str) -> Option<&CommandRule> {
        self.rules.get(name)
    }

    /// Sorted names of every allowlisted command
    pub fn allowed_commands(&self) -> Vec<&'static str> {
        self.rules.keys().copied().collect()
    }

    /// Sorted names of every denylisted command
    pub fn denied_commands(&self) -> Vec<&'static str> {
        self.denied.iter().copied().collect()
    }
}

fn check_flags(args: &[String], allowed: &[&str]) -> Result<(), String> {
    let is_allowed = |flag: &str| allowed.contains(&flag);

    for arg in args.iter().filter(|a| a.starts_with('-')) {
        if arg.starts_with("--") {
            let base = arg.split('=').next().unwrap_or(arg);
            if !is_allowed(base) {
                return Err(format!("Flag '{}' is not allowed", arg));
            }
            continue;
        }

        let body = &arg[1..];
        if body.chars().count() > 1 && !body.contains('-') {
            // single-dash long flag (-name) or a cluster of short flags (-la)
            if is_allowed(arg.as_str()) {
                continue;
            }
            for c in body.chars() {
                let short = format!("-{}", c);
                if !is_allowed(&short) {
                    return Err(format!("Flag '{}' is not allowed", short));
                }
            }
        } else if !is_allowed(arg.as_str()) {
            return Err(format!("Flag '{}' is not allowed", arg));
        }
    }

    Ok(())
}

fn preview(command: &str) -> &str {
    match command.char_indices().nth(100) {
        Some((idx, _)) => &command[..idx],
        None => command,
    }
}
