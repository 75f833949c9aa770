//! shellward - run agent-generated shell commands behind a policy and a sandbox

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use shellward_core::{Orchestrator, ShellwardConfig};

#[derive(Parser)]
#[command(name = "shellward")]
#[command(version)]
#[command(about = "Policy-gated, tiered sandbox for shell commands", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/shellward/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate and run a command, printing the result as JSON
    Exec {
        /// The command line, quoted as one argument
        command: String,

        /// Workspace directory the command runs in
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// User id recorded in the audit log
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Show the policy decision for a command without running it
    Check {
        command: String,
    },

    /// List allowed commands and their rules
    Policy {
        /// List the denylist instead
        #[arg(long)]
        denied: bool,
    },

    /// Probe the isolation tiers and print their status
    Health,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shellward")
        .join("config.toml")
}

fn load_config(explicit: Option<&Path>) -> Result<ShellwardConfig> {
    match explicit {
        Some(path) => ShellwardConfig::load(path),
        None => {
            let path = default_config_path();
            if path.exists() {
                ShellwardConfig::load(&path)
            } else {
                debug!("No config at {:?}, using defaults", path);
                Ok(ShellwardConfig::default())
            }
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_exec(config: ShellwardConfig, command: &str, workspace: &Path, user: Option<String>) -> Result<i32> {
    let user = user
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "cli".to_string());

    let orchestrator = Orchestrator::new(config).await;
    let result = orchestrator.execute(command, workspace, &user).await;
    orchestrator.flush_audit().await;

    print_json(&result)?;
    Ok(result.exit_code.unwrap_or(1))
}

fn cmd_check(command: &str) -> Result<i32> {
    let decision = shellward_core::CommandPolicy::new().validate(command);
    print_json(&decision)?;
    Ok(if decision.allowed { 0 } else { 1 })
}

fn cmd_policy(denied: bool) -> Result<i32> {
    let policy = shellward_core::CommandPolicy::new();
    if denied {
        for name in policy.denied_commands() {
            println!("{}", name);
        }
        return Ok(0);
    }

    for name in policy.allowed_commands() {
        let Some(rule) = policy.command_info(name) else {
            continue;
        };
        let mut line = format!("{:<10} max {:>2} args  {}", name, rule.max_args, rule.description);
        if !rule.allowed_flags.is_empty() {
            line.push_str(&format!("  flags: {}", rule.allowed_flags.join(" ")));
        }
        if !rule.allowed_subcommands.is_empty() {
            line.push_str(&format!("  subcommands: {}", rule.allowed_subcommands.join(" ")));
        }
        println!("{}", line);
    }
    Ok(0)
}

async fn cmd_health(config: ShellwardConfig) -> Result<i32> {
    let orchestrator = Orchestrator::new(config).await;
    print_json(&orchestrator.health())?;
    Ok(0)
}

fn cmd_init(path: Option<&Path>, force: bool) -> Result<i32> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = ShellwardConfig::default().to_toml()?;
    std::fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Wrote default config to {}", path.display());
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "shellward=debug,shellward_core=debug"
    } else {
        "shellward=info,shellward_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let code = match cli.command {
        Commands::Exec {
            command,
            workspace,
            user,
        } => {
            let config = load_config(cli.config.as_deref())?;
            info!("shellward v{} starting", env!("CARGO_PKG_VERSION"));
            cmd_exec(config, &command, &workspace, user).await?
        }
        Commands::Check { command } => cmd_check(&command)?,
        Commands::Policy { denied } => cmd_policy(denied)?,
        Commands::Health => cmd_health(load_config(cli.config.as_deref())?).await?,
        Commands::Init { force } => cmd_init(cli.config.as_deref(), force)?,
    };

    std::process::exit(code);
}
