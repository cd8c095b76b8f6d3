//! Create a persistent sandbox.
//!
//! Arguments are turned into a `SandboxSpec` by a pure function so the
//! mapping is testable without provisioning anything.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use sandboxer::sandbox::{BackendType, NetworkConfig, ResourceLimits, Sandbox, SandboxSpec};
use sandboxer::SandboxManager;
use std::fmt::Write;
use std::time::Duration;

use super::parse_env;

/// Arguments for `sandboxer create`
#[derive(Debug, Args)]
pub struct CreateArgs {
    /// Sandbox name (letters, digits and underscores)
    pub name: String,

    /// Backend: isolated_process, container or os_sandbox
    #[arg(short, long, default_value = "isolated_process")]
    pub backend: BackendType,

    /// Package to install (repeatable)
    #[arg(short = 'r', long = "requirement")]
    pub requirements: Vec<String>,

    /// Environment variable KEY=VALUE (repeatable)
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Memory ceiling in MiB
    #[arg(long)]
    pub memory_mb: Option<f64>,

    /// CPU ceiling in percent
    #[arg(long)]
    pub cpu_percent: Option<f64>,

    /// Maximum number of processes
    #[arg(long)]
    pub max_processes: Option<u32>,

    /// Disable networking
    #[arg(long)]
    pub no_network: bool,

    /// Provisioning timeout in seconds
    #[arg(long, default_value = "300")]
    pub timeout: u64,
}

/// Limits requested on the command line, if any
pub fn build_limits(args: &CreateArgs) -> Option<ResourceLimits> {
    if args.memory_mb.is_none() && args.cpu_percent.is_none() && args.max_processes.is_none() {
        return None;
    }
    Some(ResourceLimits {
        memory_mb: args.memory_mb,
        cpu_percent: args.cpu_percent,
        max_processes: args.max_processes,
        ..ResourceLimits::default()
    })
}

/// Map CLI arguments to a creation spec. Sandboxes created from the CLI are persistent.
pub fn build_spec(args: &CreateArgs) -> Result<SandboxSpec> {
    let mut spec = SandboxSpec::new(args.backend)
        .with_requirements(args.requirements.clone())
        .with_timeout(Duration::from_secs(args.timeout))
        .persistent(true);

    for (key, value) in parse_env(&args.env)? {
        spec = spec.with_env(key, value);
    }
    if let Some(limits) = build_limits(args) {
        spec = spec.with_limits(limits);
    }
    if args.no_network {
        spec = spec.with_network(NetworkConfig::disabled());
    }
    Ok(spec)
}

/// Format the created sandbox as a displayable string
pub fn format_created(sandbox: &Sandbox) -> String {
    let mut out = String::new();
    writeln!(
        &mut out,
        "{} Created sandbox {} ({})",
        "✓".green(),
        sandbox.name.bold(),
        sandbox.backend_type
    )
    .unwrap();
    writeln!(
        &mut out,
        "  {}",
        sandbox.directory.display().to_string().dimmed()
    )
    .unwrap();
    if !sandbox.requirements.is_empty() {
        writeln!(&mut out, "  Installed: {}", sandbox.requirements.join(", ")).unwrap();
    }
    out
}

/// Create the sandbox and report it
pub async fn run(manager: &SandboxManager, args: CreateArgs) -> Result<()> {
    let spec = build_spec(&args)?;
    let sandbox = manager.create_sandbox(&args.name, spec).await?;
    print!("{}", format_created(&sandbox));
    Ok(())
}
