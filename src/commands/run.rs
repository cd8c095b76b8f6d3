//! One-shot execution in a throwaway sandbox.
//!
//! The sandbox is created, used once and destroyed again, even when the
//! command itself fails.

use anyhow::Result;
use clap::Args;
use sandboxer::sandbox::{BackendType, SandboxSpec};
use sandboxer::SandboxManager;
use std::process::ExitCode;
use tracing::warn;
use uuid::Uuid;

use super::exec::build_request;
use super::report;

/// Arguments for `sandboxer run`
#[derive(Debug, Args)]
pub struct RunArgs {
    /// Backend: isolated_process, container or os_sandbox
    #[arg(short, long, default_value = "isolated_process")]
    pub backend: BackendType,

    /// Package to install before running (repeatable)
    #[arg(short = 'r', long = "requirement")]
    pub requirements: Vec<String>,

    /// Timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Environment variable KEY=VALUE (repeatable)
    #[arg(short, long = "env")]
    pub env: Vec<String>,

    /// Print the full result as JSON
    #[arg(long)]
    pub json: bool,

    /// Command to run. A single argument is interpreted by the shell.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Name for an ephemeral sandbox
pub fn ephemeral_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("run_{}", &id[..8])
}

/// Create, run, destroy
pub async fn run(manager: &SandboxManager, args: RunArgs) -> Result<ExitCode> {
    let request = build_request(&args.command, args.timeout, None, &args.env)?;
    let name = ephemeral_name();
    let spec = SandboxSpec::new(args.backend).with_requirements(args.requirements);

    manager.create_sandbox(&name, spec).await?;
    let outcome = manager.run_in_sandbox(&name, request).await;

    match manager.cleanup_sandbox(&name, true).await {
        Ok(true) => {}
        Ok(false) => warn!(sandbox = %name, "Ephemeral sandbox was not fully removed"),
        Err(e) => warn!(sandbox = %name, error = %e, "Failed to clean up ephemeral sandbox"),
    }

    report(&outcome?, args.json)
}
