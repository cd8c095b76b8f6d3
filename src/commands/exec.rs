//! Run a command inside an existing sandbox.

use anyhow::{bail, Result};
use clap::Args;
use sandboxer::runner::{Command, RunRequest};
use sandboxer::SandboxManager;
use std::process::ExitCode;
use std::time::Duration;

use super::{parse_env, report};

/// Arguments for `sandboxer exec`
#[derive(Debug, Args)]
pub struct ExecArgs {
    /// Sandbox name
    pub name: String,

    /// Timeout in seconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Working directory relative to the sandbox root
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

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

/// Build the run request for the given command line
pub fn build_request(
    command: &[String],
    timeout: Option<u64>,
    workdir: Option<&str>,
    env: &[String],
) -> Result<RunRequest> {
    let command = match command {
        [] => bail!("No command given"),
        [single] => Command::Shell(single.clone()),
        argv => Command::Argv(argv.to_vec()),
    };

    let mut request = RunRequest::new(command);
    if let Some(secs) = timeout {
        request = request.with_timeout(Duration::from_secs(secs));
    }
    if let Some(dir) = workdir {
        request = request.in_dir(dir);
    }
    for (key, value) in parse_env(env)? {
        request = request.with_env(key, value);
    }
    Ok(request)
}

/// Run the command and report its result
pub async fn run(manager: &SandboxManager, args: ExecArgs) -> Result<ExitCode> {
    let request = build_request(
        &args.command,
        args.timeout,
        args.workdir.as_deref(),
        &args.env,
    )?;
    let result = manager.run_in_sandbox(&args.name, request).await?;
    report(&result, args.json)
}
