//! List registered sandboxes.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use sandboxer::sandbox::{BackendType, Sandbox, SandboxFilter, SandboxState};
use sandboxer::SandboxManager;
use std::fmt::Write;

/// Arguments for `sandboxer list`
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Only sandboxes of this backend
    #[arg(short, long)]
    pub backend: Option<BackendType>,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

/// Pads before coloring so escape codes don't skew the column
fn colored_state(state: SandboxState) -> String {
    let label = format!("{:<9}", format!("{state:?}").to_lowercase());
    match state {
        SandboxState::Ready => label.green().to_string(),
        SandboxState::Running | SandboxState::Creating => label.yellow().to_string(),
        SandboxState::Error => label.red().to_string(),
        SandboxState::Stopped | SandboxState::Destroyed => label.dimmed().to_string(),
    }
}

/// Format sandboxes as an aligned table
pub fn format_table(sandboxes: &[Sandbox]) -> String {
    let mut out = String::new();

    if sandboxes.is_empty() {
        writeln!(&mut out, "{} No sandboxes", "ℹ".blue()).unwrap();
        return out;
    }

    let width = sandboxes
        .iter()
        .map(|s| s.name.len())
        .max()
        .unwrap_or(0)
        .max(4);

    writeln!(
        &mut out,
        "{:<width$}  {:<16}  {:<9}  {:<10}  {}",
        "NAME".bold(),
        "BACKEND".bold(),
        "STATE".bold(),
        "PERSISTENT".bold(),
        "LAST USED".bold(),
    )
    .unwrap();

    for sandbox in sandboxes {
        writeln!(
            &mut out,
            "{:<width$}  {:<16}  {}  {:<10}  {}",
            sandbox.name,
            sandbox.backend_type.to_string(),
            colored_state(sandbox.state),
            if sandbox.persistent { "yes" } else { "no" },
            sandbox
                .last_used_at
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
                .dimmed(),
        )
        .unwrap();
    }
    out
}

/// Print the registered sandboxes
pub async fn run(manager: &SandboxManager, args: ListArgs) -> Result<()> {
    let filter = SandboxFilter {
        backend_type: args.backend,
        ..SandboxFilter::default()
    };
    let sandboxes = manager.list_sandboxes(&filter).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&sandboxes)?);
    } else {
        print!("{}", format_table(&sandboxes));
    }
    Ok(())
}
