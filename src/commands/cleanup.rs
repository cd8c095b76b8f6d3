//! Destroy a sandbox.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use sandboxer::SandboxManager;
use std::fmt::Write;

/// Arguments for `sandboxer cleanup`
#[derive(Debug, Args)]
pub struct CleanupArgs {
    /// Sandbox name
    pub name: String,

    /// Kill a running command and remove the directory even if persistent
    #[arg(short, long)]
    pub force: bool,
}

/// What cleanup did, for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub name: String,
    pub clean: bool,
    pub kept_on_disk: bool,
}

/// Format a cleanup report as a displayable string
pub fn format_report(report: &CleanupReport) -> String {
    let mut out = String::new();
    if report.clean {
        writeln!(&mut out, "{} Destroyed {}", "✓".green(), report.name.bold()).unwrap();
    } else {
        writeln!(
            &mut out,
            "{} Destroyed {} with errors, see log",
            "✗".red(),
            report.name.bold()
        )
        .unwrap();
    }
    if report.kept_on_disk {
        writeln!(
            &mut out,
            "  {} {}",
            "ℹ".blue(),
            "Persistent sandbox kept on disk (use --force to remove)".dimmed()
        )
        .unwrap();
    }
    out
}

/// Destroy the sandbox and report the outcome
pub async fn run(manager: &SandboxManager, args: CleanupArgs) -> Result<()> {
    let persistent = manager.get_sandbox(&args.name).await?.persistent;
    let clean = manager.cleanup_sandbox(&args.name, args.force).await?;

    print!(
        "{}",
        format_report(&CleanupReport {
            name: args.name,
            clean,
            kept_on_disk: persistent && !args.force,
        })
    );
    Ok(())
}
