//! CLI command implementations.
//!
//! Each submodule implements one sandboxer command with pure parsing and
//! formatting separated from the manager calls.

pub mod cleanup;
pub mod create;
pub mod exec;
pub mod list;
pub mod run;

use anyhow::{bail, Result};
use colored::Colorize;
use sandboxer::runner::CommandResult;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::process::ExitCode;

/// Parse repeated `KEY=VALUE` arguments
pub fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid environment variable '{pair}', expected KEY=VALUE");
        };
        if key.is_empty() {
            bail!("Invalid environment variable '{pair}', empty name");
        }
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Format the summary printed after a command ran
pub fn format_result(result: &CommandResult) -> String {
    let mut out = String::new();
    let secs = result.duration.as_secs_f64();

    if result.success {
        writeln!(&mut out, "{} exit 0 in {:.2}s", "✓".green(), secs).unwrap();
    } else {
        let reason = result.error.as_deref().unwrap_or("failed");
        writeln!(&mut out, "{} {} ({:.2}s)", "✗".red(), reason.red(), secs).unwrap();
    }

    for warning in &result.warnings {
        writeln!(&mut out, "  {} {}", "⚠".yellow(), warning.yellow()).unwrap();
    }

    if !result.files_generated.is_empty() {
        writeln!(&mut out, "  Generated:").unwrap();
        for file in &result.files_generated {
            writeln!(&mut out, "    {}", file.cyan()).unwrap();
        }
    }
    out
}

/// Print a command result and map it to the process exit code
pub fn report(result: &CommandResult, json: bool) -> Result<ExitCode> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", result.stdout);
        eprint!("{}", result.stderr);
        eprint!("{}", format_result(result));
    }
    Ok(exit_code(result))
}

/// Exit code the CLI reports for a command result
pub fn exit_code(result: &CommandResult) -> ExitCode {
    if result.timed_out {
        return ExitCode::from(124);
    }
    match result.exit_code {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::from(137),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_env() {
        let env = parse_env(&["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(env["A"], "1");
        assert_eq!(env["B"], "x=y");
    }

    #[test]
    fn test_parse_env_rejects_malformed() {
        assert!(parse_env(&["NOVALUE".to_string()]).is_err());
        assert!(parse_env(&["=1".to_string()]).is_err());
    }

    #[test]
    fn test_format_result_success() {
        let result = CommandResult {
            success: true,
            exit_code: Some(0),
            duration: Duration::from_millis(250),
            files_generated: vec!["out.txt".to_string()],
            ..Default::default()
        };
        let output = format_result(&result);
        assert!(output.contains("exit 0"));
        assert!(output.contains("out.txt"));
    }

    #[test]
    fn test_format_result_timeout_and_warnings() {
        let result = CommandResult {
            timed_out: true,
            error: Some("timed out after 1s".to_string()),
            warnings: vec!["memory mb at 85% of limit (85.0 / 100.0)".to_string()],
            ..Default::default()
        };
        let output = format_result(&result);
        assert!(output.contains("timed out after 1s"));
        assert!(output.contains("memory mb at 85%"));
    }

    #[test]
    fn test_exit_code_mapping() {
        let ok = CommandResult {
            exit_code: Some(0),
            ..Default::default()
        };
        assert_eq!(exit_code(&ok), ExitCode::SUCCESS);

        let timed_out = CommandResult {
            timed_out: true,
            ..Default::default()
        };
        assert_eq!(exit_code(&timed_out), ExitCode::from(124));
    }
}
