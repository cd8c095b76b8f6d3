//! Command execution inside a sandbox.
//!
//! The runner is always called with the sandbox's execution lock held. It
//! moves the sandbox `ready -> running -> ready` around one command, and the
//! way back to `ready` (with transient file removal and persistence) happens
//! on every exit path, including a dropped future.

mod files;
mod process;

pub use files::{validate_relative, FileContent, TransientFiles};
#[cfg(test)]
pub(crate) use process::NoopObserver;
pub use process::{
    is_alive, kill_pid, run_process, terminate_group, ExecOptions, ProcessObserver, ProcessOutput,
};

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, Invocation};
use crate::config::ExecutionConfig;
use crate::error::{Result, SandboxError};
use crate::registry::{SandboxEntry, SandboxGuard};
use crate::sandbox::{ProcessHandle, SandboxState, WARNING_THRESHOLD};
use crate::state::StateStore;

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A command line for the configured shell (`<shell> -c <line>`).
    Shell(String),
    /// A program and its arguments, executed directly.
    Argv(Vec<String>),
}

impl Command {
    /// Resolves to the argv actually executed.
    pub fn to_argv(&self, shell: &str) -> Vec<String> {
        match self {
            Self::Shell(line) => vec![shell.to_string(), "-c".to_string(), line.clone()],
            Self::Argv(argv) => argv.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Shell(line) => line.trim().is_empty(),
            Self::Argv(argv) => argv.is_empty(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(line) => f.write_str(line),
            Self::Argv(argv) => f.write_str(&shell_words::join(argv)),
        }
    }
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        Self::Shell(line.to_string())
    }
}

impl From<String> for Command {
    fn from(line: String) -> Self {
        Self::Shell(line)
    }
}

impl From<Vec<String>> for Command {
    fn from(argv: Vec<String>) -> Self {
        Self::Argv(argv)
    }
}

/// One call to `run_in_sandbox`.
///
/// # Example
///
/// ```
/// use sandboxer::runner::RunRequest;
/// use std::time::Duration;
///
/// let request = RunRequest::new("python3 main.py")
///     .with_file("main.py", "print('hi')")
///     .with_env("DEBUG", "1")
///     .with_timeout(Duration::from_secs(10));
/// assert_eq!(request.files.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// What to run.
    pub command: Command,
    /// Input files, relative to the sandbox directory. Removed after the run.
    pub files: BTreeMap<String, FileContent>,
    /// Per-call environment, layered over the sandbox environment.
    pub env: BTreeMap<String, String>,
    /// Directory relative to the sandbox directory. Created if missing.
    pub working_dir: Option<PathBuf>,
    /// Deadline. Falls back to the configured default.
    pub timeout: Option<Duration>,
    /// Collect stdout and stderr. Output is discarded otherwise.
    pub capture_output: bool,
}

impl RunRequest {
    /// A request with no files, no extra environment and the default timeout.
    pub fn new(command: impl Into<Command>) -> Self {
        Self {
            command: command.into(),
            files: BTreeMap::new(),
            env: BTreeMap::new(),
            working_dir: None,
            timeout: None,
            capture_output: true,
        }
    }

    #[must_use]
    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<FileContent>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }
}

/// Outcome of one command. A failed or timed-out command is still an `Ok`
/// result; only infrastructure problems are errors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandResult {
    /// Exited with code 0 before the deadline.
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// `None` if the command was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    #[serde(rename = "execution_time", serialize_with = "serialize_secs")]
    pub duration: Duration,
    /// Why the command did not succeed.
    pub error: Option<String>,
    pub timed_out: bool,
    /// Limits the run came close to.
    pub warnings: Vec<String>,
    /// Files created by the command, relative to the sandbox directory.
    pub files_generated: Vec<String>,
}

fn serialize_secs<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl CommandResult {
    fn from_output(output: ProcessOutput, timeout: Duration) -> Self {
        let error = if output.timed_out {
            Some(format!("timed out after {}s", timeout.as_secs_f64()))
        } else {
            match output.exit_code {
                Some(0) => None,
                Some(code) => Some(format!("exited with code {code}")),
                None => Some("terminated by signal".to_string()),
            }
        };

        Self {
            success: !output.timed_out && output.exit_code == Some(0),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration: output.duration,
            error,
            timed_out: output.timed_out,
            warnings: Vec::new(),
            files_generated: Vec::new(),
        }
    }
}

impl ProcessObserver for SandboxEntry {
    fn spawned(&self, pid: u32) {
        self.set_process_handle(Some(ProcessHandle::new(pid)));
    }

    fn exited(&self, pid: u32) {
        self.update(|sandbox| {
            if sandbox.process_handle.is_some_and(|h| h.pid == pid) {
                sandbox.process_handle = None;
            }
        });
    }
}

/// Runs commands in sandboxes whose lock the caller holds.
pub struct CommandRunner {
    config: ExecutionConfig,
}

impl CommandRunner {
    /// A runner applying `config` defaults to every request.
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    /// Runs `request` in the guarded sandbox.
    ///
    /// # Errors
    ///
    /// - `NotReady` if the sandbox is not `ready`
    /// - `ResourceExceeded` if the last sample is already over a limit
    /// - `InvalidPath` for input files or a working directory outside the
    ///   sandbox
    /// - `Infrastructure` if files cannot be written or the process cannot
    ///   be spawned
    ///
    /// None of these leave the sandbox in a different state than before.
    #[instrument(skip_all, fields(sandbox = %guard.name()))]
    pub async fn execute(
        &self,
        guard: &SandboxGuard,
        backend: &dyn Backend,
        request: RunRequest,
    ) -> Result<CommandResult> {
        let entry = guard.entry();
        let sandbox = entry.snapshot();

        if sandbox.state != SandboxState::Ready {
            return Err(SandboxError::not_ready(&sandbox.name, sandbox.state));
        }

        if let Some(limits) = &sandbox.resource_limits {
            let breaches = limits.exceeded(&sandbox.resource_usage);
            if !breaches.is_empty() {
                return Err(SandboxError::resource_exceeded(
                    &sandbox.name,
                    breaches.join("; "),
                ));
            }
        }

        if request.command.is_empty() {
            return Err(SandboxError::infrastructure("empty command"));
        }

        let working_dir = match &request.working_dir {
            Some(dir) => sandbox.directory.join(validate_relative(dir)?),
            None => sandbox.directory.clone(),
        };
        std::fs::create_dir_all(&working_dir)?;

        let root = sandbox.directory.clone();
        let before = tokio::task::spawn_blocking(move || files::snapshot(&root))
            .await
            .map_err(|e| SandboxError::infrastructure(format!("directory scan failed: {e}")))?;
        let inputs = TransientFiles::materialize(&sandbox.directory, &request.files)?;

        let timeout = request.timeout.unwrap_or_else(|| self.config.default_timeout());
        let mut env = sandbox.environment.clone();
        env.extend(request.env);
        let invocation = Invocation {
            argv: request.command.to_argv(&self.config.shell),
            env,
            working_dir,
            options: ExecOptions {
                timeout,
                kill_grace: self.config.kill_grace(),
                sample_interval: self.config.sample_interval(),
                capture_output: request.capture_output,
            },
        };

        entry.transition(SandboxState::Ready, SandboxState::Running)?;
        let mut running = RunningSandbox::new(Arc::clone(entry));
        save_best_effort(entry);

        info!(command = %request.command, timeout_secs = timeout.as_secs_f64(), "Running command");
        let outcome = backend.execute(&sandbox, &invocation, &**entry).await;

        // From here on every path finalizes.
        let result = match outcome {
            Ok(output) => {
                let peak = output.peak_usage;
                let mut result = CommandResult::from_output(output, timeout);
                if let Some(usage) = peak {
                    entry.record_usage(usage);
                    if let Some(limits) = &sandbox.resource_limits {
                        result.warnings = limits.approaching(&usage, WARNING_THRESHOLD);
                    }
                }
                for warning in &result.warnings {
                    warn!("{}", warning);
                }
                let root = sandbox.directory.clone();
                let transient = inputs.relative_paths().clone();
                result.files_generated = tokio::task::spawn_blocking(move || {
                    files::generated(&root, &before, &transient)
                })
                .await
                .unwrap_or_else(|e| {
                    warn!("Directory scan failed: {}", e);
                    Vec::new()
                });
                Ok(result)
            }
            Err(e) => Err(e),
        };

        inputs.remove();
        let next = match &result {
            Err(e) if e.is_provision_failed() => SandboxState::Error,
            _ => SandboxState::Ready,
        };
        running.finish(next);

        match &result {
            Ok(r) => info!(
                success = r.success,
                exit_code = ?r.exit_code,
                duration_ms = r.duration.as_millis(),
                "Command finished"
            ),
            Err(e) => warn!("Command failed to run: {}", e),
        }
        result
    }
}

/// Holds a sandbox in `running`; restores it when finished or dropped.
struct RunningSandbox {
    entry: Arc<SandboxEntry>,
    done: bool,
}

impl RunningSandbox {
    fn new(entry: Arc<SandboxEntry>) -> Self {
        Self { entry, done: false }
    }

    fn finish(&mut self, next: SandboxState) {
        self.done = true;
        match self.entry.transition(SandboxState::Running, next) {
            Ok(()) => {
                if next == SandboxState::Ready {
                    self.entry.update(|sandbox| sandbox.touch());
                }
            }
            Err(e) => warn!("Failed to leave running state: {}", e),
        }
        save_best_effort(&self.entry);
    }
}

impl Drop for RunningSandbox {
    fn drop(&mut self) {
        if !self.done {
            debug!(sandbox = %self.entry.name(), "Run abandoned, restoring ready state");
            self.finish(SandboxState::Ready);
        }
    }
}

fn save_best_effort(entry: &SandboxEntry) {
    if let Err(e) = StateStore::save(&entry.snapshot()) {
        warn!(sandbox = %entry.name(), "Failed to persist state: {}", e);
    }
}
