//! Isolated-process backend: a private interpreter environment inside the
//! sandbox directory.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{Backend, Invocation, ENV_DIR};
use crate::config::IsolatedConfig;
use crate::error::{Result, SandboxError};
use crate::runner::{run_process, ProcessObserver, ProcessOutput};
use crate::sandbox::{BackendType, ProcessHandle, Sandbox};

#[cfg(windows)]
const BIN_DIR: &str = "Scripts";
#[cfg(not(windows))]
const BIN_DIR: &str = "bin";

/// Builds a virtual environment per sandbox and runs commands with it first
/// on `PATH`.
pub struct IsolatedBackend {
    config: IsolatedConfig,
}

impl IsolatedBackend {
    pub fn new(config: IsolatedConfig) -> Self {
        Self { config }
    }

    fn env_dir(sandbox: &Sandbox) -> PathBuf {
        sandbox.directory.join(ENV_DIR)
    }

    async fn provision(&self, sandbox: &Sandbox) -> Result<()> {
        let env_dir = Self::env_dir(sandbox);

        if self.config.create_venv {
            info!(sandbox = %sandbox.name, interpreter = %self.config.interpreter, "Creating virtual environment");
            let mut command = Command::new(&self.config.interpreter);
            command.arg("-m").arg("venv").arg(&env_dir);
            run_tool(sandbox, command).await?;
        } else {
            fs::create_dir_all(env_dir.join(BIN_DIR))?;
        }

        if sandbox.requirements.is_empty() {
            return Ok(());
        }

        let installer = env_dir.join(BIN_DIR).join(&self.config.package_installer);
        if !installer.is_file() {
            return Err(SandboxError::provision_failed(
                &sandbox.name,
                format!("package installer not found at {}", installer.display()),
            ));
        }

        info!(sandbox = %sandbox.name, packages = ?sandbox.requirements, "Installing requirements");
        let mut command = Command::new(&installer);
        command.arg("install").args(&sandbox.requirements);
        run_tool(sandbox, command).await
    }
}

#[async_trait]
impl Backend for IsolatedBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::IsolatedProcess
    }

    async fn create(&self, sandbox: &Sandbox) -> Result<Option<ProcessHandle>> {
        if !sandbox.network_config.enabled {
            debug!(sandbox = %sandbox.name, "Network policy is advisory for isolated processes");
        }

        if let Err(e) = self.provision(sandbox).await {
            if !sandbox.persistent {
                remove_partial(&Self::env_dir(sandbox));
            }
            return Err(e);
        }
        Ok(None)
    }

    async fn execute(
        &self,
        sandbox: &Sandbox,
        invocation: &Invocation,
        observer: &dyn ProcessObserver,
    ) -> Result<ProcessOutput> {
        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or_else(|| SandboxError::infrastructure("empty command"))?;

        let env_dir = Self::env_dir(sandbox);
        let bin_dir = env_dir.join(BIN_DIR);
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let path = std::env::join_paths(
            std::iter::once(bin_dir).chain(std::env::split_paths(&inherited)),
        )
        .map_err(|e| SandboxError::infrastructure(format!("invalid PATH: {e}")))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&invocation.working_dir)
            .env("VIRTUAL_ENV", &env_dir)
            .env("PATH", path)
            .envs(&invocation.env);

        run_process(command, &invocation.options, observer).await
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<()> {
        debug!(sandbox = %sandbox.name, "Nothing to release outside the sandbox directory");
        Ok(())
    }
}

/// Runs a provisioning tool to completion. The caller bounds the duration;
/// dropping the future kills the tool.
async fn run_tool(sandbox: &Sandbox, mut command: Command) -> Result<()> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();
    let output = command
        .current_dir(&sandbox.directory)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| SandboxError::provision_failed(&sandbox.name, format!("{program}: {e}")))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    let tail: Vec<&str> = tail.into_iter().rev().collect();
    Err(SandboxError::provision_failed(
        &sandbox.name,
        format!("{program} exited with {}: {}", output.status, tail.join("\n")),
    ))
}

fn remove_partial(env_dir: &Path) {
    if !env_dir.exists() {
        return;
    }
    match fs::remove_dir_all(env_dir) {
        Ok(()) => debug!("Removed partial environment {}", env_dir.display()),
        Err(e) => warn!(
            "Failed to remove partial environment {}: {}",
            env_dir.display(),
            e
        ),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runner::{ExecOptions, NoopObserver};
    use crate::sandbox::SandboxSpec;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config(create_venv: bool) -> IsolatedConfig {
        IsolatedConfig {
            create_venv,
            ..IsolatedConfig::default()
        }
    }

    fn sandbox(dir: &Path, spec: &SandboxSpec) -> Sandbox {
        Sandbox::new("iso", dir.to_path_buf(), spec)
    }

    fn invocation(sandbox: &Sandbox, argv: &[&str]) -> Invocation {
        Invocation {
            argv: argv.iter().map(|s| (*s).to_string()).collect(),
            env: BTreeMap::from([("GREETING".to_string(), "hello".to_string())]),
            working_dir: sandbox.directory.clone(),
            options: ExecOptions {
                timeout: Duration::from_secs(5),
                kill_grace: Duration::from_millis(200),
                sample_interval: Duration::from_millis(50),
                capture_output: true,
            },
        }
    }

    #[tokio::test]
    async fn test_create_without_venv_lays_out_bin() {
        let dir = tempdir().unwrap();
        let backend = IsolatedBackend::new(config(false));
        let sandbox = sandbox(dir.path(), &SandboxSpec::new(BackendType::IsolatedProcess));

        assert!(backend.create(&sandbox).await.unwrap().is_none());
        assert!(dir.path().join(ENV_DIR).join(BIN_DIR).is_dir());
    }

    #[tokio::test]
    async fn test_execute_sets_environment() {
        let dir = tempdir().unwrap();
        let backend = IsolatedBackend::new(config(false));
        let sandbox = sandbox(dir.path(), &SandboxSpec::new(BackendType::IsolatedProcess));
        backend.create(&sandbox).await.unwrap();

        let output = backend
            .execute(
                &sandbox,
                &invocation(&sandbox, &["sh", "-c", "echo $GREETING; echo $VIRTUAL_ENV"]),
                &NoopObserver,
            )
            .await
            .unwrap();

        let lines: Vec<&str> = output.stdout.lines().collect();
        assert_eq!(lines[0], "hello");
        assert!(lines[1].ends_with(ENV_DIR));
    }

    #[tokio::test]
    async fn test_env_bin_is_first_on_path() {
        let dir = tempdir().unwrap();
        let backend = IsolatedBackend::new(config(false));
        let sandbox = sandbox(dir.path(), &SandboxSpec::new(BackendType::IsolatedProcess));
        backend.create(&sandbox).await.unwrap();

        let tool = dir.path().join(ENV_DIR).join(BIN_DIR).join("sandbox_tool");
        fs::write(&tool, "#!/bin/sh\necho from-env\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let output = backend
            .execute(&sandbox, &invocation(&sandbox, &["sh", "-c", "sandbox_tool"]), &NoopObserver)
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "from-env");
    }

    #[tokio::test]
    async fn test_missing_interpreter_fails_and_cleans_up() {
        let dir = tempdir().unwrap();
        let backend = IsolatedBackend::new(IsolatedConfig {
            interpreter: "/nonexistent/python".to_string(),
            ..IsolatedConfig::default()
        });
        let sandbox = sandbox(dir.path(), &SandboxSpec::new(BackendType::IsolatedProcess));

        let err = backend.create(&sandbox).await.unwrap_err();
        assert!(err.is_provision_failed());
        assert!(!dir.path().join(ENV_DIR).exists());
    }

    #[tokio::test]
    async fn test_requirements_without_installer_fail() {
        let dir = tempdir().unwrap();
        let backend = IsolatedBackend::new(config(false));
        let spec = SandboxSpec::new(BackendType::IsolatedProcess).with_requirement("requests");
        let sandbox = sandbox(dir.path(), &spec);

        let err = backend.create(&sandbox).await.unwrap_err();
        assert!(err.is_provision_failed());
        assert!(!dir.path().join(ENV_DIR).exists());
    }

    #[tokio::test]
    async fn test_persistent_keeps_partial_environment() {
        let dir = tempdir().unwrap();
        let backend = IsolatedBackend::new(config(false));
        let spec = SandboxSpec::new(BackendType::IsolatedProcess)
            .with_requirement("requests")
            .persistent(true);
        let sandbox = sandbox(dir.path(), &spec);

        assert!(backend.create(&sandbox).await.is_err());
        assert!(dir.path().join(ENV_DIR).join(BIN_DIR).is_dir());
    }
}
