//! Container backend on the Docker Engine API.
//!
//! Each sandbox gets one long-lived container named `sandboxer-<name>` with
//! the sandbox directory bind-mounted at `/workspace`. Commands run as
//! `docker exec` sessions inside it.

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerSpec, CreateContainerOptions, LogOutput, RemoveContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::service::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{Backend, Invocation};
use crate::config::ContainerConfig;
use crate::error::{Result, SandboxError};
use crate::runner::{kill_pid, ProcessObserver, ProcessOutput};
use crate::sandbox::{BackendType, ProcessHandle, ResourceLimits, Sandbox};

/// Mount point of the sandbox directory inside the container.
const WORKSPACE: &str = "/workspace";

/// Runs each sandbox in its own container.
pub struct ContainerBackend {
    config: ContainerConfig,
}

impl ContainerBackend {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// Container name for a sandbox.
    pub fn container_name(sandbox: &Sandbox) -> String {
        format!("sandboxer-{}", sandbox.name)
    }

    async fn connect(&self) -> Result<Docker> {
        if !self.config.enabled {
            return Err(SandboxError::unsupported(
                BackendType::Container,
                "container backend is disabled (set [container] enabled = true)",
            ));
        }

        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            SandboxError::unsupported(
                BackendType::Container,
                format!("failed to connect to Docker: {e}"),
            )
        })?;
        docker.ping().await.map_err(|e| {
            SandboxError::unsupported(
                BackendType::Container,
                format!("cannot ping Docker daemon: {e}"),
            )
        })?;
        Ok(docker)
    }

    fn build_container_spec(&self, sandbox: &Sandbox) -> Result<ContainerSpec<String>> {
        let directory = sandbox.directory.to_str().ok_or_else(|| {
            SandboxError::invalid_path(sandbox.directory.display().to_string())
        })?;

        let network = &sandbox.network_config;
        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for mapping in &network.port_mappings {
            let key = format!("{}/{}", mapping.sandbox_port, mapping.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }

        let mut host_config = HostConfig {
            binds: Some(vec![format!("{directory}:{WORKSPACE}:rw")]),
            dns: Some(network.dns_servers.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        };
        apply_limits(&mut host_config, sandbox.resource_limits.as_ref());
        if !network.outbound_allowed() && !network.inbound_allowed() {
            host_config.network_mode = Some("none".to_string());
        }

        Ok(ContainerSpec {
            image: Some(self.config.image.clone()),
            // Keeps the container alive between exec sessions.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            working_dir: Some(WORKSPACE.to_string()),
            env: Some(env_list(sandbox.environment.iter())),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    async fn provision(&self, docker: &Docker, sandbox: &Sandbox, name: &str) -> Result<u32> {
        docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| provision_error(sandbox, "failed to start container", &e))?;

        if !sandbox.requirements.is_empty() {
            info!(sandbox = %sandbox.name, packages = ?sandbox.requirements, "Installing requirements in container");
            let mut cmd = vec!["pip".to_string(), "install".to_string()];
            cmd.extend(sandbox.requirements.iter().cloned());
            let (_, stderr, exit_code) = exec_collect(docker, name, cmd, Vec::new(), WORKSPACE)
                .await
                .map_err(|e| provision_error(sandbox, "failed to install requirements", &e))?;
            if exit_code != Some(0) {
                return Err(SandboxError::provision_failed(
                    &sandbox.name,
                    format!("pip install exited with {exit_code:?}: {}", stderr.trim()),
                ));
            }
        }

        let inspect = docker
            .inspect_container(name, None)
            .await
            .map_err(|e| provision_error(sandbox, "failed to inspect container", &e))?;
        inspect
            .state
            .and_then(|state| state.pid)
            .and_then(|pid| u32::try_from(pid).ok())
            .filter(|pid| *pid > 0)
            .ok_or_else(|| SandboxError::provision_failed(&sandbox.name, "container has no pid"))
    }

    async fn remove(&self, docker: &Docker, name: &str) {
        let removed = docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
        match removed {
            Ok(()) => debug!("Removed container {}", name),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!("Failed to remove container {}: {}", name, e),
        }
    }
}

#[async_trait]
impl Backend for ContainerBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Container
    }

    async fn create(&self, sandbox: &Sandbox) -> Result<Option<ProcessHandle>> {
        let docker = self.connect().await?;
        let name = Self::container_name(sandbox);
        let spec = self.build_container_spec(sandbox)?;

        debug!("Creating container: {}", name);
        docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                spec,
            )
            .await
            .map_err(|e| provision_error(sandbox, "failed to create container", &e))?;

        match self.provision(&docker, sandbox, &name).await {
            Ok(pid) => {
                info!(sandbox = %sandbox.name, container = %name, pid, "Container started");
                Ok(Some(ProcessHandle::new(pid)))
            }
            Err(e) => {
                self.remove(&docker, &name).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        sandbox: &Sandbox,
        invocation: &Invocation,
        _observer: &dyn ProcessObserver,
    ) -> Result<ProcessOutput> {
        let docker = self.connect().await?;
        let name = Self::container_name(sandbox);
        let workdir = Path::new(WORKSPACE).join(invocation.relative_dir(sandbox));
        let workdir = workdir.to_string_lossy();

        let exec = docker
            .create_exec(
                &name,
                CreateExecOptions {
                    cmd: Some(invocation.argv.clone()),
                    env: Some(env_list(invocation.env.iter())),
                    working_dir: Some(workdir.into_owned()),
                    attach_stdout: Some(invocation.options.capture_output),
                    attach_stderr: Some(invocation.options.capture_output),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::infrastructure(format!("failed to create exec: {e}")))?;

        let started = Instant::now();
        let collected = tokio::time::timeout(
            invocation.options.timeout,
            collect_output(&docker, &exec.id),
        )
        .await;
        let duration = started.elapsed();

        let (stdout, stderr, timed_out) = match collected {
            Ok(result) => {
                let (stdout, stderr) = result?;
                (stdout, stderr, false)
            }
            Err(_) => {
                warn!(sandbox = %sandbox.name, "Container command timed out");
                if let Ok(inspect) = docker.inspect_exec(&exec.id).await {
                    if let Some(pid) = inspect.pid.and_then(|p| u32::try_from(p).ok()) {
                        kill_pid(pid);
                    }
                }
                (String::new(), String::new(), true)
            }
        };

        let exit_code = if timed_out {
            None
        } else {
            docker
                .inspect_exec(&exec.id)
                .await
                .ok()
                .and_then(|inspect| inspect.exit_code)
                .and_then(|code| i32::try_from(code).ok())
        };

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
            duration,
            peak_usage: None,
        })
    }

    async fn stop(&self, sandbox: &Sandbox) -> Result<()> {
        let docker = self.connect().await?;
        let name = Self::container_name(sandbox);
        docker
            .stop_container(&name, None)
            .await
            .map_err(|e| SandboxError::infrastructure(format!("failed to stop {name}: {e}")))
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<()> {
        let docker = self.connect().await?;
        self.remove(&docker, &Self::container_name(sandbox)).await;
        Ok(())
    }
}

fn apply_limits(host_config: &mut HostConfig, limits: Option<&ResourceLimits>) {
    let Some(limits) = limits else {
        return;
    };
    if let Some(mb) = limits.memory_mb {
        host_config.memory = Some((mb * 1024.0 * 1024.0) as i64);
    }
    if let Some(percent) = limits.cpu_percent {
        host_config.nano_cpus = Some((percent / 100.0 * 1_000_000_000.0) as i64);
    }
    if let Some(max) = limits.max_processes {
        host_config.pids_limit = Some(i64::from(max));
    }
}

fn env_list<'a>(vars: impl Iterator<Item = (&'a String, &'a String)>) -> Vec<String> {
    vars.map(|(key, value)| format!("{key}={value}")).collect()
}

fn provision_error(sandbox: &Sandbox, what: &str, e: &bollard::errors::Error) -> SandboxError {
    SandboxError::provision_failed(&sandbox.name, format!("{what}: {e}"))
}

async fn collect_output(docker: &Docker, exec_id: &str) -> Result<(String, String)> {
    let started = docker
        .start_exec(exec_id, None)
        .await
        .map_err(|e| SandboxError::infrastructure(format!("failed to start exec: {e}")))?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let StartExecResults::Attached { mut output, .. } = started {
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => warn!("Error reading exec output: {}", e),
            }
        }
    }
    Ok((stdout, stderr))
}

async fn exec_collect(
    docker: &Docker,
    container: &str,
    cmd: Vec<String>,
    env: Vec<String>,
    workdir: &str,
) -> std::result::Result<(String, String, Option<i64>), bollard::errors::Error> {
    let exec = docker
        .create_exec(
            container,
            CreateExecOptions {
                cmd: Some(cmd),
                env: Some(env),
                working_dir: Some(workdir.to_string()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await?;

    let mut stdout = String::new();
    let mut stderr = String::new();
    if let StartExecResults::Attached { mut output, .. } = docker.start_exec(&exec.id, None).await? {
        while let Some(chunk) = output.next().await {
            match chunk? {
                LogOutput::StdOut { message } => stdout.push_str(&String::from_utf8_lossy(&message)),
                LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                _ => {}
            }
        }
    }
    let exit_code = docker.inspect_exec(&exec.id).await?.exit_code;
    Ok((stdout, stderr, exit_code))
}
