//! Public facade over the registry, backends, runner and monitor.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::backend::{Backend, Backends};
use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::monitor::ResourceMonitor;
use crate::registry::{SandboxEntry, SandboxRegistry};
use crate::runner::{terminate_group, CommandResult, CommandRunner, RunRequest};
use crate::sandbox::{
    validate_name, ProcessHandle, Sandbox, SandboxFilter, SandboxSpec, SandboxState,
};
use crate::state::StateStore;

/// Owns every sandbox of one process.
///
/// Construct it once at startup and share it by reference. Dropping it
/// cancels the resource monitor; [`shutdown`](Self::shutdown) also waits for
/// the monitor to finish.
pub struct SandboxManager {
    config: Config,
    registry: Arc<SandboxRegistry>,
    backends: Backends,
    runner: CommandRunner,
    token: CancellationToken,
    monitor: Mutex<Option<ResourceMonitor>>,
}

impl SandboxManager {
    /// Creates the base directory, reloads persisted sandboxes and starts the
    /// resource monitor.
    ///
    /// # Errors
    ///
    /// `Infrastructure` if the base directory cannot be created.
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.base_dir)
            .await
            .map_err(|e| {
                SandboxError::infrastructure(format!(
                    "failed to create base directory {}: {e}",
                    config.base_dir.display()
                ))
            })?;

        let registry = Arc::new(SandboxRegistry::new());
        for sandbox in StateStore::load_all(&config.base_dir) {
            let name = sandbox.name.clone();
            match registry.register(sandbox).await {
                Ok(_) => debug!(sandbox = %name, "Restored sandbox"),
                Err(e) => warn!(sandbox = %name, "Skipping persisted sandbox: {}", e),
            }
        }
        let restored = registry.len().await;
        if restored > 0 {
            info!(count = restored, "Restored persisted sandboxes");
        }

        let token = CancellationToken::new();
        let monitor = config.monitor.enabled.then(|| {
            ResourceMonitor::spawn(
                Arc::clone(&registry),
                config.monitor.interval(),
                token.child_token(),
            )
        });

        Ok(Self {
            backends: Backends::new(&config),
            runner: CommandRunner::new(config.execution.clone()),
            config,
            registry,
            token,
            monitor: Mutex::new(monitor),
        })
    }

    /// Configuration the manager was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    /// Provisions a new sandbox and returns it in the `ready` state.
    ///
    /// On failure nothing is left behind, unless the sandbox is persistent:
    /// then the directory and an `error` record are kept for inspection.
    ///
    /// A leftover directory without a state record is removed first; one
    /// with a record belongs to a persistent sandbox and is never reused.
    ///
    /// # Errors
    ///
    /// `InvalidName`, `AlreadyExists`, `ProvisionFailed`, `Unsupported`,
    /// `PlatformUnsupported` or `Infrastructure`.
    #[instrument(skip(self, spec), fields(backend = %spec.backend_type))]
    pub async fn create_sandbox(&self, name: &str, spec: SandboxSpec) -> Result<Sandbox> {
        validate_name(name)?;

        let directory = self.config.sandbox_dir(name);
        let entry = self
            .registry
            .register(Sandbox::new(name, directory.clone(), &spec))
            .await?;
        let guard = self.registry.acquire(name).await?;

        if let Err(e) = clear_stale_directory(name, &directory).await {
            entry.transition(SandboxState::Creating, SandboxState::Error)?;
            entry.transition(SandboxState::Error, SandboxState::Destroyed)?;
            drop(guard);
            self.registry.evict(name).await;
            return Err(e);
        }

        let backend = self.backends.get(spec.backend_type);
        let provisioned = async {
            tokio::fs::create_dir_all(&directory).await?;
            let sandbox = entry.snapshot();
            match tokio::time::timeout(spec.timeout, backend.create(&sandbox)).await {
                Ok(result) => result,
                Err(_) => Err(SandboxError::provision_failed(
                    name,
                    format!("provisioning timed out after {}s", spec.timeout.as_secs()),
                )),
            }
        }
        .await;

        let handle = match provisioned {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Provisioning failed: {}", e);
                entry.transition(SandboxState::Creating, SandboxState::Error)?;
                if spec.persistent {
                    warn!(directory = %directory.display(), "Keeping partial sandbox for inspection");
                    if let Err(save_err) = StateStore::save(&entry.snapshot()) {
                        warn!("Failed to persist error state: {}", save_err);
                    }
                } else {
                    remove_directory(&directory).await;
                    entry.transition(SandboxState::Error, SandboxState::Destroyed)?;
                    drop(guard);
                    self.registry.evict(name).await;
                }
                return Err(e);
            }
        };

        entry.set_process_handle(handle);
        entry.transition(SandboxState::Creating, SandboxState::Ready)?;
        if let Err(e) = StateStore::save(&entry.snapshot()) {
            warn!("Failed to persist new sandbox, rolling back: {}", e);
            let sandbox = entry.snapshot();
            if let Err(destroy_err) = backend.destroy(&sandbox).await {
                warn!("Backend teardown failed: {}", destroy_err);
            }
            remove_directory(&directory).await;
            entry.transition(SandboxState::Ready, SandboxState::Destroyed)?;
            drop(guard);
            self.registry.evict(name).await;
            return Err(e);
        }

        info!(directory = %directory.display(), persistent = spec.persistent, "Sandbox ready");
        Ok(entry.snapshot())
    }

    /// Runs one command in a sandbox.
    ///
    /// Waits for any command already running in the same sandbox; there is
    /// no deadline on that wait, only on the command itself. A command that
    /// fails or times out is an `Ok` result.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotReady`, `ResourceExceeded`, `InvalidPath` or
    /// `Infrastructure`.
    #[instrument(skip(self, request))]
    pub async fn run_in_sandbox(&self, name: &str, request: RunRequest) -> Result<CommandResult> {
        let guard = self.registry.acquire(name).await?;
        let backend = self.backends.get(guard.snapshot().backend_type);
        self.runner.execute(&guard, backend.as_ref(), request).await
    }

    /// Destroys a sandbox.
    ///
    /// Without `force`, a sandbox whose execution lock is held (a command is
    /// running or about to start) is refused with `Busy`. With `force`, the
    /// sandbox is claimed first so queued callers are turned away, then its
    /// running command is terminated. The directory is kept for a persistent
    /// sandbox unless `force` is set.
    ///
    /// Returns `false` if the sandbox was removed from the registry but the
    /// backend teardown or the directory removal failed (both are logged).
    ///
    /// # Errors
    ///
    /// `NotFound`, or `Busy` for a sandbox in use without `force`.
    #[instrument(skip(self))]
    pub async fn cleanup_sandbox(&self, name: &str, force: bool) -> Result<bool> {
        let guard = if force {
            let entry = self.registry.get(name).await?;
            entry.claim_for_destroy();
            if entry.state() == SandboxState::Running {
                let grace = self.config.execution.kill_grace();
                if let Some(handle) = running_handle(&entry, grace).await {
                    info!(pid = handle.pid, "Terminating running command");
                    terminate_group(handle.pid, grace).await;
                }
            }
            // The runner releases the lock once it has finalized back to ready.
            self.registry.acquire_for_destroy(name).await?
        } else {
            self.registry.try_acquire(name).await?
        };
        let sandbox = guard.snapshot();
        let backend = self.backends.get(sandbox.backend_type);
        let mut clean = true;

        if let Some(handle) = sandbox.process_handle {
            if let Err(e) = backend.stop(&sandbox).await {
                debug!("Backend stop failed: {}", e);
            }
            terminate_group(handle.pid, self.config.execution.kill_grace()).await;
        }

        if let Err(e) = backend.destroy(&sandbox).await {
            warn!("Backend teardown failed: {}", e);
            clean = false;
        }

        let mut state = sandbox.state;
        if state == SandboxState::Creating {
            // Claimed before provisioning could take the lock.
            guard.transition(state, SandboxState::Error)?;
            state = SandboxState::Error;
        }
        guard.transition(state, SandboxState::Destroyed)?;
        guard.set_process_handle(None);

        let keep = sandbox.persistent && !force;
        if keep {
            info!(directory = %sandbox.directory.display(), "Keeping persistent sandbox on disk");
            // A destroyed record is skipped on reload.
            if let Err(e) = StateStore::save(&guard.snapshot()) {
                warn!("Failed to persist destroyed state: {}", e);
                clean = false;
            }
        } else if !remove_directory(&sandbox.directory).await {
            clean = false;
        }

        drop(guard);
        self.registry.evict(name).await;
        info!("Sandbox destroyed");
        Ok(clean)
    }

    /// Moves a `ready` or `error` sandbox to `stopped`, stopping its backing
    /// process first.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `NotReady` from any other state.
    #[instrument(skip(self))]
    pub async fn stop_sandbox(&self, name: &str) -> Result<Sandbox> {
        let guard = self.registry.acquire(name).await?;
        let sandbox = guard.snapshot();
        if !matches!(sandbox.state, SandboxState::Ready | SandboxState::Error) {
            return Err(SandboxError::not_ready(name, sandbox.state));
        }

        let backend = self.backends.get(sandbox.backend_type);
        if let Err(e) = backend.stop(&sandbox).await {
            debug!("Backend stop failed: {}", e);
        }
        if let Some(handle) = sandbox.process_handle {
            terminate_group(handle.pid, self.config.execution.kill_grace()).await;
        }

        guard.transition(sandbox.state, SandboxState::Stopped)?;
        guard.set_process_handle(None);
        if let Err(e) = StateStore::save(&guard.snapshot()) {
            warn!("Failed to persist stopped state: {}", e);
        }
        info!("Sandbox stopped");
        Ok(guard.snapshot())
    }

    /// Snapshot of one sandbox.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown name.
    pub async fn get_sandbox(&self, name: &str) -> Result<Sandbox> {
        Ok(self.registry.get(name).await?.snapshot())
    }

    /// Snapshot of every sandbox matching `filter`, sorted by name.
    pub async fn list_sandboxes(&self, filter: &SandboxFilter) -> Vec<Sandbox> {
        self.registry
            .snapshot()
            .await
            .into_iter()
            .filter(|sandbox| filter.matches(sandbox))
            .collect()
    }

    /// Stops the monitor, destroys every non-persistent sandbox (killing any
    /// command still running in it) and persists the rest.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        for sandbox in self.registry.snapshot().await {
            if !sandbox.persistent {
                match self.cleanup_sandbox(&sandbox.name, true).await {
                    Ok(true) => {}
                    Ok(false) => warn!(sandbox = %sandbox.name, "Sandbox torn down with errors"),
                    Err(e) => warn!(sandbox = %sandbox.name, "Failed to tear down on shutdown: {}", e),
                }
                continue;
            }
            if let Err(e) = StateStore::save(&sandbox) {
                warn!(sandbox = %sandbox.name, "Failed to persist on shutdown: {}", e);
            }
        }
        info!("Sandbox manager shut down");
    }
}

impl Drop for SandboxManager {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Handle of the command a `running` sandbox is executing. The state flips
/// before the process is spawned, so this waits up to `patience` for it.
async fn running_handle(entry: &SandboxEntry, patience: Duration) -> Option<ProcessHandle> {
    let deadline = Instant::now() + patience;
    loop {
        if let Some(handle) = entry.process_handle() {
            return Some(handle);
        }
        if entry.state() != SandboxState::Running || Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Makes way for a new sandbox at `directory`.
async fn clear_stale_directory(name: &str, directory: &Path) -> Result<()> {
    match tokio::fs::symlink_metadata(directory).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(SandboxError::infrastructure(format!(
                "failed to inspect {}: {e}",
                directory.display()
            )))
        }
    }

    if tokio::fs::try_exists(StateStore::record_path(directory))
        .await
        .unwrap_or(true)
    {
        warn!(directory = %directory.display(), "Directory holds another sandbox's record");
        return Err(SandboxError::already_exists(name));
    }

    warn!(directory = %directory.display(), "Removing leftover sandbox directory");
    if remove_directory(directory).await {
        Ok(())
    } else {
        Err(SandboxError::infrastructure(format!(
            "failed to remove leftover directory {}",
            directory.display()
        )))
    }
}

/// Removes a sandbox directory. Returns false (after logging) on failure.
async fn remove_directory(directory: &Path) -> bool {
    match tokio::fs::remove_dir_all(directory).await {
        Ok(()) => {
            debug!("Removed {}", directory.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            warn!("Failed to remove {}: {}", directory.display(), e);
            false
        }
    }
}
