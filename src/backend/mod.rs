//! Isolation backends.
//!
//! Each [`BackendType`] has one [`Backend`] implementation with the same
//! three capabilities: provision the environment, execute a command in it,
//! and tear it down. A backend that cannot work on this host fails the
//! attempted operation with a typed error instead of doing nothing.

mod container;
mod isolated;
mod os_sandbox;

pub use container::ContainerBackend;
pub use isolated::IsolatedBackend;
pub use os_sandbox::{generate_profile, OsSandboxBackend};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::runner::{ExecOptions, ProcessObserver, ProcessOutput};
use crate::sandbox::{BackendType, ProcessHandle, Sandbox};

/// Runtime environment directory inside a sandbox.
pub const ENV_DIR: &str = "env";

/// Seatbelt profile written by the OS sandbox backend.
pub const PROFILE_FILE: &str = "sandbox.sb";

/// One command, fully resolved by the runner.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Sandbox environment overlaid with per-call overrides.
    pub env: BTreeMap<String, String>,
    /// Absolute directory inside the sandbox directory.
    pub working_dir: PathBuf,
    pub options: ExecOptions,
}

impl Invocation {
    /// Working directory relative to the sandbox root.
    pub fn relative_dir(&self, sandbox: &Sandbox) -> PathBuf {
        self.working_dir
            .strip_prefix(&sandbox.directory)
            .map(Path::to_path_buf)
            .unwrap_or_default()
    }
}

/// Capability set every backend provides.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which backend this is.
    fn backend_type(&self) -> BackendType;

    /// Provisions the environment inside `sandbox.directory`, which already
    /// exists. Returns the long-lived backing process, if the backend has
    /// one.
    ///
    /// On failure the backend removes what it created (best effort) before
    /// returning the original error.
    async fn create(&self, sandbox: &Sandbox) -> Result<Option<ProcessHandle>>;

    /// Runs one command under `invocation.options.timeout`.
    async fn execute(
        &self,
        sandbox: &Sandbox,
        invocation: &Invocation,
        observer: &dyn ProcessObserver,
    ) -> Result<ProcessOutput>;

    /// Stops the backing process without destroying the environment.
    async fn stop(&self, _sandbox: &Sandbox) -> Result<()> {
        Ok(())
    }

    /// Releases everything the backend holds outside the sandbox directory.
    async fn destroy(&self, sandbox: &Sandbox) -> Result<()>;
}

/// One backend per type, built from the configuration.
#[derive(Clone)]
pub struct Backends {
    isolated: Arc<dyn Backend>,
    container: Arc<dyn Backend>,
    os_sandbox: Arc<dyn Backend>,
}

impl Backends {
    /// Builds every backend. Nothing touches the host until a backend is used.
    pub fn new(config: &Config) -> Self {
        Self {
            isolated: Arc::new(IsolatedBackend::new(config.isolated.clone())),
            container: Arc::new(ContainerBackend::new(config.container.clone())),
            os_sandbox: Arc::new(OsSandboxBackend::new(config.os_sandbox.clone())),
        }
    }

    /// Backend for `backend_type`.
    pub fn get(&self, backend_type: BackendType) -> Arc<dyn Backend> {
        match backend_type {
            BackendType::IsolatedProcess => Arc::clone(&self.isolated),
            BackendType::Container => Arc::clone(&self.container),
            BackendType::OsSandbox => Arc::clone(&self.os_sandbox),
        }
    }
}

/// Resolves `program` the way a shell would: paths are taken as-is, bare
/// names are looked up on `PATH`.
pub(crate) fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|path| path.is_file())
    })
}
