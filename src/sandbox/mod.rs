//! Sandbox data model.
//!
//! A [`Sandbox`] is one named, isolated execution environment with its own
//! working directory, resource ledger and lifecycle [`SandboxState`].

mod limits;
mod network;

pub use limits::{ResourceLimits, ResourceUsage, WARNING_THRESHOLD};
pub use network::{NetworkConfig, PortMapping, Protocol};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Isolation mechanism a sandbox is provisioned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// Self-contained interpreter environment inside the sandbox directory.
    IsolatedProcess,
    /// Container scoped to the sandbox directory.
    Container,
    /// Host OS disposable sandbox.
    OsSandbox,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IsolatedProcess => write!(f, "isolated_process"),
            Self::Container => write!(f, "container"),
            Self::OsSandbox => write!(f, "os_sandbox"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "isolated_process" | "isolated" | "venv" => Ok(Self::IsolatedProcess),
            "container" | "docker" => Ok(Self::Container),
            "os_sandbox" | "seatbelt" => Ok(Self::OsSandbox),
            _ => anyhow::bail!(
                "Unknown backend type: '{s}'. Supported: isolated_process, container, os_sandbox"
            ),
        }
    }
}

/// Lifecycle state of a sandbox.
///
/// ```text
/// CREATING -> READY | ERROR
/// READY    -> RUNNING | STOPPED | DESTROYED
/// RUNNING  -> READY | ERROR | DESTROYED (forced)
/// ERROR    -> STOPPED | DESTROYED
/// STOPPED  -> DESTROYED
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Backend provisioning in progress.
    #[default]
    Creating,
    /// Idle and able to run commands.
    Ready,
    /// A command is executing.
    Running,
    /// Provisioning or the backend failed.
    Error,
    /// Backing process is gone or the sandbox was stopped explicitly.
    Stopped,
    /// Torn down. Terminal.
    Destroyed,
}

impl SandboxState {
    /// Returns true if the state machine allows moving from `self` to `to`.
    ///
    /// `Running -> Destroyed` is allowed here; the facade only takes that
    /// edge for forced cleanup, after the running process has been stopped.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use SandboxState::{Creating, Destroyed, Error, Ready, Running, Stopped};
        matches!(
            (self, to),
            (Creating, Ready | Error)
                | (Ready, Running | Stopped | Destroyed)
                | (Running, Ready | Error | Destroyed)
                | (Error, Stopped | Destroyed)
                | (Stopped, Destroyed)
        )
    }

    /// Returns true once the sandbox has been destroyed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Destroyed
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Reference to a live OS process backing a sandbox.
///
/// Never persisted: no process survives a restart of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Process id. Commands are spawned as process group leaders, so this is
    /// also the process group id.
    pub pid: u32,
}

impl ProcessHandle {
    /// Creates a handle for `pid`.
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

/// One isolated execution environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    /// Unique key, immutable after creation.
    pub name: String,
    /// Backend the sandbox was provisioned from.
    pub backend_type: BackendType,
    /// Directory owned exclusively by this sandbox.
    pub directory: PathBuf,
    /// Current lifecycle state.
    pub state: SandboxState,
    /// When the sandbox was registered.
    pub created_at: DateTime<Utc>,
    /// Last successful command execution or resource sample.
    pub last_used_at: DateTime<Utc>,
    /// Last known resource usage. Only trustworthy while running.
    #[serde(default)]
    pub resource_usage: ResourceUsage,
    /// Optional ceilings for `resource_usage`.
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    /// Network policy.
    #[serde(default)]
    pub network_config: NetworkConfig,
    /// Environment overrides merged into every command.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Packages installed at provisioning time.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Survives restarts and non-forced cleanup.
    #[serde(default)]
    pub persistent: bool,
    /// Live backing process, if any.
    #[serde(skip)]
    pub process_handle: Option<ProcessHandle>,
}

impl Sandbox {
    /// Builds a sandbox in the `Creating` state from a creation spec.
    pub fn new(name: impl Into<String>, directory: PathBuf, spec: &SandboxSpec) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            backend_type: spec.backend_type,
            directory,
            state: SandboxState::Creating,
            created_at: now,
            last_used_at: now,
            resource_usage: ResourceUsage::default(),
            resource_limits: spec.resource_limits.clone(),
            network_config: spec.network_config.clone(),
            environment: spec.environment.clone(),
            requirements: spec.requirements.clone(),
            persistent: spec.persistent,
            process_handle: None,
        }
    }

    /// Marks the sandbox as used now.
    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }
}

/// Parameters for creating a sandbox.
///
/// # Example
///
/// ```
/// use sandboxer::sandbox::{BackendType, ResourceLimits, SandboxSpec};
///
/// let spec = SandboxSpec::new(BackendType::IsolatedProcess)
///     .with_requirement("requests")
///     .with_env("MODE", "test")
///     .with_limits(ResourceLimits::default().with_memory_mb(512.0))
///     .persistent(true);
/// assert!(spec.persistent);
/// ```
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Backend to provision.
    pub backend_type: BackendType,
    /// Packages to install into the environment.
    pub requirements: Vec<String>,
    /// Environment overrides.
    pub environment: BTreeMap<String, String>,
    /// Optional resource ceilings.
    pub resource_limits: Option<ResourceLimits>,
    /// Network policy.
    pub network_config: NetworkConfig,
    /// Keep directory and state across restarts.
    pub persistent: bool,
    /// Upper bound for provisioning.
    pub timeout: Duration,
}

impl SandboxSpec {
    /// Creates a spec for `backend_type` with defaults for everything else.
    #[must_use]
    pub fn new(backend_type: BackendType) -> Self {
        Self {
            backend_type,
            requirements: Vec::new(),
            environment: BTreeMap::new(),
            resource_limits: None,
            network_config: NetworkConfig::default(),
            persistent: false,
            timeout: Duration::from_secs(300),
        }
    }

    /// Adds a package to install.
    #[must_use]
    pub fn with_requirement(mut self, requirement: impl Into<String>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    /// Replaces the package list.
    #[must_use]
    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    /// Adds an environment override.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Sets resource ceilings.
    #[must_use]
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = Some(limits);
        self
    }

    /// Sets the network policy.
    #[must_use]
    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network_config = network;
        self
    }

    /// Sets the persistent flag.
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Sets the provisioning timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Selects sandboxes in [`list_sandboxes`](crate::SandboxManager::list_sandboxes).
///
/// The default filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct SandboxFilter {
    /// Only this backend.
    pub backend_type: Option<BackendType>,
    /// Only this state.
    pub state: Option<SandboxState>,
    /// Only persistent (or only ephemeral) sandboxes.
    pub persistent: Option<bool>,
}

impl SandboxFilter {
    /// Returns true if `sandbox` passes every set criterion.
    #[must_use]
    pub fn matches(&self, sandbox: &Sandbox) -> bool {
        self.backend_type.map_or(true, |b| b == sandbox.backend_type)
            && self.state.map_or(true, |s| s == sandbox.state)
            && self.persistent.map_or(true, |p| p == sandbox.persistent)
    }
}

/// Checks that `name` is non-empty ASCII alphanumerics and underscores.
///
/// # Errors
///
/// Returns `SandboxError::InvalidName` otherwise.
pub fn validate_name(name: &str) -> Result<()> {
    if !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        Ok(())
    } else {
        Err(SandboxError::invalid_name(name))
    }
}
