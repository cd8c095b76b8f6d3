//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Command failures (non-zero
//! exit, timeout) are not errors: they are reported in
//! [`CommandResult`](crate::runner::CommandResult).

use std::time::Duration;

use crate::sandbox::{BackendType, SandboxState};

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Sandbox name is empty or contains characters other than ASCII
    /// alphanumerics and underscore.
    #[error("Invalid sandbox name '{name}': only letters, digits and '_' are allowed")]
    InvalidName { name: String },

    /// A live sandbox already uses this name.
    #[error("Sandbox already exists: {name}")]
    AlreadyExists { name: String },

    /// No sandbox is registered under this name.
    #[error("Sandbox not found: {name}")]
    NotFound { name: String },

    /// The sandbox is in the wrong state for the requested operation.
    #[error("Sandbox {name} is not ready (state: {state})")]
    NotReady { name: String, state: SandboxState },

    /// Cleanup was requested on a running sandbox without `force`.
    #[error("Sandbox {name} is busy running a command; pass force to destroy it")]
    Busy { name: String },

    /// The sandbox was not in the expected state when a transition was attempted.
    #[error("Invalid transition for sandbox {name}: expected {expected}, found {found}, wanted {target}")]
    InvalidTransition {
        name: String,
        expected: SandboxState,
        found: SandboxState,
        target: SandboxState,
    },

    /// Backend-specific setup failed.
    #[error("Provisioning failed for sandbox {name}: {message}")]
    ProvisionFailed { name: String, message: String },

    /// The backend is not implemented or not enabled.
    #[error("Backend {backend} is not supported: {message}")]
    Unsupported {
        backend: BackendType,
        message: String,
    },

    /// The backend needs host facilities this platform does not provide.
    #[error("Backend {backend} is not available on this platform ({platform})")]
    PlatformUnsupported {
        backend: BackendType,
        platform: String,
    },

    /// Current usage already exceeds a configured limit.
    #[error("Resource limit exceeded for sandbox {name}: {message}")]
    ResourceExceeded { name: String, message: String },

    /// A deadline elapsed. Command execution reports this in its result instead.
    #[error("Operation timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// A file or working directory would escape the sandbox directory.
    #[error("Invalid path '{path}': must be relative and stay inside the sandbox")]
    InvalidPath { path: String },

    /// A state record could not be read, parsed or written.
    #[error("State record error: {message}")]
    State { message: String },

    /// Unexpected OS or process failure.
    #[error("Infrastructure error: {message}")]
    Infrastructure { message: String },
}

impl SandboxError {
    /// Creates an `InvalidName` error.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName { name: name.into() }
    }

    /// Creates an `AlreadyExists` error.
    pub fn already_exists(name: impl Into<String>) -> Self {
        Self::AlreadyExists { name: name.into() }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates a `NotReady` error.
    pub fn not_ready(name: impl Into<String>, state: SandboxState) -> Self {
        Self::NotReady {
            name: name.into(),
            state,
        }
    }

    /// Creates a `Busy` error.
    pub fn busy(name: impl Into<String>) -> Self {
        Self::Busy { name: name.into() }
    }

    /// Creates a `ProvisionFailed` error.
    pub fn provision_failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProvisionFailed {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an `Unsupported` error.
    pub fn unsupported(backend: BackendType, message: impl Into<String>) -> Self {
        Self::Unsupported {
            backend,
            message: message.into(),
        }
    }

    /// Creates a `PlatformUnsupported` error for the current host.
    pub fn platform_unsupported(backend: BackendType) -> Self {
        Self::PlatformUnsupported {
            backend,
            platform: std::env::consts::OS.to_string(),
        }
    }

    /// Creates a `ResourceExceeded` error.
    pub fn resource_exceeded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExceeded {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates an `InvalidPath` error.
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath { path: path.into() }
    }

    /// Creates a `State` error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Creates an `Infrastructure` error.
    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: message.into(),
        }
    }

    /// Returns true if this is an `InvalidName` error.
    pub fn is_invalid_name(&self) -> bool {
        matches!(self, Self::InvalidName { .. })
    }

    /// Returns true if this is an `AlreadyExists` error.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns true if this is a `NotFound` error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a `NotReady` error.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }

    /// Returns true if this is a `Busy` error.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Returns true if this is an `InvalidTransition` error.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }

    /// Returns true if this is a `ProvisionFailed` error.
    pub fn is_provision_failed(&self) -> bool {
        matches!(self, Self::ProvisionFailed { .. })
    }

    /// Returns true if the backend is unavailable, either unimplemented or
    /// missing from this host.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Self::Unsupported { .. } | Self::PlatformUnsupported { .. }
        )
    }

    /// Returns true if this is a `ResourceExceeded` error.
    pub fn is_resource_exceeded(&self) -> bool {
        matches!(self, Self::ResourceExceeded { .. })
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true for caller mistakes that are rejected before any side
    /// effect happens.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidName { .. }
                | Self::AlreadyExists { .. }
                | Self::NotFound { .. }
                | Self::NotReady { .. }
                | Self::Busy { .. }
                | Self::InvalidPath { .. }
        )
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        Self::infrastructure(err.to_string())
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
