//! Isolated, resource-accounted execution environments.
//!
//! A [`SandboxManager`] owns named sandboxes, each with its own directory,
//! lifecycle state and resource ledger. Sandboxes are provisioned from one of
//! three backends (an isolated interpreter environment, a container, or an
//! OS-level sandbox), run commands under a deadline one at a time, and can
//! survive restarts when marked persistent.
//!
//! ```no_run
//! use sandboxer::runner::RunRequest;
//! use sandboxer::sandbox::{BackendType, SandboxSpec};
//! use sandboxer::{Config, SandboxManager};
//!
//! # async fn demo() -> sandboxer::Result<()> {
//! let manager = SandboxManager::new(Config::default()).await?;
//! manager
//!     .create_sandbox("s1", SandboxSpec::new(BackendType::IsolatedProcess))
//!     .await?;
//! let result = manager
//!     .run_in_sandbox("s1", RunRequest::new("echo hello > out.txt"))
//!     .await?;
//! assert!(result.success);
//! manager.cleanup_sandbox("s1", false).await?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod manager;
pub mod monitor;
pub mod registry;
pub mod runner;
pub mod sandbox;
pub mod state;

pub use config::Config;
pub use error::{Result, SandboxError};
pub use manager::SandboxManager;
