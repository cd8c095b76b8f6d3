//! Durable sandbox metadata.
//!
//! Each persistent sandbox keeps one TOML record at
//! `<directory>/sandbox.state`. There is no global index: on startup the base
//! directory is scanned and every readable record is turned back into a
//! [`Sandbox`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::sandbox::{
    BackendType, NetworkConfig, ResourceLimits, ResourceUsage, Sandbox, SandboxState,
};

/// File name of the record inside a sandbox directory.
pub const STATE_FILE: &str = "sandbox.state";

/// On-disk form of a sandbox. The live process handle and the resource
/// ledger are deliberately absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub name: String,
    pub backend_type: BackendType,
    pub state: SandboxState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub persistent: bool,
    /// Directory the sandbox owns
    pub storage_path: PathBuf,
    #[serde(default)]
    pub requirements: Vec<String>,
    // TOML tables must follow plain values
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub network_config: NetworkConfig,
}

impl From<&Sandbox> for StateRecord {
    fn from(sandbox: &Sandbox) -> Self {
        Self {
            name: sandbox.name.clone(),
            backend_type: sandbox.backend_type,
            state: sandbox.state,
            created_at: sandbox.created_at,
            last_used_at: sandbox.last_used_at,
            resource_limits: sandbox.resource_limits.clone(),
            network_config: sandbox.network_config.clone(),
            environment: sandbox.environment.clone(),
            requirements: sandbox.requirements.clone(),
            persistent: sandbox.persistent,
            storage_path: sandbox.directory.clone(),
        }
    }
}

impl StateRecord {
    /// Rebuilds a sandbox found in `directory`.
    ///
    /// No process survives a restart, so the handle is empty and a record
    /// left in `running` comes back as `stopped`.
    pub fn into_sandbox(self, directory: PathBuf) -> Sandbox {
        let state = match self.state {
            SandboxState::Running => SandboxState::Stopped,
            other => other,
        };
        Sandbox {
            name: self.name,
            backend_type: self.backend_type,
            directory,
            state,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            resource_usage: ResourceUsage::default(),
            resource_limits: self.resource_limits,
            network_config: self.network_config,
            environment: self.environment,
            requirements: self.requirements,
            persistent: self.persistent,
            process_handle: None,
        }
    }
}

/// Reads and writes sandbox records.
pub struct StateStore;

impl StateStore {
    /// Path of the record for a sandbox directory
    pub fn record_path(directory: &Path) -> PathBuf {
        directory.join(STATE_FILE)
    }

    /// Save a sandbox's metadata. Does nothing unless the sandbox is persistent.
    ///
    /// Writes to a temporary file first, then renames over the record so a
    /// crash never leaves a half-written file behind.
    pub fn save(sandbox: &Sandbox) -> Result<()> {
        if !sandbox.persistent {
            return Ok(());
        }

        let path = Self::record_path(&sandbox.directory);
        let content = toml::to_string_pretty(&StateRecord::from(sandbox))
            .map_err(|e| SandboxError::state(format!("failed to serialize state: {e}")))?;

        let temp_path = path.with_extension("state.tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| {
            SandboxError::state(format!(
                "failed to create state file {}: {e}",
                temp_path.display()
            ))
        })?;
        file.write_all(content.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| {
                SandboxError::state(format!(
                    "failed to write state file {}: {e}",
                    temp_path.display()
                ))
            })?;

        fs::rename(&temp_path, &path).map_err(|e| {
            SandboxError::state(format!(
                "failed to rename {} to {}: {e}",
                temp_path.display(),
                path.display()
            ))
        })?;

        debug!(sandbox = %sandbox.name, state = %sandbox.state, "Saved state record");
        Ok(())
    }

    /// Load the record in `directory`, if there is one
    pub fn load(directory: &Path) -> Result<Option<StateRecord>> {
        let path = Self::record_path(directory);

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            SandboxError::state(format!("failed to read state file {}: {e}", path.display()))
        })?;

        let record: StateRecord = toml::from_str(&content).map_err(|e| {
            SandboxError::state(format!("failed to parse state file {}: {e}", path.display()))
        })?;

        Ok(Some(record))
    }

    /// Scan the immediate subdirectories of `base_dir` and rebuild every
    /// sandbox that has a readable record.
    ///
    /// Corrupt records and destroyed sandboxes are skipped; neither aborts the
    /// scan. A missing base directory yields an empty list.
    pub fn load_all(base_dir: &Path) -> Vec<Sandbox> {
        let entries = match fs::read_dir(base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!("Cannot scan {} for sandboxes: {}", base_dir.display(), e);
                return Vec::new();
            }
        };

        let mut sandboxes = Vec::new();
        for entry in entries.flatten() {
            let directory = entry.path();
            if !directory.is_dir() {
                continue;
            }

            match Self::load(&directory) {
                Ok(Some(record)) if record.state.is_terminal() => {
                    debug!("Skipping destroyed sandbox record in {}", directory.display());
                }
                Ok(Some(record)) => sandboxes.push(record.into_sandbox(directory)),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable sandbox record: {}", e),
            }
        }

        sandboxes.sort_by(|a, b| a.name.cmp(&b.name));
        sandboxes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{ProcessHandle, SandboxSpec};
    use tempfile::tempdir;

    fn persistent_sandbox(base: &Path, name: &str, state: SandboxState) -> Sandbox {
        let directory = base.join(name);
        fs::create_dir_all(&directory).unwrap();
        let spec = SandboxSpec::new(BackendType::IsolatedProcess)
            .with_env("LANG", "C")
            .with_limits(ResourceLimits::default().with_memory_mb(256.0))
            .persistent(true);
        let mut sandbox = Sandbox::new(name, directory, &spec);
        sandbox.state = state;
        sandbox
    }

    #[test]
    fn test_state_roundtrip() {
        let dir = tempdir().unwrap();
        let mut sandbox = persistent_sandbox(dir.path(), "s1", SandboxState::Ready);
        sandbox.process_handle = Some(ProcessHandle::new(4242));

        StateStore::save(&sandbox).unwrap();
        let loaded = StateStore::load(&sandbox.directory)
            .unwrap()
            .unwrap()
            .into_sandbox(sandbox.directory.clone());

        assert_eq!(loaded.name, "s1");
        assert_eq!(loaded.state, SandboxState::Ready);
        assert_eq!(loaded.environment, sandbox.environment);
        assert_eq!(loaded.resource_limits, sandbox.resource_limits);
        assert_eq!(loaded.created_at, sandbox.created_at);
        assert!(loaded.process_handle.is_none());
    }

    #[test]
    fn test_save_is_noop_for_ephemeral() {
        let dir = tempdir().unwrap();
        let mut sandbox = persistent_sandbox(dir.path(), "s1", SandboxState::Ready);
        sandbox.persistent = false;

        StateStore::save(&sandbox).unwrap();
        assert!(!StateStore::record_path(&sandbox.directory).exists());
    }

    #[test]
    fn test_running_comes_back_stopped() {
        let dir = tempdir().unwrap();
        let sandbox = persistent_sandbox(dir.path(), "busy", SandboxState::Running);
        StateStore::save(&sandbox).unwrap();

        let loaded = StateStore::load_all(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].state, SandboxState::Stopped);
    }

    #[test]
    fn test_load_all_skips_corrupt_records() {
        let dir = tempdir().unwrap();
        let good = persistent_sandbox(dir.path(), "good", SandboxState::Ready);
        StateStore::save(&good).unwrap();

        let bad_dir = dir.path().join("bad");
        fs::create_dir_all(&bad_dir).unwrap();
        fs::write(bad_dir.join(STATE_FILE), "name = \"bad\"\nstate = ").unwrap();

        fs::create_dir_all(dir.path().join("no_record")).unwrap();
        fs::write(dir.path().join("stray_file"), "x").unwrap();

        let loaded = StateStore::load_all(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "good");
    }

    #[test]
    fn test_load_all_missing_base_dir() {
        let dir = tempdir().unwrap();
        assert!(StateStore::load_all(&dir.path().join("absent")).is_empty());
    }

    #[test]
    fn test_load_nonexistent() {
        let dir = tempdir().unwrap();
        assert!(StateStore::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let sandbox = persistent_sandbox(dir.path(), "s1", SandboxState::Ready);
        StateStore::save(&sandbox).unwrap();

        let names: Vec<_> = fs::read_dir(&sandbox.directory)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![STATE_FILE.to_string()]);
    }
}
