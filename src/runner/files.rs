//! Files handed to a command and files a command leaves behind.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::backend::{ENV_DIR, PROFILE_FILE};
use crate::error::{Result, SandboxError};
use crate::state::STATE_FILE;

/// Top-level names inside a sandbox directory that belong to the manager.
const RESERVED: &[&str] = &[ENV_DIR, STATE_FILE, "sandbox.state.tmp", PROFILE_FILE];

/// Content of a materialized file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

impl From<&str> for FileContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for FileContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// Checks that `path` stays inside the sandbox directory and returns it in
/// normalized relative form.
///
/// # Errors
///
/// `InvalidPath` for empty or absolute paths and for `..` components.
pub fn validate_relative(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::invalid_path(path.display().to_string()));
            }
        }
    }
    Ok(normalized)
}

fn validate_input(name: &str) -> Result<PathBuf> {
    let relative = validate_relative(Path::new(name))?;
    let reserved = relative
        .components()
        .next()
        .is_some_and(|first| RESERVED.iter().any(|r| first.as_os_str() == *r));
    if relative.as_os_str().is_empty() || reserved {
        return Err(SandboxError::invalid_path(name));
    }
    Ok(relative)
}

/// Input files written for one command. Removed again when dropped.
#[derive(Debug, Default)]
pub struct TransientFiles {
    created: Vec<PathBuf>,
    relative: BTreeSet<PathBuf>,
}

impl TransientFiles {
    /// Writes `files` under `root`, creating parent directories as needed.
    ///
    /// Every name is validated before anything is written.
    ///
    /// # Errors
    ///
    /// `InvalidPath` for a name that escapes `root` or targets a reserved
    /// entry; `Infrastructure` if a write fails, after removing whatever was
    /// already written.
    pub fn materialize(root: &Path, files: &BTreeMap<String, FileContent>) -> Result<Self> {
        let targets = files
            .iter()
            .map(|(name, content)| validate_input(name).map(|rel| (rel, content)))
            .collect::<Result<Vec<_>>>()?;

        let mut written = Self::default();
        for (relative, content) in targets {
            let path = root.join(&relative);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&path, content.as_bytes()).map_err(|e| {
                SandboxError::infrastructure(format!("failed to write {}: {e}", path.display()))
            })?;
            debug!(file = %relative.display(), "Materialized input file");
            written.created.push(path);
            written.relative.insert(relative);
        }
        Ok(written)
    }

    /// Relative paths of the inputs.
    pub fn relative_paths(&self) -> &BTreeSet<PathBuf> {
        &self.relative
    }

    /// Deletes the inputs. Failures are logged.
    pub fn remove(mut self) {
        self.remove_all();
    }

    fn remove_all(&mut self) {
        for path in self.created.drain(..) {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove transient file {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for TransientFiles {
    fn drop(&mut self) {
        self.remove_all();
    }
}

/// Relative paths of the regular files under `root`, skipping entries that
/// belong to the manager.
pub fn snapshot(root: &Path) -> BTreeSet<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() != 1 || !RESERVED.iter().any(|r| entry.file_name() == *r)
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect()
}

/// Files present now that were in neither `before` nor `inputs`.
pub fn generated(
    root: &Path,
    before: &BTreeSet<PathBuf>,
    inputs: &BTreeSet<PathBuf>,
) -> Vec<String> {
    snapshot(root)
        .into_iter()
        .filter(|path| !before.contains(path) && !inputs.contains(path))
        .map(|path| path.to_string_lossy().into_owned())
        .collect()
}
