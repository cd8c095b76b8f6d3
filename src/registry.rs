//! In-memory catalog of sandboxes.
//!
//! The registry owns the authoritative state machine. Two kinds of lock are
//! involved:
//!
//! - one registry-wide `RwLock` guarding the name → entry map, so that
//!   "is this name taken / insert / evict" are atomic with respect to each
//!   other;
//! - one execution lock per sandbox (a FIFO-fair `tokio::sync::Mutex`),
//!   created at registration and dropped at eviction. Holding it grants
//!   exclusive use of the sandbox directory.
//!
//! The sandbox record itself sits behind a short-lived `std::sync::Mutex`
//! that is never held across an `.await`, so the resource monitor can update
//! telemetry without waiting for a running command.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tracing::debug;

use crate::error::{Result, SandboxError};
use crate::sandbox::{validate_name, ProcessHandle, ResourceUsage, Sandbox, SandboxState};

/// A registered sandbox: its record plus its execution lock.
#[derive(Debug)]
pub struct SandboxEntry {
    name: String,
    exec_lock: Arc<tokio::sync::Mutex<()>>,
    record: Mutex<Sandbox>,
    destroying: AtomicBool,
}

impl SandboxEntry {
    fn new(sandbox: Sandbox) -> Self {
        Self {
            name: sandbox.name.clone(),
            exec_lock: Arc::new(tokio::sync::Mutex::new(())),
            record: Mutex::new(sandbox),
            destroying: AtomicBool::new(false),
        }
    }

    fn record(&self) -> MutexGuard<'_, Sandbox> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sandbox name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> Sandbox {
        self.record().clone()
    }

    /// Current state.
    pub fn state(&self) -> SandboxState {
        self.record().state
    }

    /// Runs `f` with the record locked.
    pub fn update<R>(&self, f: impl FnOnce(&mut Sandbox) -> R) -> R {
        f(&mut self.record())
    }

    /// Moves the sandbox from `from` to `to`.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if the current state is not `from` or the state
    /// machine has no such edge. The record is left untouched in that case,
    /// so concurrent callers cannot overwrite each other's transitions.
    pub fn transition(&self, from: SandboxState, to: SandboxState) -> Result<()> {
        let mut record = self.record();
        if record.state != from || !from.can_transition_to(to) {
            return Err(SandboxError::InvalidTransition {
                name: self.name.clone(),
                expected: from,
                found: record.state,
                target: to,
            });
        }
        record.state = to;
        debug!(sandbox = %self.name, %from, %to, "State transition");
        Ok(())
    }

    /// Live backing process, if any.
    pub fn process_handle(&self) -> Option<ProcessHandle> {
        self.record().process_handle
    }

    /// Replaces the live process handle.
    pub fn set_process_handle(&self, handle: Option<ProcessHandle>) {
        self.record().process_handle = handle;
    }

    /// Overwrites the resource ledger with a complete snapshot and marks the
    /// sandbox as used.
    pub fn record_usage(&self, usage: ResourceUsage) {
        let mut record = self.record();
        record.resource_usage = usage;
        record.touch();
    }

    /// Whether a forced cleanup has claimed this sandbox. Callers still
    /// queued for the execution lock are turned away once this is set.
    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    /// Marks the sandbox as claimed for destruction.
    pub(crate) fn claim_for_destroy(&self) {
        self.destroying.store(true, Ordering::Release);
    }

    #[cfg(test)]
    fn is_locked(&self) -> bool {
        self.exec_lock.try_lock().is_err()
    }
}

/// Exclusive access to one sandbox. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct SandboxGuard {
    entry: Arc<SandboxEntry>,
    _lock: OwnedMutexGuard<()>,
}

impl SandboxGuard {
    /// The guarded entry.
    pub fn entry(&self) -> &Arc<SandboxEntry> {
        &self.entry
    }
}

impl Deref for SandboxGuard {
    type Target = SandboxEntry;

    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

/// Catalog of every non-destroyed sandbox.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    entries: RwLock<HashMap<String, Arc<SandboxEntry>>>,
}

impl SandboxRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sandbox under its name and creates its execution lock.
    ///
    /// # Errors
    ///
    /// `InvalidName` if the name fails validation, `AlreadyExists` if a live
    /// sandbox already uses it.
    pub async fn register(&self, sandbox: Sandbox) -> Result<Arc<SandboxEntry>> {
        validate_name(&sandbox.name)?;

        let mut entries = self.entries.write().await;
        if entries.contains_key(&sandbox.name) {
            return Err(SandboxError::already_exists(&sandbox.name));
        }

        let entry = Arc::new(SandboxEntry::new(sandbox));
        entries.insert(entry.name.clone(), Arc::clone(&entry));
        debug!(sandbox = %entry.name, "Registered sandbox");
        Ok(entry)
    }

    /// Looks up an entry without locking it.
    ///
    /// # Errors
    ///
    /// `NotFound` if no sandbox has this name.
    pub async fn get(&self, name: &str) -> Result<Arc<SandboxEntry>> {
        self.entries
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SandboxError::not_found(name))
    }

    /// Waits for exclusive use of a sandbox.
    ///
    /// Suspends the caller until the sandbox's execution lock is free;
    /// waiters are served in arrival order.
    ///
    /// # Errors
    ///
    /// `NotFound` if the name is unknown, or if the sandbox was destroyed
    /// (or claimed for destruction) while the caller was waiting.
    pub async fn acquire(&self, name: &str) -> Result<SandboxGuard> {
        let entry = self.get(name).await?;
        let lock = Arc::clone(&entry.exec_lock).lock_owned().await;

        if entry.state().is_terminal() || entry.is_destroying() {
            return Err(SandboxError::not_found(name));
        }

        Ok(SandboxGuard { entry, _lock: lock })
    }

    /// Takes the execution lock only if nobody holds it.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown or claimed name, `Busy` if the lock is held.
    pub async fn try_acquire(&self, name: &str) -> Result<SandboxGuard> {
        let entry = self.get(name).await?;
        let lock = Arc::clone(&entry.exec_lock)
            .try_lock_owned()
            .map_err(|_| SandboxError::busy(name))?;

        if entry.state().is_terminal() || entry.is_destroying() {
            return Err(SandboxError::not_found(name));
        }

        Ok(SandboxGuard { entry, _lock: lock })
    }

    /// Claims a sandbox for destruction, then waits for its execution lock.
    ///
    /// Once claimed, every caller still queued behind the lock gets
    /// `NotFound` instead of running, so the wait is bounded by whatever
    /// holds the lock right now.
    ///
    /// # Errors
    ///
    /// `NotFound` if the name is unknown or the sandbox is already destroyed.
    pub(crate) async fn acquire_for_destroy(&self, name: &str) -> Result<SandboxGuard> {
        let entry = self.get(name).await?;
        entry.claim_for_destroy();
        let lock = Arc::clone(&entry.exec_lock).lock_owned().await;

        if entry.state().is_terminal() {
            return Err(SandboxError::not_found(name));
        }

        Ok(SandboxGuard { entry, _lock: lock })
    }

    /// Moves a sandbox from `from` to `to`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown name, `InvalidTransition` if the current
    /// state does not match `from`.
    pub async fn transition(
        &self,
        name: &str,
        from: SandboxState,
        to: SandboxState,
    ) -> Result<()> {
        self.get(name).await?.transition(from, to)
    }

    /// Overwrites a sandbox's resource ledger.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown name.
    pub async fn update_usage(&self, name: &str, usage: ResourceUsage) -> Result<()> {
        self.get(name).await?.record_usage(usage);
        Ok(())
    }

    /// Removes a sandbox and discards its execution lock.
    pub async fn evict(&self, name: &str) -> Option<Arc<SandboxEntry>> {
        let removed = self.entries.write().await.remove(name);
        if removed.is_some() {
            debug!(sandbox = %name, "Evicted sandbox");
        }
        removed
    }

    /// All entries, for the monitor.
    pub async fn entries(&self) -> Vec<Arc<SandboxEntry>> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Read-only copy of every record, sorted by name.
    pub async fn snapshot(&self) -> Vec<Sandbox> {
        let mut sandboxes: Vec<Sandbox> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.snapshot())
            .collect();
        sandboxes.sort_by(|a, b| a.name.cmp(&b.name));
        sandboxes
    }

    /// Whether a name is registered.
    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    /// Number of registered sandboxes.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// True when nothing is registered.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
