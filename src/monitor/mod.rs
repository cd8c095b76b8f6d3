//! Background resource monitor.
//!
//! One long-lived task samples every sandbox that has a live process on a
//! fixed interval. It never takes a sandbox's execution lock: it overwrites
//! the resource ledger, which is advisory telemetry, and moves idle sandboxes
//! whose backing process has died to `stopped`.

mod sampler;

pub use sampler::ResourceSampler;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{SandboxEntry, SandboxRegistry};
use crate::sandbox::{ResourceUsage, SandboxState};
use crate::state::StateStore;

/// Handle to the running monitor task.
pub struct ResourceMonitor {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ResourceMonitor {
    /// Starts the monitor. It runs until `token` is cancelled.
    pub fn spawn(
        registry: Arc<SandboxRegistry>,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        info!(interval_secs = interval.as_secs(), "Starting resource monitor");
        let task = tokio::spawn(run(registry, interval, token.clone()));
        Self { token, task }
    }

    /// Stops the monitor and waits for the current tick to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Resource monitor task ended abnormally: {}", e);
        }
        debug!("Resource monitor stopped");
    }
}

async fn run(registry: Arc<SandboxRegistry>, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut sampler = Some(ResourceSampler::new());

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let current = sampler.take().unwrap_or_default();
        sampler = Some(tick(&registry, current).await);
    }
}

/// One pass over the registry. Returns the sampler for reuse so CPU figures
/// stay meaningful across ticks.
pub(crate) async fn tick(registry: &SandboxRegistry, sampler: ResourceSampler) -> ResourceSampler {
    let targets: Vec<(Arc<SandboxEntry>, u32)> = registry
        .entries()
        .await
        .into_iter()
        .filter(|entry| matches!(entry.state(), SandboxState::Ready | SandboxState::Running))
        .filter_map(|entry| entry.process_handle().map(|h| (entry, h.pid)))
        .collect();

    if targets.is_empty() {
        return sampler;
    }

    let pids: Vec<u32> = targets.iter().map(|(_, pid)| *pid).collect();
    let sampled = tokio::task::spawn_blocking(move || {
        let mut sampler = sampler;
        sampler.refresh();
        let samples: Vec<Option<ResourceUsage>> =
            pids.iter().map(|pid| sampler.sample(*pid)).collect();
        (sampler, samples)
    })
    .await;

    let (sampler, samples) = match sampled {
        Ok(result) => result,
        Err(e) => {
            warn!("Resource sampling failed: {}", e);
            return ResourceSampler::new();
        }
    };

    for ((entry, pid), sample) in targets.into_iter().zip(samples) {
        match sample {
            Some(usage) => entry.record_usage(usage),
            None => handle_dead_process(&entry, pid),
        }
    }

    sampler
}

/// The runner reaps its own children, so only idle sandboxes are moved here.
fn handle_dead_process(entry: &SandboxEntry, pid: u32) {
    if entry.state() != SandboxState::Ready {
        debug!(sandbox = %entry.name(), pid, "Running process exited; runner will finalize");
        return;
    }

    if let Err(e) = entry.transition(SandboxState::Ready, SandboxState::Stopped) {
        debug!(sandbox = %entry.name(), "Skipping stop: {}", e);
        return;
    }
    entry.set_process_handle(None);
    info!(sandbox = %entry.name(), pid, "Backing process is gone, sandbox stopped");

    if let Err(e) = StateStore::save(&entry.snapshot()) {
        warn!(sandbox = %entry.name(), "Failed to persist stopped state: {}", e);
    }
}
