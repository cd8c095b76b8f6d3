//! Resource ledger and ceilings.

use serde::{Deserialize, Serialize};

/// Fraction of a limit at which a post-run warning is attached.
pub const WARNING_THRESHOLD: f64 = 0.8;

/// Snapshot of what a sandbox's process tree is consuming.
///
/// Writers always replace the whole snapshot, so a reader sees one coherent
/// observation, possibly one monitor tick stale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage in percent of one core.
    pub cpu_percent: f64,
    /// Resident memory in MiB.
    pub memory_mb: f64,
    /// Cumulative bytes read from disk, in MiB.
    pub disk_read_mb: f64,
    /// Cumulative bytes written to disk, in MiB.
    pub disk_write_mb: f64,
    /// Bytes sent over the network, in MiB. Zero where the OS does not expose it.
    pub network_sent_mb: f64,
    /// Bytes received over the network, in MiB. Zero where the OS does not expose it.
    pub network_recv_mb: f64,
    /// Number of processes in the tree.
    #[serde(default)]
    pub process_count: u32,
}

impl ResourceUsage {
    /// Element-wise maximum of two snapshots.
    #[must_use]
    pub fn peak(self, other: Self) -> Self {
        Self {
            cpu_percent: self.cpu_percent.max(other.cpu_percent),
            memory_mb: self.memory_mb.max(other.memory_mb),
            disk_read_mb: self.disk_read_mb.max(other.disk_read_mb),
            disk_write_mb: self.disk_write_mb.max(other.disk_write_mb),
            network_sent_mb: self.network_sent_mb.max(other.network_sent_mb),
            network_recv_mb: self.network_recv_mb.max(other.network_recv_mb),
            process_count: self.process_count.max(other.process_count),
        }
    }
}

/// Optional ceilings for [`ResourceUsage`]. Unset fields are unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum number of processes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processes: Option<u32>,
    /// Maximum CPU percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    /// Maximum resident memory in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    /// Maximum disk writes in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_mb: Option<f64>,
    /// Maximum network traffic (sent plus received) in MiB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mb: Option<f64>,
}

impl ResourceLimits {
    /// Sets the process ceiling.
    #[must_use]
    pub fn with_max_processes(mut self, max: u32) -> Self {
        self.max_processes = Some(max);
        self
    }

    /// Sets the CPU ceiling.
    #[must_use]
    pub fn with_cpu_percent(mut self, percent: f64) -> Self {
        self.cpu_percent = Some(percent);
        self
    }

    /// Sets the memory ceiling.
    #[must_use]
    pub fn with_memory_mb(mut self, mb: f64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    /// Sets the disk ceiling.
    #[must_use]
    pub fn with_disk_mb(mut self, mb: f64) -> Self {
        self.disk_mb = Some(mb);
        self
    }

    /// Sets the network ceiling.
    #[must_use]
    pub fn with_network_mb(mut self, mb: f64) -> Self {
        self.network_mb = Some(mb);
        self
    }

    /// Describes every limit that `usage` is strictly above.
    #[must_use]
    pub fn exceeded(&self, usage: &ResourceUsage) -> Vec<String> {
        self.pairs(usage)
            .filter(|(_, value, limit)| value > limit)
            .map(|(label, value, limit)| format!("{label} {value:.1} exceeds limit {limit:.1}"))
            .collect()
    }

    /// Describes every limit that `usage` has reached `fraction` of.
    #[must_use]
    pub fn approaching(&self, usage: &ResourceUsage, fraction: f64) -> Vec<String> {
        self.pairs(usage)
            .filter(|(_, value, limit)| *value >= limit * fraction)
            .map(|(label, value, limit)| {
                format!(
                    "{label} at {:.0}% of limit ({value:.1} / {limit:.1})",
                    value / limit * 100.0
                )
            })
            .collect()
    }

    fn pairs(&self, usage: &ResourceUsage) -> impl Iterator<Item = (&'static str, f64, f64)> {
        [
            (
                "process count",
                f64::from(usage.process_count),
                self.max_processes.map(f64::from),
            ),
            ("cpu percent", usage.cpu_percent, self.cpu_percent),
            ("memory mb", usage.memory_mb, self.memory_mb),
            ("disk mb", usage.disk_write_mb, self.disk_mb),
            (
                "network mb",
                usage.network_sent_mb + usage.network_recv_mb,
                self.network_mb,
            ),
        ]
        .into_iter()
        .filter_map(|(label, value, limit)| limit.filter(|l| *l > 0.0).map(|l| (label, value, l)))
    }
}
