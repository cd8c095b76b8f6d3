//! Process-tree resource sampling.

use std::collections::{HashMap, HashSet};
use sysinfo::{Pid, ProcessStatus, System};

use crate::sandbox::ResourceUsage;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Reads CPU, memory and disk counters for a process and its descendants.
///
/// CPU percent is computed between two refreshes, so a sampler that is kept
/// around and refreshed repeatedly reports meaningful CPU figures; the very
/// first sample of a process reports 0.
pub struct ResourceSampler {
    system: System,
}

impl Default for ResourceSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler {
    /// Creates a sampler with an empty process table.
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Reloads the process table. Blocking.
    pub fn refresh(&mut self) {
        self.system.refresh_processes();
    }

    /// Usage of `pid` and everything below it, as of the last refresh.
    ///
    /// Returns `None` if `pid` is gone or a zombie.
    pub fn sample(&self, pid: u32) -> Option<ResourceUsage> {
        let root = Pid::from_u32(pid);
        let processes = self.system.processes();
        let process = processes.get(&root)?;
        if is_dead(process.status()) {
            return None;
        }

        // Threads show up as processes on some platforms. Skip them so their
        // memory is not counted twice.
        let threads: HashSet<Pid> = processes
            .iter()
            .filter_map(|(pid, p)| p.tasks().map(|tasks| (pid, tasks)))
            .flat_map(|(pid, tasks)| tasks.iter().filter(move |t| *t != pid).copied())
            .collect();

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, p) in processes {
            if threads.contains(pid) {
                continue;
            }
            if let Some(parent) = p.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut usage = ResourceUsage::default();
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(p) = processes.get(&current) else {
                continue;
            };
            if is_dead(p.status()) {
                continue;
            }

            let disk = p.disk_usage();
            usage.cpu_percent += f64::from(p.cpu_usage());
            usage.memory_mb += p.memory() as f64 / BYTES_PER_MB;
            usage.disk_read_mb += disk.total_read_bytes as f64 / BYTES_PER_MB;
            usage.disk_write_mb += disk.total_written_bytes as f64 / BYTES_PER_MB;
            usage.process_count += 1;

            if let Some(next) = children.get(&current) {
                stack.extend(next.iter().copied());
            }
        }

        Some(usage)
    }

    /// Refreshes and samples in one call. Blocking.
    pub fn sample_now(&mut self, pid: u32) -> Option<ResourceUsage> {
        self.refresh();
        self.sample(pid)
    }

    /// Whether `pid` is a live (non-zombie) process. Blocking.
    pub fn is_alive(&mut self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        self.system.refresh_process(pid)
            && self
                .system
                .process(pid)
                .is_some_and(|p| !is_dead(p.status()))
    }
}

fn is_dead(status: ProcessStatus) -> bool {
    matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead)
}
