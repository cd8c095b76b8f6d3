//! Child process supervision.
//!
//! Every command is spawned as the leader of its own process group so the
//! whole tree can be signalled at once. A command that overruns its deadline
//! gets SIGTERM, then SIGKILL once the grace period has passed.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SandboxError};
use crate::monitor::ResourceSampler;
use crate::sandbox::ResourceUsage;

/// Limits and switches for one supervised process.
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    /// Wall-clock deadline.
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Cadence of in-run usage sampling.
    pub sample_interval: Duration,
    /// Keep stdout and stderr. When false both are discarded.
    pub capture_output: bool,
}

/// Told about the lifetime of a spawned process.
pub trait ProcessObserver: Send + Sync {
    /// The process is running with this pid (and process group id).
    fn spawned(&self, pid: u32);
    /// The process has been reaped.
    fn exited(&self, pid: u32);
}

/// Observer that ignores everything.
#[cfg(test)]
pub(crate) struct NoopObserver;

#[cfg(test)]
impl ProcessObserver for NoopObserver {
    fn spawned(&self, _pid: u32) {}
    fn exited(&self, _pid: u32) {}
}

/// What a supervised process produced.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
    /// Element-wise peak over the in-run samples, if any were taken.
    pub peak_usage: Option<ResourceUsage>,
}

/// Spawns `command` and supervises it until it exits or its deadline passes.
///
/// # Errors
///
/// `Infrastructure` if the process cannot be spawned or waited on. A
/// non-zero exit or a timeout is reported in the returned output.
pub async fn run_process(
    mut command: Command,
    options: &ExecOptions,
    observer: &dyn ProcessObserver,
) -> Result<ProcessOutput> {
    let output_mode = || {
        if options.capture_output {
            Stdio::piped()
        } else {
            Stdio::null()
        }
    };
    command
        .stdin(Stdio::null())
        .stdout(output_mode())
        .stderr(output_mode())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let started = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|e| SandboxError::infrastructure(format!("failed to spawn process: {e}")))?;
    let pid = child
        .id()
        .ok_or_else(|| SandboxError::infrastructure("spawned process has no pid"))?;
    observer.spawned(pid);
    debug!(pid, "Spawned process");

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);
    let sampling = PeakSampler::start(pid, options.sample_interval);

    let waited = tokio::time::timeout(options.timeout, child.wait()).await;
    let (status, timed_out) = match waited {
        Ok(status) => (Some(status), false),
        Err(_) => {
            warn!(pid, timeout_secs = options.timeout.as_secs_f64(), "Process timed out");
            (terminate_child(&mut child, pid, options.kill_grace).await, true)
        }
    };
    let duration = started.elapsed();

    // The group does not outlive its leader.
    signal_group(pid, GroupSignal::Kill);
    observer.exited(pid);
    let peak_usage = sampling.finish().await;

    let status = match status {
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => {
            return Err(SandboxError::infrastructure(format!(
                "failed to wait for process {pid}: {e}"
            )))
        }
        None => None,
    };

    Ok(ProcessOutput {
        stdout: collect_reader(stdout, options.kill_grace).await,
        stderr: collect_reader(stderr, options.kill_grace).await,
        exit_code: status.and_then(|s| s.code()),
        timed_out,
        duration,
        peak_usage,
    })
}

/// SIGTERM the group, wait out the grace period, then SIGKILL.
async fn terminate_child(
    child: &mut Child,
    pid: u32,
    grace: Duration,
) -> Option<std::io::Result<std::process::ExitStatus>> {
    signal_group(pid, GroupSignal::Term);
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return Some(status);
    }

    debug!(pid, "Process ignored SIGTERM, killing");
    signal_group(pid, GroupSignal::Kill);
    if let Err(e) = child.start_kill() {
        debug!(pid, "start_kill: {}", e);
    }
    Some(child.wait().await)
}

/// Stops a process group this task does not own a `Child` for, such as the
/// command of a sandbox being force-destroyed.
///
/// Returns once the leader is gone or the grace period has passed twice.
pub async fn terminate_group(pid: u32, grace: Duration) {
    signal_group(pid, GroupSignal::Term);
    if wait_for_exit(pid, grace).await {
        return;
    }
    signal_group(pid, GroupSignal::Kill);
    if !wait_for_exit(pid, grace).await {
        warn!(pid, "Process survived SIGKILL");
    }
}

async fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        // sysinfo refreshes are blocking
        let alive = tokio::task::spawn_blocking(move || is_alive(pid))
            .await
            .unwrap_or(false);
        if !alive {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether `pid` still refers to a live process.
pub fn is_alive(pid: u32) -> bool {
    ResourceSampler::new().is_alive(pid)
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let signal = match signal {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!(pid, ?signal, "killpg failed: {}", e),
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, _signal: GroupSignal) {
    debug!(pid, "Process groups are not supported on this platform");
}

/// Sends SIGKILL to a single process. Best effort.
#[cfg(unix)]
pub fn kill_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid) {
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGKILL) {
            debug!(pid, "kill failed: {}", e);
        }
    }
}

/// Sends SIGKILL to a single process. Best effort.
#[cfg(not(unix))]
pub fn kill_pid(pid: u32) {
    debug!(pid, "Signals are not supported on this platform");
}

fn spawn_reader<R>(mut reader: R) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = reader.read_to_end(&mut buf).await {
            debug!("Output stream closed early: {}", e);
        }
        buf
    })
}

async fn collect_reader(reader: Option<JoinHandle<Vec<u8>>>, grace: Duration) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    // A grandchild that escaped the group can hold the pipe open.
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            handle.abort();
            warn!("Output stream still open after process exit, truncating");
            String::new()
        }
    }
}

/// Samples a process tree on a fixed cadence and keeps the peak.
struct PeakSampler {
    token: CancellationToken,
    peak: Arc<Mutex<Option<ResourceUsage>>>,
    task: JoinHandle<()>,
}

impl PeakSampler {
    fn start(pid: u32, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let peak = Arc::new(Mutex::new(None));
        let task = tokio::spawn(sample_loop(pid, interval, token.clone(), Arc::clone(&peak)));
        Self { token, peak, task }
    }

    async fn finish(self) -> Option<ResourceUsage> {
        self.token.cancel();
        if let Err(e) = self.task.await {
            debug!("Sampling task ended abnormally: {}", e);
        }
        *self.peak.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn sample_loop(
    pid: u32,
    interval: Duration,
    token: CancellationToken,
    peak: Arc<Mutex<Option<ResourceUsage>>>,
) {
    let mut sampler = ResourceSampler::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let sampled = tokio::task::spawn_blocking(move || {
            let usage = sampler.sample_now(pid);
            (sampler, usage)
        })
        .await;

        let usage = match sampled {
            Ok((returned, usage)) => {
                sampler = returned;
                usage
            }
            Err(e) => {
                debug!(pid, "Sampling failed: {}", e);
                return;
            }
        };

        if let Some(usage) = usage {
            let mut peak = peak.lock().unwrap_or_else(PoisonError::into_inner);
            *peak = Some(peak.map_or(usage, |p| p.peak(usage)));
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn options(timeout: Duration) -> ExecOptions {
        ExecOptions {
            timeout,
            kill_grace: Duration::from_millis(500),
            sample_interval: Duration::from_millis(20),
            capture_output: true,
        }
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let output = run_process(
            sh("echo out; echo err >&2; exit 3"),
            &options(Duration::from_secs(5)),
            &NoopObserver,
        )
        .await
        .unwrap();

        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.exit_code, Some(3));
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_discards_output_when_not_captured() {
        let mut opts = options(Duration::from_secs(5));
        opts.capture_output = false;
        let output = run_process(sh("echo hidden"), &opts, &NoopObserver)
            .await
            .unwrap();
        assert!(output.stdout.is_empty());
        assert_eq!(output.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_timeout_kills_group() {
        struct Recorder(Mutex<Option<u32>>);
        impl ProcessObserver for Recorder {
            fn spawned(&self, pid: u32) {
                *self.0.lock().unwrap() = Some(pid);
            }
            fn exited(&self, _pid: u32) {}
        }

        let recorder = Recorder(Mutex::new(None));
        let started = Instant::now();
        let output = run_process(
            sh("sleep 30 & sleep 30"),
            &options(Duration::from_millis(300)),
            &recorder,
        )
        .await
        .unwrap();

        assert!(output.timed_out);
        assert!(output.exit_code.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));

        let pid = recorder.0.lock().unwrap().unwrap();
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_timeout_escalates_past_ignored_sigterm() {
        let output = run_process(
            sh("trap '' TERM; while true; do sleep 0.1; done"),
            &options(Duration::from_millis(200)),
            &NoopObserver,
        )
        .await
        .unwrap();
        assert!(output.timed_out);
        assert!(output.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_infrastructure() {
        let err = run_process(
            Command::new("/nonexistent/binary"),
            &options(Duration::from_secs(1)),
            &NoopObserver,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SandboxError::Infrastructure { .. }));
    }

    #[tokio::test]
    async fn test_peak_usage_sampled() {
        let output = run_process(
            sh("sleep 0.3"),
            &options(Duration::from_secs(5)),
            &NoopObserver,
        )
        .await
        .unwrap();
        let peak = output.peak_usage.unwrap();
        assert!(peak.process_count >= 1);
    }

    #[tokio::test]
    async fn test_terminate_group_from_outside() {
        let mut command = sh("sleep 30");
        command.process_group(0).kill_on_drop(true);
        let mut child = command.spawn().unwrap();
        let pid = child.id().unwrap();

        let reaper = tokio::spawn(async move { child.wait().await });
        terminate_group(pid, Duration::from_millis(500)).await;
        reaper.await.unwrap().unwrap();
        assert!(!is_alive(pid));
    }

    #[tokio::test]
    async fn test_terminate_group_leaves_runtime_responsive() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let mut command = sh("trap '' TERM; while true; do sleep 0.1; done");
        command.process_group(0).kill_on_drop(true);
        let mut child = command.spawn().unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = Arc::clone(&ticks);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        // SIGTERM is ignored, so this waits out the whole grace period.
        terminate_group(pid, Duration::from_millis(500)).await;
        ticker.abort();
        reaper.await.unwrap().unwrap();

        assert!(!is_alive(pid));
        assert!(ticks.load(Ordering::Relaxed) >= 10);
    }
}
