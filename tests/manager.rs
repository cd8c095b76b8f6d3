//! End-to-end behaviour of the sandbox manager with the isolated backend.
//!
//! The backend is configured without a real virtual environment so the
//! tests only need `sh` and coreutils.

#![cfg(unix)]

use sandboxer::config::Config;
use sandboxer::runner::{is_alive, RunRequest};
use sandboxer::sandbox::{
    BackendType, ResourceLimits, ResourceUsage, Sandbox, SandboxFilter, SandboxSpec, SandboxState,
};
use sandboxer::state::{StateStore, STATE_FILE};
use sandboxer::SandboxManager;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn test_config(base: &Path) -> Config {
    let mut config = Config::default().with_base_dir(base.join("sandboxes"));
    config.monitor.enabled = false;
    config.isolated.create_venv = false;
    config
}

async fn manager(tmp: &TempDir) -> SandboxManager {
    SandboxManager::new(test_config(tmp.path())).await.unwrap()
}

fn isolated() -> SandboxSpec {
    SandboxSpec::new(BackendType::IsolatedProcess)
}

async fn wait_for_state(manager: &SandboxManager, name: &str, state: SandboxState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while manager.get_sandbox(name).await.unwrap().state != state {
        assert!(Instant::now() < deadline, "sandbox never reached {state:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Creation
// ============================================================================

#[tokio::test]
async fn test_create_returns_ready_sandbox() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;

    let sandbox = manager.create_sandbox("s1", isolated()).await.unwrap();

    assert_eq!(sandbox.state, SandboxState::Ready);
    assert_eq!(sandbox.directory, tmp.path().join("sandboxes").join("s1"));
    assert!(sandbox.directory.join("env").join("bin").is_dir());
}

#[tokio::test]
async fn test_duplicate_create_fails_and_keeps_original() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;

    manager.create_sandbox("s1", isolated()).await.unwrap();
    let err = manager.create_sandbox("s1", isolated()).await.unwrap_err();

    assert!(err.is_already_exists());
    assert_eq!(manager.registry().len().await, 1);
    assert_eq!(
        manager.get_sandbox("s1").await.unwrap().state,
        SandboxState::Ready
    );
}

#[tokio::test]
async fn test_invalid_name_creates_nothing() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;

    let err = manager
        .create_sandbox("bad name!", isolated())
        .await
        .unwrap_err();

    assert!(err.is_invalid_name());
    assert!(manager.registry().is_empty().await);
    assert!(!tmp.path().join("sandboxes").join("bad name!").exists());
}

#[tokio::test]
async fn test_create_clears_leftover_directory() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let directory = config.sandbox_dir("s1");
    std::fs::create_dir_all(&directory).unwrap();
    std::fs::write(directory.join("leftover.txt"), "secret").unwrap();

    let manager = SandboxManager::new(config).await.unwrap();
    manager.create_sandbox("s1", isolated()).await.unwrap();

    assert!(directory.is_dir());
    assert!(!directory.join("leftover.txt").exists());
}

#[tokio::test]
async fn test_create_refuses_directory_with_record() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let directory = config.sandbox_dir("s1");
    std::fs::create_dir_all(&directory).unwrap();
    std::fs::write(directory.join(STATE_FILE), "name = ").unwrap();

    let manager = SandboxManager::new(config).await.unwrap();
    let err = manager.create_sandbox("s1", isolated()).await.unwrap_err();

    assert!(err.is_already_exists());
    assert!(directory.join(STATE_FILE).is_file());
    assert!(!manager.registry().contains("s1").await);
}

// ============================================================================
// Running commands
// ============================================================================

#[tokio::test]
async fn test_run_writes_file_and_returns_to_ready() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    let before = manager.create_sandbox("s1", isolated()).await.unwrap();

    let result = manager
        .run_in_sandbox(
            "s1",
            RunRequest::new("cat input.txt > out.txt").with_file("input.txt", "hello"),
        )
        .await
        .unwrap();

    assert!(result.success, "stderr: {}", result.stderr);
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.timed_out);
    assert_eq!(result.files_generated, vec!["out.txt".to_string()]);

    let after = manager.get_sandbox("s1").await.unwrap();
    assert_eq!(after.state, SandboxState::Ready);
    assert!(after.last_used_at > before.last_used_at);
    assert_eq!(
        std::fs::read_to_string(after.directory.join("out.txt")).unwrap(),
        "hello"
    );
    assert!(!after.directory.join("input.txt").exists());
}

#[tokio::test]
async fn test_failing_command_is_a_result() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    manager.create_sandbox("s1", isolated()).await.unwrap();

    let result = manager
        .run_in_sandbox("s1", RunRequest::new("echo oops >&2; exit 3"))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.exit_code, Some(3));
    assert!(result.stderr.contains("oops"));
    assert!(result.error.unwrap().contains('3'));
}

#[tokio::test]
async fn test_environment_layers_call_over_sandbox() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    let spec = isolated().with_env("A", "sandbox").with_env("B", "sandbox");
    manager.create_sandbox("s1", spec).await.unwrap();

    let result = manager
        .run_in_sandbox(
            "s1",
            RunRequest::new("echo \"$A $B\"").with_env("B", "call"),
        )
        .await
        .unwrap();

    assert_eq!(result.stdout.trim(), "sandbox call");
}

#[tokio::test]
async fn test_working_dir_escape_rejected() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    manager.create_sandbox("s1", isolated()).await.unwrap();

    let err = manager
        .run_in_sandbox("s1", RunRequest::new("pwd").in_dir("../elsewhere"))
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(
        manager.get_sandbox("s1").await.unwrap().state,
        SandboxState::Ready
    );
}

#[tokio::test]
async fn test_run_unknown_sandbox() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;

    let err = manager
        .run_in_sandbox("ghost", RunRequest::new("true"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_timeout_kills_process_tree() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    let sandbox = manager.create_sandbox("s1", isolated()).await.unwrap();

    let started = Instant::now();
    let result = manager
        .run_in_sandbox(
            "s1",
            RunRequest::new("echo $$ > pid.txt; sleep 30").with_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.timed_out);
    assert!(result.error.as_deref().unwrap().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(10));

    let pid: u32 = std::fs::read_to_string(sandbox.directory.join("pid.txt"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(!is_alive(pid));
    assert_eq!(
        manager.get_sandbox("s1").await.unwrap().state,
        SandboxState::Ready
    );
}

#[tokio::test]
async fn test_runs_in_one_sandbox_are_serialized() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    manager.create_sandbox("s1", isolated()).await.unwrap();

    let started = Instant::now();
    let (a, b) = tokio::join!(
        manager.run_in_sandbox("s1", RunRequest::new("sleep 1")),
        manager.run_in_sandbox("s1", RunRequest::new("sleep 1")),
    );

    assert!(a.unwrap().success);
    assert!(b.unwrap().success);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test]
async fn test_runs_in_different_sandboxes_overlap() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    manager.create_sandbox("s1", isolated()).await.unwrap();
    manager.create_sandbox("s2", isolated()).await.unwrap();

    let started = Instant::now();
    let (a, b) = tokio::join!(
        manager.run_in_sandbox("s1", RunRequest::new("sleep 1")),
        manager.run_in_sandbox("s2", RunRequest::new("sleep 1")),
    );

    assert!(a.unwrap().success);
    assert!(b.unwrap().success);
    assert!(started.elapsed() < Duration::from_millis(1900));
}

#[tokio::test]
async fn test_exceeded_limit_rejects_run() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    let spec = isolated().with_limits(ResourceLimits::default().with_memory_mb(10.0));
    manager.create_sandbox("s1", spec).await.unwrap();

    manager
        .registry()
        .update_usage(
            "s1",
            ResourceUsage {
                memory_mb: 50.0,
                ..ResourceUsage::default()
            },
        )
        .await
        .unwrap();

    let err = manager
        .run_in_sandbox("s1", RunRequest::new("true"))
        .await
        .unwrap_err();
    assert!(err.is_resource_exceeded());
    assert_eq!(
        manager.get_sandbox("s1").await.unwrap().state,
        SandboxState::Ready
    );
}

#[tokio::test]
async fn test_usage_at_limit_is_not_exceeded() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    let spec = isolated().with_limits(ResourceLimits::default().with_max_processes(50));
    manager.create_sandbox("s1", spec).await.unwrap();

    manager
        .registry()
        .update_usage(
            "s1",
            ResourceUsage {
                process_count: 50,
                ..ResourceUsage::default()
            },
        )
        .await
        .unwrap();

    let result = manager
        .run_in_sandbox("s1", RunRequest::new("true"))
        .await
        .unwrap();
    assert!(result.success);
}

// ============================================================================
// Stop and cleanup
// ============================================================================

#[tokio::test]
async fn test_stopped_sandbox_rejects_runs() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    manager.create_sandbox("s1", isolated()).await.unwrap();

    let stopped = manager.stop_sandbox("s1").await.unwrap();
    assert_eq!(stopped.state, SandboxState::Stopped);

    let err = manager
        .run_in_sandbox("s1", RunRequest::new("true"))
        .await
        .unwrap_err();
    assert!(err.is_not_ready());
}

#[tokio::test]
async fn test_cleanup_removes_ephemeral_sandbox() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    let sandbox = manager.create_sandbox("s1", isolated()).await.unwrap();

    assert!(manager.cleanup_sandbox("s1", false).await.unwrap());

    assert!(!sandbox.directory.exists());
    assert!(manager.get_sandbox("s1").await.unwrap_err().is_not_found());
    assert!(manager
        .cleanup_sandbox("s1", false)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_cleanup_keeps_persistent_directory() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    let sandbox = manager
        .create_sandbox("keep", isolated().persistent(true))
        .await
        .unwrap();

    assert!(manager.cleanup_sandbox("keep", false).await.unwrap());

    assert!(manager.get_sandbox("keep").await.unwrap_err().is_not_found());
    assert!(sandbox.directory.is_dir());
    assert!(sandbox.directory.join(STATE_FILE).is_file());
}

#[tokio::test]
async fn test_cleaned_persistent_sandbox_stays_gone_after_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let manager = manager(&tmp).await;
        manager
            .create_sandbox("keep", isolated().persistent(true))
            .await
            .unwrap();
        assert!(manager.cleanup_sandbox("keep", false).await.unwrap());
        manager.shutdown().await;
    }

    let manager = manager(&tmp).await;
    assert!(manager.get_sandbox("keep").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_forced_cleanup_removes_persistent_directory() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    let sandbox = manager
        .create_sandbox("keep", isolated().persistent(true))
        .await
        .unwrap();

    assert!(manager.cleanup_sandbox("keep", true).await.unwrap());
    assert!(!sandbox.directory.exists());
}

#[tokio::test]
async fn test_cleanup_of_running_sandbox() {
    let tmp = TempDir::new().unwrap();
    let manager = Arc::new(manager(&tmp).await);
    let sandbox = manager.create_sandbox("s1", isolated()).await.unwrap();

    let runner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager
                .run_in_sandbox("s1", RunRequest::new("sleep 10"))
                .await
        })
    };
    wait_for_state(&manager, "s1", SandboxState::Running).await;

    let err = manager.cleanup_sandbox("s1", false).await.unwrap_err();
    assert!(err.is_busy());

    let started = Instant::now();
    assert!(manager.cleanup_sandbox("s1", true).await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(8));

    let result = runner.await.unwrap().unwrap();
    assert!(!result.success);
    assert!(!sandbox.directory.exists());
    assert!(!manager.registry().contains("s1").await);
}

#[tokio::test]
async fn test_cleanup_is_busy_while_sandbox_is_held() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    manager.create_sandbox("s1", isolated()).await.unwrap();

    // Held but not yet running, as for a run that has just taken the lock.
    let guard = manager.registry().acquire("s1").await.unwrap();
    let err = manager.cleanup_sandbox("s1", false).await.unwrap_err();
    assert!(err.is_busy());
    drop(guard);

    assert_eq!(
        manager.get_sandbox("s1").await.unwrap().state,
        SandboxState::Ready
    );
    assert!(manager.cleanup_sandbox("s1", false).await.unwrap());
}

#[tokio::test]
async fn test_forced_cleanup_turns_away_queued_run() {
    let tmp = TempDir::new().unwrap();
    let manager = Arc::new(manager(&tmp).await);
    let sandbox = manager.create_sandbox("s1", isolated()).await.unwrap();

    let spawn_run = |command: &'static str| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run_in_sandbox("s1", RunRequest::new(command)).await })
    };
    let running = spawn_run("sleep 10");
    wait_for_state(&manager, "s1", SandboxState::Running).await;
    let queued = spawn_run("sleep 6");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    assert!(manager.cleanup_sandbox("s1", true).await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(!running.await.unwrap().unwrap().success);
    assert!(queued.await.unwrap().unwrap_err().is_not_found());
    assert!(!sandbox.directory.exists());
    assert!(!manager.registry().contains("s1").await);
}

// ============================================================================
// Listing
// ============================================================================

#[tokio::test]
async fn test_list_filters_by_persistence() {
    let tmp = TempDir::new().unwrap();
    let manager = manager(&tmp).await;
    manager.create_sandbox("b", isolated()).await.unwrap();
    manager
        .create_sandbox("a", isolated().persistent(true))
        .await
        .unwrap();

    let all = manager.list_sandboxes(&SandboxFilter::default()).await;
    let names: Vec<_> = all.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);

    let persistent = manager
        .list_sandboxes(&SandboxFilter {
            persistent: Some(true),
            ..SandboxFilter::default()
        })
        .await;
    assert_eq!(persistent.len(), 1);
    assert_eq!(persistent[0].name, "a");
}

// ============================================================================
// Persistence across restarts
// ============================================================================

#[tokio::test]
async fn test_persistent_sandbox_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let limits = ResourceLimits::default().with_memory_mb(256.0);
    {
        let manager = manager(&tmp).await;
        manager
            .create_sandbox(
                "keep",
                isolated()
                    .persistent(true)
                    .with_env("MODE", "test")
                    .with_limits(limits.clone()),
            )
            .await
            .unwrap();
        manager.create_sandbox("gone", isolated()).await.unwrap();
        manager.shutdown().await;
    }

    let manager = manager(&tmp).await;
    let restored = manager.get_sandbox("keep").await.unwrap();
    assert_eq!(restored.state, SandboxState::Ready);
    assert_eq!(restored.environment["MODE"], "test");
    assert_eq!(restored.resource_limits, Some(limits));
    assert!(restored.persistent);
    assert!(manager.get_sandbox("gone").await.unwrap_err().is_not_found());

    let result = manager
        .run_in_sandbox("keep", RunRequest::new("echo $MODE"))
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), "test");
}

#[tokio::test]
async fn test_shutdown_tears_down_ephemeral_sandboxes() {
    let tmp = TempDir::new().unwrap();
    let directory = {
        let manager = manager(&tmp).await;
        let sandbox = manager.create_sandbox("eph", isolated()).await.unwrap();
        manager
            .run_in_sandbox("eph", RunRequest::new("echo secret > leftover.txt"))
            .await
            .unwrap();
        assert!(sandbox.directory.join("leftover.txt").is_file());
        manager.shutdown().await;
        sandbox.directory
    };
    assert!(!directory.exists());

    let manager = manager(&tmp).await;
    manager.create_sandbox("eph", isolated()).await.unwrap();
    let result = manager
        .run_in_sandbox("eph", RunRequest::new("cat leftover.txt"))
        .await
        .unwrap();
    assert!(!result.success);
}

#[tokio::test]
async fn test_running_record_restores_as_stopped() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let directory = config.sandbox_dir("crashed");
    std::fs::create_dir_all(&directory).unwrap();

    let mut sandbox = Sandbox::new("crashed", directory, &isolated().persistent(true));
    sandbox.state = SandboxState::Running;
    StateStore::save(&sandbox).unwrap();

    let manager = SandboxManager::new(config).await.unwrap();
    let restored = manager.get_sandbox("crashed").await.unwrap();
    assert_eq!(restored.state, SandboxState::Stopped);

    let err = manager
        .run_in_sandbox("crashed", RunRequest::new("true"))
        .await
        .unwrap_err();
    assert!(err.is_not_ready());
}
