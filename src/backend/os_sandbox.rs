//! OS-level sandbox backend built on macOS Seatbelt.
//!
//! Commands run under `sandbox-exec -f <directory>/sandbox.sb`. The profile
//! denies by default, allows reads, and confines writes to the sandbox
//! directory. Network access follows the sandbox's network policy.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{find_executable, Backend, Invocation, PROFILE_FILE};
use crate::config::OsSandboxConfig;
use crate::error::{Result, SandboxError};
use crate::runner::{run_process, ProcessObserver, ProcessOutput};
use crate::sandbox::{BackendType, NetworkConfig, ProcessHandle, Sandbox};

/// Runs commands under a generated Seatbelt profile.
pub struct OsSandboxBackend {
    config: OsSandboxConfig,
}

impl OsSandboxBackend {
    pub fn new(config: OsSandboxConfig) -> Self {
        Self { config }
    }

    /// The launcher, if this host can run OS sandboxes.
    fn launcher(&self) -> Result<PathBuf> {
        if !cfg!(target_os = "macos") {
            return Err(SandboxError::platform_unsupported(BackendType::OsSandbox));
        }
        find_executable(&self.config.executable)
            .ok_or_else(|| SandboxError::platform_unsupported(BackendType::OsSandbox))
    }
}

#[async_trait]
impl Backend for OsSandboxBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::OsSandbox
    }

    async fn create(&self, sandbox: &Sandbox) -> Result<Option<ProcessHandle>> {
        self.launcher()?;

        let profile = generate_profile(&sandbox.directory, &sandbox.network_config);
        let path = sandbox.directory.join(PROFILE_FILE);
        fs::write(&path, profile).map_err(|e| {
            SandboxError::provision_failed(
                &sandbox.name,
                format!("failed to write profile {}: {e}", path.display()),
            )
        })?;

        info!(sandbox = %sandbox.name, profile = %path.display(), "Wrote Seatbelt profile");
        Ok(None)
    }

    async fn execute(
        &self,
        sandbox: &Sandbox,
        invocation: &Invocation,
        observer: &dyn ProcessObserver,
    ) -> Result<ProcessOutput> {
        let launcher = self.launcher()?;
        let profile = sandbox.directory.join(PROFILE_FILE);
        if !profile.is_file() {
            return Err(SandboxError::infrastructure(format!(
                "Seatbelt profile missing: {}",
                profile.display()
            )));
        }

        let mut command = Command::new(launcher);
        command
            .arg("-f")
            .arg(&profile)
            .args(&invocation.argv)
            .current_dir(&invocation.working_dir)
            .envs(&invocation.env);

        run_process(command, &invocation.options, observer).await
    }

    async fn destroy(&self, sandbox: &Sandbox) -> Result<()> {
        let path = sandbox.directory.join(PROFILE_FILE);
        match fs::remove_file(&path) {
            Ok(()) => debug!(sandbox = %sandbox.name, "Removed Seatbelt profile"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
        Ok(())
    }
}

/// Builds a Seatbelt profile confining writes to `directory`.
pub fn generate_profile(directory: &Path, network: &NetworkConfig) -> String {
    // Seatbelt matches resolved paths (/var is /private/var on macOS).
    let root = fs::canonicalize(directory).unwrap_or_else(|_| directory.to_path_buf());
    let root = escape(&root.to_string_lossy());

    let mut profile = String::new();
    profile.push_str("(version 1)\n");
    profile.push_str("(deny default)\n");
    profile.push_str("(allow process-exec)\n");
    profile.push_str("(allow process-fork)\n");
    profile.push_str("(allow signal (target same-sandbox))\n");
    profile.push_str("(allow sysctl-read)\n");
    profile.push_str("(allow mach-lookup)\n");
    profile.push_str("(allow ipc-posix-shm)\n");
    profile.push_str("(allow file-read*)\n");
    profile.push_str(&format!("(allow file-write* (subpath \"{root}\"))\n"));
    profile.push_str("(allow file-write-data (literal \"/dev/null\") (literal \"/dev/tty\"))\n");

    if network.outbound_allowed() {
        profile.push_str("(allow network-outbound)\n");
        profile.push_str("(allow system-socket)\n");
    }
    if network.inbound_allowed() {
        profile.push_str("(allow network-inbound)\n");
        profile.push_str("(allow network-bind)\n");
    }

    profile
}

fn escape(path: &str) -> String {
    path.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxSpec;
    use tempfile::tempdir;

    #[test]
    fn test_profile_confines_writes() {
        let dir = tempdir().unwrap();
        let profile = generate_profile(dir.path(), &NetworkConfig::default());

        assert!(profile.starts_with("(version 1)\n(deny default)\n"));
        let root = fs::canonicalize(dir.path()).unwrap();
        assert!(profile.contains(&format!(
            "(allow file-write* (subpath \"{}\"))",
            root.display()
        )));
        assert!(profile.contains("(allow network-outbound)"));
        assert!(!profile.contains("(allow network-inbound)"));
    }

    #[test]
    fn test_profile_without_network() {
        let dir = tempdir().unwrap();
        let profile = generate_profile(dir.path(), &NetworkConfig::disabled());
        assert!(!profile.contains("network-outbound"));
        assert!(!profile.contains("network-inbound"));
    }

    #[test]
    fn test_escape_quotes() {
        assert_eq!(escape(r#"/tmp/a"b"#), r#"/tmp/a\"b"#);
    }

    #[cfg(not(target_os = "macos"))]
    #[tokio::test]
    async fn test_create_is_platform_unsupported_off_macos() {
        let dir = tempdir().unwrap();
        let backend = OsSandboxBackend::new(OsSandboxConfig::default());
        let sandbox = Sandbox::new(
            "seat",
            dir.path().to_path_buf(),
            &SandboxSpec::new(BackendType::OsSandbox),
        );

        let err = backend.create(&sandbox).await.unwrap_err();
        assert!(matches!(err, SandboxError::PlatformUnsupported { .. }));
        assert!(!dir.path().join(PROFILE_FILE).exists());
    }

    #[tokio::test]
    async fn test_missing_launcher_is_platform_unsupported() {
        let dir = tempdir().unwrap();
        let backend = OsSandboxBackend::new(OsSandboxConfig {
            executable: "/nonexistent/sandbox-exec".to_string(),
        });
        let sandbox = Sandbox::new(
            "seat",
            dir.path().to_path_buf(),
            &SandboxSpec::new(BackendType::OsSandbox),
        );
        assert!(backend.create(&sandbox).await.unwrap_err().is_unsupported());
    }
}
