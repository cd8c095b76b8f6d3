use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "sandboxer.toml";

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root under which each sandbox directory `<base_dir>/<name>` lives
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub isolated: IsolatedConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub os_sandbox: OsSandboxConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            monitor: MonitorConfig::default(),
            execution: ExecutionConfig::default(),
            isolated: IsolatedConfig::default(),
            container: ContainerConfig::default(),
            os_sandbox: OsSandboxConfig::default(),
        }
    }
}

/// Background resource monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Run the monitor at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between ticks
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout used when a caller does not pass one
    #[serde(default = "default_command_timeout")]
    pub default_timeout_secs: u64,

    /// Time between SIGTERM and SIGKILL when a command overruns
    #[serde(default = "default_kill_grace")]
    pub kill_grace_ms: u64,

    /// How often a running command's process tree is sampled
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Shell used for string commands (invoked as `<shell> -c <command>`)
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_command_timeout(),
            kill_grace_ms: default_kill_grace(),
            sample_interval_ms: default_sample_interval(),
            shell: default_shell(),
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(10))
    }
}

/// Isolated-process backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolatedConfig {
    /// Interpreter used to build the environment
    /// - Default: "python3"
    /// - Custom: "/opt/python/bin/python3.12"
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Build a virtual environment with `<interpreter> -m venv`.
    /// When false only the `env/bin` layout is created.
    #[serde(default = "default_true")]
    pub create_venv: bool,

    /// Installer inside `env/bin` used for requirements
    #[serde(default = "default_installer")]
    pub package_installer: String,
}

impl Default for IsolatedConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            create_venv: true,
            package_installer: default_installer(),
        }
    }
}

/// Container backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Off by default: every container operation fails with `Unsupported`
    #[serde(default)]
    pub enabled: bool,

    /// Image the sandbox container is started from
    #[serde(default = "default_image")]
    pub image: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            image: default_image(),
        }
    }
}

/// OS-level sandbox backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsSandboxConfig {
    /// Seatbelt launcher
    #[serde(default = "default_sandbox_exec")]
    pub executable: String,
}

impl Default for OsSandboxConfig {
    fn default() -> Self {
        Self {
            executable: default_sandbox_exec(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".sandboxer")
        .join("sandboxes")
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    30
}

fn default_kill_grace() -> u64 {
    2000
}

fn default_sample_interval() -> u64 {
    250
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_installer() -> String {
    "pip".to_string()
}

fn default_image() -> String {
    "python:3.12-slim".to_string()
}

fn default_sandbox_exec() -> String {
    "sandbox-exec".to_string()
}

impl Config {
    /// Load configuration from `path`, using defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load `sandboxer.toml` from a directory
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load(&dir.join(CONFIG_FILE))
    }

    /// Same configuration rooted at a different base directory
    #[must_use]
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    /// Directory a sandbox called `name` owns
    pub fn sandbox_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }
}
