//! Process data model.
//!
//! Defines what a managed process is: its immutable configuration, its
//! lifecycle state, and the read-only snapshot exposed to callers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelKind;

/// Classification tag for a managed process. Carries no behavior; it exists
/// so operators can tell fleet members apart in reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    /// The main Rust application binary.
    RustMain,
    /// The Go integration sidecar.
    GoIntegration,
    /// The Python controller.
    PythonController,
    /// The frontend dev/asset server.
    FrontendServer,
    /// Anything else.
    #[default]
    Custom,
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RustMain => write!(f, "rust_main"),
            Self::GoIntegration => write!(f, "go_integration"),
            Self::PythonController => write!(f, "python_controller"),
            Self::FrontendServer => write!(f, "frontend_server"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Immutable configuration of a managed process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Unique, non-empty process name.
    pub name: String,

    /// Classification tag.
    #[serde(default)]
    pub kind: ProcessKind,

    /// Executable to launch.
    pub executable_path: PathBuf,

    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment additions applied over the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Transports to instantiate for this process, in order.
    #[serde(default)]
    pub transports: Vec<ChannelKind>,

    /// Whether to restart the process after a crash.
    #[serde(default = "default_auto_restart")]
    pub auto_restart: bool,

    /// Maximum number of restart attempts over the record's lifetime.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,

    /// Delay before a crash-triggered restart.
    #[serde(default = "default_restart_delay")]
    #[serde(with = "humantime_serde")]
    pub restart_delay: Duration,

    /// Whether heartbeat supervision is enabled.
    #[serde(default = "default_heartbeat_enabled")]
    pub heartbeat_enabled: bool,

    /// Interval at which the child is expected to emit heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Silence past this duration marks the process crashed.
    #[serde(default = "default_heartbeat_timeout")]
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Names of processes that must be running before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

const fn default_auto_restart() -> bool {
    true
}

const fn default_max_restart_attempts() -> u32 {
    3
}

const fn default_restart_delay() -> Duration {
    Duration::from_secs(5)
}

const fn default_heartbeat_enabled() -> bool {
    true
}

const fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(5)
}

const fn default_heartbeat_timeout() -> Duration {
    Duration::from_secs(15)
}

impl ProcessConfig {
    /// Create a new builder for `ProcessConfig`.
    #[must_use]
    pub fn builder() -> ProcessConfigBuilder {
        ProcessConfigBuilder::default()
    }
}

/// Builder for [`ProcessConfig`].
#[derive(Debug)]
pub struct ProcessConfigBuilder {
    name: Option<String>,
    kind: ProcessKind,
    executable_path: Option<PathBuf>,
    args: Vec<String>,
    env: HashMap<String, String>,
    transports: Vec<ChannelKind>,
    auto_restart: bool,
    max_restart_attempts: u32,
    restart_delay: Duration,
    heartbeat_enabled: bool,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    depends_on: Vec<String>,
}

impl Default for ProcessConfigBuilder {
    fn default() -> Self {
        Self {
            name: None,
            kind: ProcessKind::Custom,
            executable_path: None,
            args: Vec::new(),
            env: HashMap::new(),
            transports: Vec::new(),
            auto_restart: default_auto_restart(),
            max_restart_attempts: default_max_restart_attempts(),
            restart_delay: default_restart_delay(),
            heartbeat_enabled: default_heartbeat_enabled(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            depends_on: Vec::new(),
        }
    }
}

impl ProcessConfigBuilder {
    /// Set the process name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the classification tag.
    #[must_use]
    pub const fn kind(mut self, kind: ProcessKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set the executable path.
    #[must_use]
    pub fn executable_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable_path = Some(path.into());
        self
    }

    /// Set command arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a transport.
    #[must_use]
    pub fn transport(mut self, kind: ChannelKind) -> Self {
        self.transports.push(kind);
        self
    }

    /// Set the auto-restart flag.
    #[must_use]
    pub const fn auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    /// Set the maximum number of restart attempts.
    #[must_use]
    pub const fn max_restart_attempts(mut self, attempts: u32) -> Self {
        self.max_restart_attempts = attempts;
        self
    }

    /// Set the delay before a crash-triggered restart.
    #[must_use]
    pub const fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Enable or disable heartbeat supervision.
    #[must_use]
    pub const fn heartbeat_enabled(mut self, enabled: bool) -> Self {
        self.heartbeat_enabled = enabled;
        self
    }

    /// Set the expected heartbeat interval.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat timeout.
    #[must_use]
    pub const fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Add a dependency that must be running first.
    #[must_use]
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Build the `ProcessConfig`.
    ///
    /// # Panics
    ///
    /// Panics if `name` or `executable_path` is not set.
    #[must_use]
    pub fn build(self) -> ProcessConfig {
        ProcessConfig {
            name: self.name.expect("name is required"),
            kind: self.kind,
            executable_path: self.executable_path.expect("executable_path is required"),
            args: self.args,
            env: self.env,
            transports: self.transports,
            auto_restart: self.auto_restart,
            max_restart_attempts: self.max_restart_attempts,
            restart_delay: self.restart_delay,
            heartbeat_enabled: self.heartbeat_enabled,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            depends_on: self.depends_on,
        }
    }
}

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Registered but never started.
    Created,
    /// Spawn in progress.
    Starting,
    /// Alive and supervised.
    Running,
    /// Graceful termination in progress.
    Stopping,
    /// Stopped by request, or crashed with restart attempts exhausted.
    Stopped,
    /// Exited unexpectedly or missed its heartbeat window.
    Crashed,
    /// Detected dead but not reaped. Adapter-bug recovery state; the
    /// standard adapter always reaps, so this is never produced in practice.
    Zombie,
}

impl ProcessState {
    /// Whether `start_process` is legal from this state.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Created | Self::Stopped | Self::Crashed)
    }

    /// Whether the process is starting or running.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    /// Whether the process is fully running.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Crashed => write!(f, "crashed"),
            Self::Zombie => write!(f, "zombie"),
        }
    }
}

/// Read-only view of one process-table row.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    /// Process name.
    pub name: String,
    /// Classification tag.
    pub kind: ProcessKind,
    /// Current lifecycle state.
    pub state: ProcessState,
    /// OS process ID, when running.
    pub pid: Option<u32>,
    /// Wall-clock start time of the current incarnation.
    pub started_at: Option<DateTime<Utc>>,
    /// Number of restarts performed on this record.
    pub restart_count: u32,
    /// Most recent failure description.
    pub last_error: Option<String>,
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ProcessConfig::builder()
            .name("worker")
            .executable_path("/usr/bin/true")
            .build();

        assert_eq!(config.name, "worker");
        assert_eq!(config.kind, ProcessKind::Custom);
        assert!(config.auto_restart);
        assert_eq!(config.max_restart_attempts, 3);
        assert_eq!(config.restart_delay, Duration::from_secs(5));
        assert!(config.heartbeat_enabled);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
        assert!(config.depends_on.is_empty());
    }

    #[test]
    fn test_builder_full_configuration() {
        let config = ProcessConfig::builder()
            .name("go_integration")
            .kind(ProcessKind::GoIntegration)
            .executable_path("./integration")
            .args(["--port", "8000"])
            .env("WS_URL", "ws://localhost:8000")
            .transport(ChannelKind::FileIpc)
            .transport(ChannelKind::Stdio)
            .auto_restart(true)
            .max_restart_attempts(5)
            .restart_delay(Duration::from_secs(10))
            .heartbeat_interval(Duration::from_secs(10))
            .depends_on("rust_main")
            .build();

        assert_eq!(config.kind, ProcessKind::GoIntegration);
        assert_eq!(config.args, vec!["--port", "8000"]);
        assert_eq!(config.env.get("WS_URL"), Some(&"ws://localhost:8000".to_string()));
        assert_eq!(
            config.transports,
            vec![ChannelKind::FileIpc, ChannelKind::Stdio]
        );
        assert_eq!(config.depends_on, vec!["rust_main"]);
    }

    #[test]
    fn test_state_predicates() {
        assert!(ProcessState::Created.can_start());
        assert!(ProcessState::Stopped.can_start());
        assert!(ProcessState::Crashed.can_start());
        assert!(!ProcessState::Running.can_start());

        assert!(ProcessState::Running.is_active());
        assert!(ProcessState::Starting.is_active());
        assert!(!ProcessState::Stopping.is_active());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProcessState::Running.to_string(), "running");
        assert_eq!(ProcessState::Crashed.to_string(), "crashed");
    }

    #[test]
    fn test_config_toml_round_trip() {
        let toml_src = r#"
            name = "rust_main"
            kind = "rust_main"
            executable_path = "./neuro-desktop"
            transports = ["file_ipc", "stdio"]
            max_restart_attempts = 5
            restart_delay = "2s"
            heartbeat_timeout = "30s"
            depends_on = []
        "#;

        let config: ProcessConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.name, "rust_main");
        assert_eq!(config.kind, ProcessKind::RustMain);
        assert_eq!(config.restart_delay, Duration::from_secs(2));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert!(config.auto_restart);
    }
}
