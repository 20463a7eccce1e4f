//! Fleet configuration module.
//!
//! Loads the `fleet.toml` file describing the supervisor options and the
//! processes to manage.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::process::ProcessConfig;
use crate::supervisor::SupervisorOptions;

/// Top-level fleet configuration file model.
///
/// ```toml
/// [supervisor]
/// ipc_dir = "./ipc"
///
/// [[process]]
/// name = "rust_main"
/// executable_path = "./neuro-desktop"
/// transports = ["file_ipc", "stdio"]
///
/// [[process]]
/// name = "go_integration"
/// executable_path = "./neuro-integration"
/// transports = ["file_ipc"]
/// depends_on = ["rust_main"]
/// ```
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Supervisor-level settings.
    #[serde(default)]
    pub supervisor: SupervisorSection,

    /// Managed processes, in file order.
    #[serde(default, rename = "process")]
    pub processes: Vec<ProcessConfig>,
}

/// `[supervisor]` section of the fleet file.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SupervisorSection {
    /// Directory FileIPC drop files are created in.
    #[serde(default)]
    pub ipc_dir: Option<PathBuf>,

    /// Per-source inbound message budget (messages per second).
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl FleetConfig {
    /// Load a fleet configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Self::from_str(&text)
    }

    /// Parse a fleet configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed TOML.
    #[allow(clippy::should_implement_trait)] // parse-from-toml, not FromStr
    pub fn from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Supervisor options derived from the `[supervisor]` section.
    #[must_use]
    pub fn supervisor_options(&self) -> SupervisorOptions {
        let mut options = SupervisorOptions::default();
        if let Some(ipc_dir) = &self.supervisor.ipc_dir {
            options.ipc_dir.clone_from(ipc_dir);
        }
        options.rate_limit = self.supervisor.rate_limit;
        options
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// Path that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this model.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::ChannelKind;

    #[test]
    fn test_parse_full_fleet_file() {
        let text = r#"
            [supervisor]
            ipc_dir = "./ipc"
            rate_limit = 100

            [[process]]
            name = "rust_main"
            kind = "rust_main"
            executable_path = "./neuro-desktop"
            transports = ["file_ipc", "stdio"]
            max_restart_attempts = 3
            env = { NEURO_IPC_FILE = "./ipc_rust_main.json" }

            [[process]]
            name = "go_integration"
            kind = "go_integration"
            executable_path = "./neuro-integration"
            transports = ["file_ipc"]
            heartbeat_interval = "10s"
            depends_on = ["rust_main"]
        "#;

        let config = FleetConfig::from_str(text).unwrap();
        assert_eq!(config.processes.len(), 2);
        assert_eq!(config.processes[0].name, "rust_main");
        assert_eq!(
            config.processes[0].transports,
            vec![ChannelKind::FileIpc, ChannelKind::Stdio]
        );
        assert_eq!(
            config.processes[1].heartbeat_interval,
            Duration::from_secs(10)
        );
        assert_eq!(config.processes[1].depends_on, vec!["rust_main"]);

        let options = config.supervisor_options();
        assert_eq!(options.ipc_dir, PathBuf::from("./ipc"));
        assert_eq!(options.rate_limit, Some(100));
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let config = FleetConfig::from_str("").unwrap();
        assert!(config.processes.is_empty());
        assert!(config.supervisor.ipc_dir.is_none());
        assert_eq!(
            config.supervisor_options().ipc_dir,
            SupervisorOptions::default().ipc_dir
        );
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        assert!(matches!(
            FleetConfig::from_str("process = 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        assert!(matches!(
            FleetConfig::from_file("/nonexistent/fleet.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
