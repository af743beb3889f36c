//! Application configuration
//!
//! Layered through the `config` crate: built-in defaults, then the TOML
//! file, then `OBD_*` environment variables (`OBD_CONNECTION__PORT=...`).
//! Command-line flags are applied on top by the caller.

use anyhow::{Context, Result};
use obd_poller::PollerConfig;
use obd_protocol::ConnectionSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Max level: trace, debug, info, warn or error
    pub level: String,
    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,
    /// JSON formatted log lines
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub connection: ConnectionSettings,
    pub poller: PollerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from an optional file plus the process environment
    pub fn load(path: &Path) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load with an explicit environment map in place of the process one
    pub fn load_with_env(path: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("OBD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn missing() -> PathBuf {
        std::env::temp_dir().join("obd-monitor-test-missing.toml")
    }

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load_with_env(&missing(), Some(HashMap::new())).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.connection.port, "/dev/ttyUSB0");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_then_environment() {
        let path = std::env::temp_dir().join(format!("obd-monitor-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[connection]\nport = \"COM3\"\nbaud_rate = 9600\n\n[poller]\nidle_wait_ms = 20\n",
        )
        .unwrap();

        let env = HashMap::from([
            ("OBD_CONNECTION__BAUD_RATE".to_string(), "115200".to_string()),
            ("OBD_LOGGING__LEVEL".to_string(), "debug".to_string()),
        ]);
        let config = AppConfig::load_with_env(&path, Some(env)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.connection.port, "COM3");
        assert_eq!(config.connection.baud_rate, 115200);
        assert_eq!(config.connection.timeout_ms, 2000);
        assert_eq!(config.poller.idle_wait_ms, 20);
        assert_eq!(config.poller.link_loss_timeouts, 5);
        assert_eq!(config.logging.level, "debug");
    }
}
