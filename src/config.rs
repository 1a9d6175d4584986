//! Typed configuration, read from a YAML file. JSON files work too, since the
//! YAML parser accepts JSON documents.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::protocol::LOAD_OFF_TIMEOUT;

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub http: HttpConfig,
    pub upsd: UpsdConfig,
    pub monitor: MonitorConfig,
}

/// Settings for the outbound HTTP client. Without a timeout, a call may wait
/// forever on an unresponsive server.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
}

impl HttpConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UpsdConfig {
    /// `host:port` of the daemon.
    pub address: String,
    pub username: String,
    /// Takes priority over `password_file`.
    pub password: Option<String>,
    pub password_file: Option<PathBuf>,
    /// Deadline for each line written to or read from the daemon.
    pub io_timeout_secs: Option<u64>,
}

impl Default for UpsdConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3493".to_owned(),
            username: "admin".to_owned(),
            password: None,
            password_file: None,
            io_timeout_secs: None,
        }
    }
}

impl UpsdConfig {
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_secs.map(Duration::from_secs)
    }

    /// The configured password, or the contents of the password file with
    /// trailing line breaks removed.
    pub fn resolve_password(&self) -> Result<String, ConfigError> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }

        let path = self
            .password_file
            .as_ref()
            .ok_or(ConfigError::MissingPassword)?;
        let contents =
            fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;

        Ok(contents.trim_end_matches(&['\r', '\n'][..]).to_owned())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    pub poll_interval_secs: u64,
    pub load_off_delay_secs: u32,
    /// Cut the load once the UPS is on battery and reports a low battery.
    pub shutdown_on_low_battery: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            load_off_delay_secs: LOAD_OFF_TIMEOUT,
            shutdown_on_low_battery: false,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text =
            fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?;

        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }
}
