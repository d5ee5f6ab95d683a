//! Connection configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::{Error, Result};

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_handshake_timeout_seconds() -> u64 {
    30
}

/// Connection settings parsed from a TOML file or built in code.
///
/// Covers exactly one transport endpoint; one client instance owns one
/// connection.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConnectConfig {
    /// Server host name or address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Seconds allowed for the TCP connect itself.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// Seconds allowed for the bootstrap handshake to complete.
    #[serde(default = "default_handshake_timeout_seconds")]
    pub handshake_timeout_seconds: u64,
}

impl ConnectConfig {
    /// Build a config for `host:port` with default timeouts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout_seconds: default_connect_timeout_seconds(),
            handshake_timeout_seconds: default_handshake_timeout_seconds(),
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Connect timeout as a [`Duration`].
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    /// Handshake timeout as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("port must be greater than zero".into()));
        }
        if self.handshake_timeout_seconds == 0 {
            return Err(Error::Config(
                "handshake_timeout_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
