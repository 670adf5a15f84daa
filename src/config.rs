//! Tunnel configuration.
//!
//! Every field has a default, so an absent or partial config file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// First port of the IANA dynamic/private range (49152-65535).
pub const DEFAULT_BASE_LOCAL_PORT: u16 = 49152;

/// Number of sequential local ports tried before giving up.
pub const DEFAULT_PORT_ATTEMPTS: u16 = 10;

/// Remote command listing the forwardable ports of a gear.
pub const DEFAULT_LIST_PORTS_COMMAND: &str = "rhc-list-ports";

pub const DEFAULT_PRIVATE_KEY: &str = "~/.ssh/id_rsa";

/// Settings for opening sessions and allocating forwarded ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// First local port tried when forwarding
    pub base_local_port: u16,
    /// How many consecutive local ports are tried
    pub port_attempts: u16,
    /// Total time a remote command may run, in milliseconds
    pub command_timeout_ms: u64,
    /// Timeout for the TCP connect and SSH handshake, in milliseconds
    pub connect_timeout_ms: u64,
    /// SSH server port
    pub ssh_port: u16,
    /// Command enumerating forwardable endpoints
    pub list_ports_command: String,
    /// Command run before listing to wake an idle gear
    pub wake_command: Option<String>,
    /// Private key used when the caller does not name one
    pub default_private_key: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            base_local_port: DEFAULT_BASE_LOCAL_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            command_timeout_ms: 30_000,
            connect_timeout_ms: 30_000,
            ssh_port: 22,
            list_ports_command: DEFAULT_LIST_PORTS_COMMAND.to_string(),
            wake_command: None,
            default_private_key: DEFAULT_PRIVATE_KEY.to_string(),
        }
    }
}

impl TunnelConfig {
    /// Load `~/.openshift-proxy/config.json`, or defaults when it does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::debug!("Loaded tunnel config from {}", path.display());
        Ok(config)
    }

    /// Zero timeouts would disable the bound entirely in libssh2.
    fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 {
            anyhow::bail!("command_timeout_ms must be greater than zero");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    fn default_path() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
        Ok(home.join(".openshift-proxy").join("config.json"))
    }

    pub fn with_wake_command(mut self, command: impl Into<String>) -> Self {
        self.wake_command = Some(command.into());
        self
    }

    pub fn with_list_ports_command(mut self, command: impl Into<String>) -> Self {
        self.list_ports_command = command.into();
        self
    }

    pub fn with_default_private_key(mut self, path: impl Into<String>) -> Self {
        self.default_private_key = path.into();
        self
    }

    /// Timeouts below one millisecond are rounded up to one.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = millis_at_least_one(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = millis_at_least_one(timeout);
        self
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

fn millis_at_least_one(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}
