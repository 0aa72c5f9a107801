//! Client configuration.
//!
//! Defaults match a guest agent exposed by QEMU as a `virtserialport`
//! chardev socket at `/tmp/qga.sock`. A JSON document (named on the
//! command line or via `QGA_CLIENT_CONFIG`) may override any field.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Settings for the transport, dispatcher and execution poller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Path of the agent's Unix socket.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Per-I/O deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Secondary read deadline used once a reply looks terminated.
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_ms: u64,

    /// Wait between two `guest-exec-status` polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Number of status polls before giving up on a remote command.
    #[serde(default = "default_max_poll_retries")]
    pub max_poll_retries: u32,

    /// Size of a single socket read.
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            timeout_seconds: default_timeout(),
            settle_timeout_ms: default_settle_timeout(),
            poll_interval_ms: default_poll_interval(),
            max_poll_retries: default_max_poll_retries(),
            recv_buffer_size: default_recv_buffer_size(),
        }
    }
}

impl ClientConfig {
    /// Load from the JSON file named by `QGA_CLIENT_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os("QGA_CLIENT_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Load from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!(path = %path.display(), "Loaded client configuration");
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `QGA_SOCKET` and `QGA_TIMEOUT` on top of the loaded values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(path) = std::env::var_os("QGA_SOCKET") {
            self.socket_path = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var("QGA_TIMEOUT") {
            self.timeout_seconds = value
                .parse()
                .with_context(|| format!("QGA_TIMEOUT is not a number of seconds: {value:?}"))?;
        }
        self.validate()
    }

    /// Reject values that would make socket reads block forever or polls spin.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.timeout_seconds > 0, "timeout_seconds must be positive");
        anyhow::ensure!(self.settle_timeout_ms > 0, "settle_timeout_ms must be positive");
        anyhow::ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        anyhow::ensure!(self.recv_buffer_size > 0, "recv_buffer_size must be positive");
        Ok(())
    }

    pub const fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub const fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

/// Bounds for the execute-then-poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Wait between two consecutive polls.
    pub interval: Duration,
    /// Maximum number of status polls.
    pub max_polls: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl PollConfig {
    pub const fn from_config(config: &ClientConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_poll_retries,
        }
    }
}

fn default_socket_path() -> PathBuf {
    "/tmp/qga.sock".into()
}

const fn default_timeout() -> u64 {
    30
}

const fn default_settle_timeout() -> u64 {
    100
}

const fn default_poll_interval() -> u64 {
    100
}

const fn default_max_poll_retries() -> u32 {
    300
}

const fn default_recv_buffer_size() -> usize {
    4096
}
