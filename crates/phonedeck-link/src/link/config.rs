//! Link tuning and command vocabulary, loaded from JSON.

use crate::link::commands::CommandTable;
use crate::link::error::{LinkError, LinkResult};
use crate::link::exchange::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Everything the transport core can be tuned with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    /// Empty polls allowed per exchange.
    #[serde(default = "default_max_trials")]
    pub max_trials: u32,

    /// Receive window per poll (ms).
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,

    /// Serial read timeout used when opening a device (ms).
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Line monitor interval (ms).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upload chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Consecutive empty polls that end a download.
    #[serde(default = "default_download_quiet_polls")]
    pub download_quiet_polls: u32,

    #[serde(default)]
    pub commands: CommandTable,
}

fn default_max_trials() -> u32 {
    crate::link::exchange::MAX_TRIALS
}
fn default_recv_window_ms() -> u64 {
    300
}
fn default_read_timeout_ms() -> u64 {
    100
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_chunk_size() -> usize {
    1024
}
fn default_download_quiet_polls() -> u32 {
    3
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_trials: default_max_trials(),
            recv_window_ms: default_recv_window_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            chunk_size: default_chunk_size(),
            download_quiet_polls: default_download_quiet_polls(),
            commands: CommandTable::default(),
        }
    }
}

impl LinkConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> LinkResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> LinkResult<()> {
        if self.max_trials == 0 {
            return Err(LinkError::invalid("maxTrials must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(LinkError::invalid("chunkSize must be at least 1"));
        }
        if self.download_quiet_polls == 0 {
            return Err(LinkError::invalid(
                "downloadQuietPolls must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_trials: self.max_trials,
            recv_window: Duration::from_millis(self.recv_window_ms),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LinkConfig::default();
        assert_eq!(cfg.max_trials, 5);
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.retry_policy().recv_window, Duration::from_millis(300));
    }

    #[test]
    fn test_from_json_partial() {
        let cfg = LinkConfig::from_json(r#"{"maxTrials": 3, "chunkSize": 512}"#).unwrap();
        assert_eq!(cfg.max_trials, 3);
        assert_eq!(cfg.chunk_size, 512);
        assert_eq!(cfg.recv_window_ms, 300);
        assert_eq!(cfg.commands, CommandTable::default());
    }

    #[test]
    fn test_from_json_rejects_bad_values() {
        assert!(LinkConfig::from_json(r#"{"maxTrials": 0}"#).is_err());
        assert!(LinkConfig::from_json("not json").is_err());
    }
}
