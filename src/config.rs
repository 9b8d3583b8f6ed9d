//! Connection tuning: handshake retry policy, timeouts and channel sizes.

use crate::crypto::DEFAULT_PROTOCOL_VERSION;
use crate::error::{Result, TuyaError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts and retry policy of a [`Connection`](crate::Connection).
///
/// Every field has a default, so a JSON document only needs the values it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Device-info requests sent before the handshake gives up
    pub device_info_attempts: u32,
    pub device_info_timeout_ms: u64,
    /// Pause between two device-info attempts
    pub retry_backoff_ms: u64,
    pub pair_timeout_ms: u64,
    /// Upper bound for command acknowledgements; `None` waits for the caller's token
    pub command_timeout_ms: Option<u64>,
    /// Pause after subscribing to notifications before the first write
    pub settle_delay_ms: u64,
    /// Version nibble used until the device reports its own
    pub initial_protocol_version: u8,
    /// Capacity of the unsolicited notification channel
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_info_attempts: 3,
            device_info_timeout_ms: 1000,
            retry_backoff_ms: 250,
            pair_timeout_ms: 5000,
            command_timeout_ms: None,
            settle_delay_ms: 250,
            initial_protocol_version: DEFAULT_PROTOCOL_VERSION,
            event_capacity: 32,
        }
    }
}

impl ConnectionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_info_attempts == 0 {
            return Err(TuyaError::Config("device_info_attempts must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(TuyaError::Config("event_capacity must be at least 1".into()));
        }
        if self.initial_protocol_version > 0x0F {
            return Err(TuyaError::Config(
                "initial_protocol_version must fit in a nibble".into(),
            ));
        }
        Ok(())
    }

    pub fn device_info_timeout(&self) -> Duration {
        Duration::from_millis(self.device_info_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn pair_timeout(&self) -> Duration {
        Duration::from_millis(self.pair_timeout_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}
