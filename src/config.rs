//! Engine tuning knobs
//!
//! Retry ceilings and timeouts differ between platforms and radios, so none of
//! them are hard-coded. The defaults are the values that work on most stacks.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the orchestration engine.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatches allowed per command before a recoverable failure is surfaced.
    pub max_command_tries: u32,
    /// Automatic reconnect attempts after a failed connection.
    pub max_connection_retries: u32,
    /// How long a direct connect may stay in Connecting.
    #[serde(with = "millis")]
    pub connection_timeout: Duration,
    /// A generic link error reported after this long is treated as an
    /// establishment failure.
    #[serde(with = "millis")]
    pub establishment_failure_threshold: Duration,
    /// Wait for the transport to confirm a cancelled connect before
    /// synthesizing the disconnect.
    #[serde(with = "millis")]
    pub cancel_confirm_grace: Duration,
    /// Delay between a lost bond and the disconnect it triggers.
    #[serde(with = "millis")]
    pub bond_loss_disconnect_delay: Duration,
    /// Settle time before classifying a disconnect that followed a lost bond.
    #[serde(with = "millis")]
    pub bond_lost_settle_delay: Duration,
    #[serde(with = "millis")]
    pub service_changed_rediscovery_delay: Duration,
    /// Connection priority requests have no completion event; the command
    /// completes after this long.
    #[serde(with = "millis")]
    pub connection_priority_settle: Duration,
    /// Foreground and autoconnect scans are restarted this often.
    #[serde(with = "millis")]
    pub scan_restart_period: Duration,
    /// Pause between stopping and restarting a scan.
    #[serde(with = "millis")]
    pub scan_restart_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_command_tries: 2,
            max_connection_retries: 1,
            connection_timeout: Duration::from_millis(35_000),
            establishment_failure_threshold: Duration::from_millis(25_000),
            cancel_confirm_grace: Duration::from_millis(50),
            bond_loss_disconnect_delay: Duration::from_millis(100),
            bond_lost_settle_delay: Duration::from_millis(1_000),
            service_changed_rediscovery_delay: Duration::from_millis(100),
            connection_priority_settle: Duration::from_millis(500),
            scan_restart_period: Duration::from_millis(180_000),
            scan_restart_delay: Duration::from_millis(1_000),
        }
    }
}

impl EngineConfig {
    /// Load from JSON. Durations are given in milliseconds; absent fields keep
    /// their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
