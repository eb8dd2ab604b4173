//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The instance's logging config, which uses Rust's `env_logger` directives.
    #[serde(default)]
    pub rust_log: String,

    /// The name of the bus namespace this instance coordinates on.
    pub namespace: String,
    /// The opaque, externally supplied identity of this instance, stable for its
    /// process lifetime.
    pub instance_id: String,

    /// The minimum delay before an instance casts its self-vote in an election round.
    #[serde(default = "Config::default_election_min_delay_ms")]
    pub election_min_delay_ms: u64,
    /// The random delay range added on top of the minimum. The full round window is
    /// `election_min_delay_ms + election_delay_range_ms`.
    #[serde(default = "Config::default_election_delay_range_ms")]
    pub election_delay_range_ms: u64,

    /// The upper bound of the randomized wait for a leader's answer during startup.
    #[serde(default = "Config::default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// The interval between heartbeat probes while following a leader.
    #[serde(default = "Config::default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long a follower waits for a heartbeat reply before declaring the leader lost.
    #[serde(default = "Config::default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// The full duration of one election round in milliseconds.
    pub fn election_round_ms(&self) -> u64 {
        self.election_min_delay_ms + self.election_delay_range_ms
    }

    fn default_election_min_delay_ms() -> u64 {
        250
    }

    fn default_election_delay_range_ms() -> u64 {
        100
    }

    fn default_startup_timeout_ms() -> u64 {
        50
    }

    fn default_heartbeat_interval_ms() -> u64 {
        3_000
    }

    fn default_heartbeat_timeout_ms() -> u64 {
        1_000
    }
}
