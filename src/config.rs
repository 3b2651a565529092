// Tripbeacon Configuration
//
// Connection and sampling knobs, with defaults tuned for flaky mobile radios:
// bounded, capped reconnect backoff that tolerates short outages (screen lock,
// cell handoff) without producing retry storms.

use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default initial reconnect delay (milliseconds)
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;
/// Default reconnect delay cap (milliseconds)
pub const DEFAULT_RECONNECT_DELAY_MAX_MS: u64 = 5000;
/// Default number of consecutive reconnect attempts before giving up
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
/// Default connect timeout (milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 20000;
/// Default minimum interval between published samples (milliseconds)
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 3000;
/// Default minimum movement between published samples (meters)
pub const DEFAULT_SAMPLE_DISTANCE_M: f64 = 10.0;

// ============================================================================
// Connection config
// ============================================================================

/// Connection configuration for the shared duplex channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Server address (e.g. "ws://tracker.example.com:8010/ws")
    pub server_url: String,

    /// Whether a dropped link is retried automatically
    #[serde(default = "ConnectionConfig::default_reconnect")]
    pub reconnect: bool,

    /// Initial delay before a reconnect attempt
    #[serde(default = "ConnectionConfig::default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Cap on the reconnect delay as it backs off
    #[serde(default = "ConnectionConfig::default_reconnect_delay_max_ms")]
    pub reconnect_delay_max_ms: u64,

    /// Consecutive failed attempts tolerated before the connection is Failed
    #[serde(default = "ConnectionConfig::default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Timeout for a single connect attempt (dial + welcome frame)
    #[serde(default = "ConnectionConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl ConnectionConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    fn default_reconnect() -> bool {
        true
    }
    fn default_reconnect_delay_ms() -> u64 {
        DEFAULT_RECONNECT_DELAY_MS
    }
    fn default_reconnect_delay_max_ms() -> u64 {
        DEFAULT_RECONNECT_DELAY_MAX_MS
    }
    fn default_max_reconnect_attempts() -> u32 {
        DEFAULT_MAX_RECONNECT_ATTEMPTS
    }
    fn default_connect_timeout_ms() -> u64 {
        DEFAULT_CONNECT_TIMEOUT_MS
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            reconnect: true,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            reconnect_delay_max_ms: DEFAULT_RECONNECT_DELAY_MAX_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// Sampling policy
// ============================================================================

/// Requested positioning accuracy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    Low,
    Balanced,
    High,
}

/// Sampling policy for the location watch.
///
/// A new sample is published when *either* threshold is crossed: enough time
/// elapsed since the last published sample, or enough movement from it. This
/// trades freshness against battery and bandwidth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplePolicy {
    #[serde(default = "SamplePolicy::default_accuracy")]
    pub accuracy: Accuracy,

    #[serde(default = "SamplePolicy::default_min_interval_ms")]
    pub min_interval_ms: u64,

    #[serde(default = "SamplePolicy::default_min_distance_m")]
    pub min_distance_m: f64,
}

impl SamplePolicy {
    fn default_accuracy() -> Accuracy {
        Accuracy::High
    }
    fn default_min_interval_ms() -> u64 {
        DEFAULT_SAMPLE_INTERVAL_MS
    }
    fn default_min_distance_m() -> f64 {
        DEFAULT_SAMPLE_DISTANCE_M
    }
}

impl Default for SamplePolicy {
    fn default() -> Self {
        Self {
            accuracy: Accuracy::High,
            min_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            min_distance_m: DEFAULT_SAMPLE_DISTANCE_M,
        }
    }
}

// ============================================================================
// Main config
// ============================================================================

/// Top-level configuration for a session context
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Channel connection configuration
    pub connection: ConnectionConfig,

    /// Location sampling policy
    #[serde(default)]
    pub sampling: SamplePolicy,
}

impl Config {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(server_url),
            sampling: SamplePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_defaults() {
        let config = ConnectionConfig::new("ws://localhost:8010/ws");
        assert!(config.reconnect);
        assert_eq!(config.reconnect_delay_ms, 2000);
        assert_eq!(config.reconnect_delay_max_ms, 5000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.connect_timeout_ms, 20000);
    }

    #[test]
    fn test_sampling_defaults() {
        let policy = SamplePolicy::default();
        assert_eq!(policy.accuracy, Accuracy::High);
        assert_eq!(policy.min_interval_ms, 3000);
        assert_eq!(policy.min_distance_m, 10.0);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"connection": {"server_url": "ws://h:1/ws"}}"#).unwrap();
        assert_eq!(config.connection.server_url, "ws://h:1/ws");
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.sampling.min_interval_ms, 3000);
    }
}
