//! Engine configuration: timeouts, intervals, limits and the advertised name.

use std::time::Duration;

use serde::Deserialize;

use crate::protocol::SERVICE_NAME;
use crate::wire::DEFAULT_MAX_FRAME_LEN;

/// Engine tunables. Deserializable so hosts can embed it in their own config files
/// (the Linux daemon reads it from the `[engine]` table).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Name shown to other hosts (default "p2share").
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Registered service name (default "P2P File Share").
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Largest accepted frame in bytes (default 1 MiB).
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    /// Receive side: fail the transfer if no bytes arrive for this long (default 30).
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Bound on a single write and on waiting for a response (default 30).
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Per-attempt connect timeout (default 15).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Connect attempts before giving up on a peer (default 3).
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Pause between retries of connect, listen and advertise (default 2).
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Serving side: close a connection with no request for this long (default 300).
    #[serde(default = "default_serve_idle_timeout_secs")]
    pub serve_idle_timeout_secs: u64,
    /// Discovery period (default 45).
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Bound on one scan (default 20).
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
    /// Peers unseen for this long are pruned (default 180).
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    /// Re-register the service this often (default 300).
    #[serde(default = "default_advertise_refresh_secs")]
    pub advertise_refresh_secs: u64,
    /// Capacity of the event broadcast channel (default 256).
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_display_name() -> String {
    "p2share".to_string()
}
fn default_service_name() -> String {
    SERVICE_NAME.to_string()
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_io_timeout_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    2
}
fn default_serve_idle_timeout_secs() -> u64 {
    300
}
fn default_scan_interval_secs() -> u64 {
    45
}
fn default_scan_timeout_secs() -> u64 {
    20
}
fn default_staleness_secs() -> u64 {
    180
}
fn default_advertise_refresh_secs() -> u64 {
    300
}
fn default_event_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            service_name: default_service_name(),
            max_frame_len: default_max_frame_len(),
            idle_timeout_secs: default_idle_timeout_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            connect_attempts: default_connect_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            serve_idle_timeout_secs: default_serve_idle_timeout_secs(),
            scan_interval_secs: default_scan_interval_secs(),
            scan_timeout_secs: default_scan_timeout_secs(),
            staleness_secs: default_staleness_secs(),
            advertise_refresh_secs: default_advertise_refresh_secs(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl EngineConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn serve_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.serve_idle_timeout_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn advertise_refresh(&self) -> Duration {
        Duration::from_secs(self.advertise_refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_bluetooth_timings() {
        let c = EngineConfig::default();
        assert_eq!(c.scan_interval(), Duration::from_secs(45));
        assert_eq!(c.staleness(), Duration::from_secs(180));
        assert_eq!(c.service_name, "P2P File Share");
        assert_eq!(c.max_frame_len, 1024 * 1024);
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let c: EngineConfig =
            serde_json::from_str(r#"{"display_name":"laptop","idle_timeout_secs":5}"#).unwrap();
        assert_eq!(c.display_name, "laptop");
        assert_eq!(c.idle_timeout(), Duration::from_secs(5));
        assert_eq!(c.connect_attempts, 3);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(serde_json::from_str::<EngineConfig>(r#"{"chunk_size":1}"#).is_err());
    }
}
