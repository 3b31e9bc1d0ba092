//! Engine configuration
//!
//! Every recognised option with its default. A JSON document may override any
//! subset of the fields.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BoreasError, BoreasResult};
use crate::types::{AliveTest, AliveTestSet};

/// Hosts probed per burst. A value `<= 0` disables pacing.
pub const BURST: i64 = 100;
/// Pause between two bursts.
pub const BURST_TIMEOUT: Duration = Duration::from_millis(100);
/// Grace window for late replies after the last probe was sent.
pub const WAIT_FOR_REPLIES_TIMEOUT: Duration = Duration::from_secs(5);
/// Source port of outgoing TCP pings. Used to attribute replies to this engine.
pub const FILTER_PORT: u16 = 9910;
/// Destination ports of TCP-ACK / TCP-SYN pings when none are configured.
pub const DEFAULT_TCP_PORTS: [u16; 5] = [80, 137, 587, 3128, 8081];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AliveConfig {
    /// Alive test bitmask. Unset means TCP-ACK plus ICMP.
    pub alive_test: Option<AliveTestSet>,
    pub burst: i64,
    #[serde(with = "duration_ms", rename = "burst_timeout_ms")]
    pub burst_timeout: Duration,
    #[serde(with = "duration_ms", rename = "wait_for_replies_ms")]
    pub wait_for_replies: Duration,
    pub filter_port: u16,
    pub tcp_ports: Vec<u16>,
    pub max_scan_hosts: Option<usize>,
    /// Bound of the "host confirmed alive" channel between listener and state task.
    pub event_buffer: usize,
    #[serde(with = "duration_ms", rename = "capture_read_timeout_ms")]
    pub capture_read_timeout: Duration,
}

impl Default for AliveConfig {
    fn default() -> Self {
        Self {
            alive_test: None,
            burst: BURST,
            burst_timeout: BURST_TIMEOUT,
            wait_for_replies: WAIT_FOR_REPLIES_TIMEOUT,
            filter_port: FILTER_PORT,
            tcp_ports: DEFAULT_TCP_PORTS.to_vec(),
            max_scan_hosts: None,
            event_buffer: 1024,
            capture_read_timeout: Duration::from_millis(100),
        }
    }
}

impl AliveConfig {
    /// Fast preset: no pacing, short grace window.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            burst: 0,
            wait_for_replies: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Stealth preset: small bursts with long pauses.
    #[must_use]
    pub fn stealth() -> Self {
        Self {
            burst: 10,
            burst_timeout: Duration::from_millis(500),
            wait_for_replies: Duration::from_secs(8),
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> BoreasResult<Self> {
        let config: AliveConfig = serde_json::from_str(json)
            .map_err(|e| BoreasError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> BoreasResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BoreasError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> BoreasResult<()> {
        if self.tcp_ports.iter().any(|p| *p == 0) {
            return Err(BoreasError::Config("TCP port 0 is not probeable".to_string()));
        }
        if self.filter_port == 0 {
            return Err(BoreasError::Config("filter port must be non-zero".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(BoreasError::Config("event buffer must be non-zero".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn selector(&self) -> AliveTestSet {
        self.alive_test
            .unwrap_or_else(|| [AliveTest::TcpAck, AliveTest::Icmp].into_iter().collect())
    }

    /// Burst size, or `None` when pacing is disabled.
    #[inline]
    #[must_use]
    pub fn burst_size(&self) -> Option<usize> {
        (self.burst > 0).then_some(self.burst as usize)
    }

    #[must_use]
    pub fn with_alive_test(mut self, tests: AliveTestSet) -> Self {
        self.alive_test = Some(tests);
        self
    }

    #[must_use]
    pub fn with_burst(mut self, burst: i64) -> Self {
        self.burst = burst;
        self
    }

    #[must_use]
    pub fn with_burst_timeout(mut self, timeout: Duration) -> Self {
        self.burst_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_wait_for_replies(mut self, wait: Duration) -> Self {
        self.wait_for_replies = wait;
        self
    }

    #[must_use]
    pub fn with_filter_port(mut self, port: u16) -> Self {
        self.filter_port = port;
        self
    }

    #[must_use]
    pub fn with_tcp_ports(mut self, ports: Vec<u16>) -> Self {
        self.tcp_ports = ports;
        self
    }

    #[must_use]
    pub fn with_max_scan_hosts(mut self, max: Option<usize>) -> Self {
        self.max_scan_hosts = max;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
