//! Session configuration.
//!
//! Everything a session needs is supplied at construction time from one of
//! these structs; there is no ambient global configuration. A TOML file per
//! session is the usual source, with code defaults for every field.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Full configuration for one replication session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// This node's identity (short station code, <= 16 bytes on the wire).
    pub node: String,

    /// Peer node identity, used as the registry key.
    pub peer: String,

    /// Peer address, `host:port`. The receiver dials this; the sender
    /// listens on it.
    pub peer_addr: String,

    /// Channel name handed to the archive on backfill queries.
    pub channel: String,

    pub ring: RingConfig,
    pub timing: TimingConfig,
    pub backfill: BackfillConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Ring file path.
    pub path: PathBuf,

    /// Ring capacity in data slots (slot 0, the control record, not counted).
    pub capacity: u32,

    /// Slot size in bytes. Header + payload must fit.
    pub record_size: u32,

    /// Gap-list artifact path. Empty = ring path with `.gaps` appended.
    pub gap_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Ack after this many records, if the interval has not fired first.
    pub ack_every_records: u32,

    /// Ack at least this often while records are pending (milliseconds).
    pub ack_interval_ms: u64,

    /// Control record + gap list flush cadence (milliseconds).
    pub control_flush_ms: u64,

    /// Force-close the transport if no bytes arrive for this long.
    pub idle_timeout_ms: u64,

    /// Reconnect backoff bounds (milliseconds). Doubles from min, capped at max.
    pub backoff_min_ms: u64,
    pub backoff_max_ms: u64,

    /// How often the sender re-checks its ring for new records.
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Backfill byte budget floor — never throttled below this.
    pub rate_floor_bps: u64,

    /// Backfill byte budget ceiling.
    pub rate_ceiling_bps: u64,

    /// Attempts against ring + archive before a gap is declared unfillable.
    pub max_attempts: u32,

    /// Bounded queue depth between the backfill task and the send loop.
    pub queue_depth: usize,

    /// Allow more than one gap to be declared at a time. The conservative
    /// default matches the observed single-gap behavior of legacy feeds.
    pub multi_gap: bool,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            node: String::new(),
            peer: String::new(),
            peer_addr: String::new(),
            channel: String::new(),
            ring: RingConfig::default(),
            timing: TimingConfig::default(),
            backfill: BackfillConfig::default(),
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            capacity: 1024,
            record_size: crate::wire::DEFAULT_RECORD_SIZE,
            gap_path: PathBuf::new(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ack_every_records: 100,
            ack_interval_ms: 5_000,
            control_flush_ms: 10_000,
            idle_timeout_ms: 60_000,
            backoff_min_ms: 500,
            backoff_max_ms: 120_000,
            poll_interval_ms: 100,
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            rate_floor_bps: 4 * 1024,
            rate_ceiling_bps: 256 * 1024,
            max_attempts: 3,
            queue_depth: 64,
            multi_gap: false,
        }
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

impl SessionConfig {
    /// Load a session config from a TOML file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Gap-list artifact path, derived from the ring path when unset.
    pub fn gap_path(&self) -> PathBuf {
        if self.ring.gap_path.as_os_str().is_empty() {
            let mut p = self.ring.path.clone().into_os_string();
            p.push(".gaps");
            PathBuf::from(p)
        } else {
            self.ring.gap_path.clone()
        }
    }
}

impl TimingConfig {
    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    pub fn control_flush(&self) -> Duration {
        Duration::from_millis(self.control_flush_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
}
