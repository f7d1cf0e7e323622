// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session configuration.

use crate::protocol::{DEFAULT_MAX_LINE_LENGTH, DISCOVERY_PORT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Timers, ports and limits shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// UDP port hosts announce to and scanners listen on (default: 41234)
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Host TCP port (default: 0, OS-assigned)
    #[serde(default)]
    pub tcp_port: u16,

    /// Host bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Whether a host announces its room over UDP (default: true)
    #[serde(default = "default_announce")]
    pub announce: bool,

    /// Interval between discovery announcements (ms)
    #[serde(default = "default_announce_interval")]
    pub announce_interval_ms: u64,

    /// Interval between scanner prune passes (ms)
    #[serde(default = "default_prune_interval")]
    pub prune_interval_ms: u64,

    /// A room not heard from for this long is dropped (ms)
    #[serde(default = "default_stale_after")]
    pub stale_after_ms: u64,

    /// Interval between pings on every connection (ms)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a connection is declared dead (ms)
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_ms: u64,

    /// Client connect timeout (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// No key activity for this long flips the local state to IDLE (ms)
    #[serde(default = "default_idle_after")]
    pub idle_after_ms: u64,

    /// Activity monitor poll interval (ms)
    #[serde(default = "default_activity_poll")]
    pub activity_poll_ms: u64,

    /// Maximum accepted session line (bytes)
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Per-connection outbound queue depth (packets)
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_announce() -> bool {
    true
}

fn default_announce_interval() -> u64 {
    1000
}

fn default_prune_interval() -> u64 {
    500
}

fn default_stale_after() -> u64 {
    3500
}

fn default_heartbeat_interval() -> u64 {
    2000
}

fn default_liveness_timeout() -> u64 {
    6000
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_idle_after() -> u64 {
    1500
}

fn default_activity_poll() -> u64 {
    200
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_outbound_queue_depth() -> usize {
    64
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            tcp_port: 0,
            bind_address: default_bind_address(),
            announce: default_announce(),
            announce_interval_ms: default_announce_interval(),
            prune_interval_ms: default_prune_interval(),
            stale_after_ms: default_stale_after(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            liveness_timeout_ms: default_liveness_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            idle_after_ms: default_idle_after(),
            activity_poll_ms: default_activity_poll(),
            max_line_length: default_max_line_length(),
            outbound_queue_depth: default_outbound_queue_depth(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a JSON file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_millis(self.prune_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_millis(self.idle_after_ms)
    }

    pub fn activity_poll(&self) -> Duration {
        Duration::from_millis(self.activity_poll_ms)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery_port == 0 {
            return Err(ConfigError::InvalidValue(
                "discovery_port cannot be 0".into(),
            ));
        }
        let intervals = [
            ("announce_interval_ms", self.announce_interval_ms),
            ("prune_interval_ms", self.prune_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("idle_after_ms", self.idle_after_ms),
            ("activity_poll_ms", self.activity_poll_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} cannot be 0", name)));
            }
        }
        if self.liveness_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::InvalidValue(
                "liveness_timeout_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        // Roughly three lost announcements must fit in the staleness window.
        if self.stale_after_ms < self.announce_interval_ms.saturating_mul(3) {
            return Err(ConfigError::InvalidValue(
                "stale_after_ms must be at least 3x announce_interval_ms".into(),
            ));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::InvalidValue(
                "max_line_length cannot be 0".into(),
            ));
        }
        if self.outbound_queue_depth == 0 {
            return Err(ConfigError::InvalidValue(
                "outbound_queue_depth cannot be 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, Clone)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(s) => write!(f, "I/O error: {}", s),
            Self::ParseError(s) => write!(f, "Parse error: {}", s),
            Self::SerializeError(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidValue(s) => write!(f, "Invalid value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
