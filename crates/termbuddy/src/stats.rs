// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-session leave statistics.

use crate::protocol::now_millis;
use crate::session::ConnectionStatus;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Summary handed back when a session stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveStats {
    pub key_presses: u64,
    pub session_duration_ms: u64,
    pub connected_duration_ms: u64,
    /// Unix epoch milliseconds.
    pub started_at: u64,
    /// Unix epoch milliseconds.
    pub ended_at: u64,
    /// First roster entry at leave time.
    pub peer_name: Option<String>,
}

impl LeaveStats {
    pub fn session_duration(&self) -> Duration {
        Duration::from_millis(self.session_duration_ms)
    }

    pub fn connected_duration(&self) -> Duration {
        Duration::from_millis(self.connected_duration_ms)
    }
}

/// Accumulates time spent in the `connected` status.
#[derive(Debug)]
pub struct SessionClock {
    started_at: u64,
    started: Instant,
    connected_since: Option<Instant>,
    connected_total: Duration,
}

impl SessionClock {
    pub fn new(now: Instant) -> Self {
        Self {
            started_at: now_millis(),
            started: now,
            connected_since: None,
            connected_total: Duration::ZERO,
        }
    }

    /// Open or close a connected interval.
    pub fn mark_status(&mut self, status: ConnectionStatus, now: Instant) {
        match (status, self.connected_since) {
            (ConnectionStatus::Connected, None) => self.connected_since = Some(now),
            (ConnectionStatus::Connected, Some(_)) => {}
            (_, Some(since)) => {
                self.connected_total += now.saturating_duration_since(since);
                self.connected_since = None;
            }
            (_, None) => {}
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected_since.is_some()
    }

    /// Connected time so far, including an open interval.
    pub fn connected_duration(&self, now: Instant) -> Duration {
        let open = self
            .connected_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        self.connected_total + open
    }

    pub fn finish(&self, now: Instant, key_presses: u64, peer_name: Option<String>) -> LeaveStats {
        LeaveStats {
            key_presses,
            session_duration_ms: now.saturating_duration_since(self.started).as_millis() as u64,
            connected_duration_ms: self.connected_duration(now).as_millis() as u64,
            started_at: self.started_at,
            ended_at: now_millis(),
            peer_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_connected_intervals_accumulate() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new(t0);

        clock.mark_status(ConnectionStatus::Waiting, t0);
        clock.mark_status(ConnectionStatus::Connected, t0 + ms(100));
        clock.mark_status(ConnectionStatus::Connected, t0 + ms(150));
        clock.mark_status(ConnectionStatus::Waiting, t0 + ms(300));
        assert!(!clock.is_connected());
        assert_eq!(clock.connected_duration(t0 + ms(1000)), ms(200));

        clock.mark_status(ConnectionStatus::Connected, t0 + ms(1000));
        assert_eq!(clock.connected_duration(t0 + ms(1500)), ms(700));
    }

    #[test]
    fn test_finish_includes_open_interval() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new(t0);
        clock.mark_status(ConnectionStatus::Connected, t0 + ms(500));

        let stats = clock.finish(t0 + ms(2000), 42, Some("Bob".into()));
        assert_eq!(stats.key_presses, 42);
        assert_eq!(stats.session_duration(), ms(2000));
        assert_eq!(stats.connected_duration(), ms(1500));
        assert_eq!(stats.peer_name.as_deref(), Some("Bob"));
        assert!(stats.ended_at >= stats.started_at);
    }

    #[test]
    fn test_never_connected() {
        let t0 = Instant::now();
        let mut clock = SessionClock::new(t0);
        clock.mark_status(ConnectionStatus::Connecting, t0);
        clock.mark_status(ConnectionStatus::Disconnected, t0 + ms(10));

        let stats = clock.finish(t0 + ms(50), 0, None);
        assert_eq!(stats.connected_duration_ms, 0);
    }

    #[test]
    fn test_stats_json_shape() {
        let t0 = Instant::now();
        let stats = SessionClock::new(t0).finish(t0, 3, None);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["keyPresses"], 3);
        assert!(json.get("sessionDurationMs").is_some());
        assert!(json.get("connectedDurationMs").is_some());
    }
}
