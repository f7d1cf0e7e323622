// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Heartbeat-driven liveness tracking.
//!
//! One monitor per logical connection. Every received packet refreshes it;
//! on each heartbeat tick the owner pings the remote side and asks the
//! monitor for a verdict. A connection silent for longer than the timeout is
//! dead and gets the same cleanup as a socket error.

use crate::config::SessionConfig;
use std::time::{Duration, Instant};
use tokio::time::{Interval, MissedTickBehavior};

/// Heartbeat cadence and eviction threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    pub heartbeat_interval: Duration,
    pub timeout: Duration,
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(2000),
            timeout: Duration::from_millis(6000),
        }
    }
}

impl LivenessPolicy {
    /// Heartbeat ticker; the first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let period = self.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

impl From<&SessionConfig> for LivenessPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            timeout: config.liveness_timeout(),
        }
    }
}

/// Outcome of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    Dead { idle: Duration },
}

/// Time since the last packet on one connection.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    policy: LivenessPolicy,
    last_seen: Instant,
}

impl LivenessMonitor {
    /// A fresh connection counts as just heard from.
    pub fn new(policy: LivenessPolicy, now: Instant) -> Self {
        Self {
            policy,
            last_seen: now,
        }
    }

    /// A packet of any kind arrived.
    pub fn record(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn check(&self, now: Instant) -> Verdict {
        let idle = self.idle(now);
        if idle > self.policy.timeout {
            Verdict::Dead { idle }
        } else {
            Verdict::Alive
        }
    }
}
