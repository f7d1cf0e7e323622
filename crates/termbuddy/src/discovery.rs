// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LAN room discovery over UDP broadcast.
//!
//! A host runs an [`Announcer`] once its TCP listener is bound; clients run a
//! [`Scanner`] on the well-known discovery port. There is no goodbye packet:
//! a room disappears from scan results when its announcements stop arriving
//! for longer than the staleness threshold.

pub mod announcer;
pub mod interfaces;
pub mod scanner;

pub use announcer::{Announcer, AnnouncerConfig};
pub use interfaces::{broadcast_address, broadcast_targets};
pub use scanner::{DiscoveredRoom, RoomTable, Scanner, ScannerConfig};

/// Discovery error types.
#[derive(Debug)]
pub enum DiscoveryError {
    Bind(String),
    SocketOption(String),
    InvalidConfig(String),
    Io(String),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(s) => write!(f, "Bind error: {}", s),
            Self::SocketOption(s) => write!(f, "Socket option error: {}", s),
            Self::InvalidConfig(s) => write!(f, "Invalid configuration: {}", s),
            Self::Io(s) => write!(f, "I/O error: {}", s),
        }
    }
}

impl std::error::Error for DiscoveryError {}

impl From<std::io::Error> for DiscoveryError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_error_display() {
        let err = DiscoveryError::Bind("address in use".into());
        assert!(err.to_string().contains("Bind"));

        let err: DiscoveryError = std::io::Error::other("boom").into();
        assert!(err.to_string().contains("I/O"));
    }
}
