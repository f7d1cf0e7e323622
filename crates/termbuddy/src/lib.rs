// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! termbuddy
//!
//! LAN presence for people working side by side in terminals: who is in the
//! room, who is typing, and the occasional thrown rose.
//!
//! # Features
//!
//! - **Discovery**: hosts announce a room over UDP broadcast; scanners list
//!   the rooms they hear and forget the ones that go quiet
//! - **Relay**: a host accepts TCP peers and relays presence between them
//! - **Liveness**: heartbeats on every connection, silent peers are evicted
//! - **Activity**: typing/idle detection from terminal or keyboard input
//!
//! # Wire format
//!
//! Discovery datagrams carry one JSON object each:
//!
//! ```json
//! {"type":"termbuddy_discovery","version":1,"hostName":"Ann","roomName":"Ann's Room","tcpPort":40123,"sentAt":1767225600000}
//! ```
//!
//! Session packets are newline-delimited JSON on the TCP link:
//!
//! ```json
//! {"type":"hello","hostName":"Host","clientName":"Bob","sentAt":1767225600000}
//! {"type":"status","state":"TYPING","senderName":"Bob","sentAt":1767225601000}
//! ```

pub mod activity;
pub mod config;
pub mod discovery;
pub mod protocol;
pub mod session;
pub mod stats;

pub use activity::{ActivityMonitor, ActivitySource, KeyboardHub, KeyboardSubscription};
pub use config::{ConfigError, SessionConfig};
pub use discovery::{Announcer, DiscoveredRoom, DiscoveryError, Scanner, ScannerConfig};
pub use protocol::{
    ActivityState, DiscoveryPacket, ProjectileDirection, ProjectileKind, ProtocolError,
    SessionPacket,
};
pub use session::{ConnectionStatus, Peer, Role, Session, SessionError, SessionEvent};
pub use stats::LeaveStats;
