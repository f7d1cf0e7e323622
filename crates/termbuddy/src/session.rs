// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Presence sessions.
//!
//! A [`Session`] is either a Host, which accepts any number of peers and
//! relays their packets to each other, or a Client with a single link to a
//! Host. Everything the rendering layer needs to know arrives as
//! [`SessionEvent`]s on the channel passed at start; everything it wants to
//! say goes through the `send_*` methods.
//!
//! # Example
//!
//! ```no_run
//! use termbuddy::{ActivityState, Session, SessionConfig};
//! use tokio::sync::mpsc;
//!
//! # async fn demo() -> Result<(), termbuddy::SessionError> {
//! let (events_tx, mut events) = mpsc::unbounded_channel();
//! let session = Session::start_host("Ann", None, &SessionConfig::default(), events_tx).await?;
//! println!("listening on {:?}", session.listen_addr());
//!
//! session.send_local_status(ActivityState::Typing).await;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! #   break;
//! }
//! let stats = session.stop(0).await;
//! println!("connected for {:?}", stats.connected_duration());
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod link;
pub mod liveness;
pub mod registry;
pub mod relay;

pub use connection::{ConnectionError, PacketReader};
pub use link::{ClientRoster, Link, HOST_PEER_ID};
pub use liveness::{LivenessMonitor, LivenessPolicy, Verdict};
pub use registry::{PeerConnection, PeerId, PeerPhase, PeerRegistry, CONNECTING_NAME};
pub use relay::Host;

use crate::config::{ConfigError, SessionConfig};
use crate::discovery::{Announcer, AnnouncerConfig};
use crate::protocol::{ActivityState, ProjectileDirection, ProjectileKind};
use crate::stats::{LeaveStats, SessionClock};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, trace, warn};

/// Connection status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Host listening with nobody joined yet.
    Waiting,
    Connecting,
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// A roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub state: ActivityState,
}

/// Notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StatusChanged {
        peer_id: String,
        state: ActivityState,
    },
    ProjectileReceived {
        kind: ProjectileKind,
        direction: ProjectileDirection,
        sender_name: Option<String>,
    },
    RosterChanged(Vec<Peer>),
    ConnectionStatusChanged(ConnectionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Host,
    Client,
}

/// Upward event channel shared by every task of one session.
///
/// Status transitions also feed the session clock. Once muted (user stop),
/// nothing more is delivered.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
    clock: Arc<Mutex<SessionClock>>,
    muted: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            tx,
            clock: Arc::new(Mutex::new(SessionClock::new(Instant::now()))),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        if self.muted.load(Ordering::Acquire) {
            return;
        }
        if let SessionEvent::ConnectionStatusChanged(status) = &event {
            self.clock
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .mark_status(*status, Instant::now());
        }
        if self.tx.send(event).is_err() {
            trace!("Session event receiver dropped");
        }
    }

    pub fn mute(&self) {
        self.muted.store(true, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    fn finish(&self, key_presses: u64, peer_name: Option<String>) -> LeaveStats {
        self.clock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish(Instant::now(), key_presses, peer_name)
    }
}

/// Room name a host announces for `local_name`.
pub fn room_name(local_name: &str) -> String {
    format!("{}'s Room", local_name)
}

enum Inner {
    Host {
        host: Host,
        announcer: Option<Announcer>,
    },
    Client(Link),
}

/// One running session, host or client.
pub struct Session {
    local_name: String,
    events: EventSink,
    inner: Inner,
}

impl Session {
    /// Bind the host listener and start announcing the room.
    ///
    /// `port` overrides `config.tcp_port`; 0 lets the OS choose. A port
    /// already in use fails with [`SessionError::AddressInUse`].
    pub async fn start_host(
        local_name: &str,
        port: Option<u16>,
        config: &SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let events = EventSink::new(events);
        let addr = SocketAddr::new(config.bind_address, port.unwrap_or(config.tcp_port));
        let host = Host::bind(local_name, addr, config, events.clone()).await?;

        let announcer = if config.announce {
            let announcer = Announcer::start(AnnouncerConfig {
                host_name: local_name.to_string(),
                room_name: room_name(local_name),
                tcp_port: host.local_addr().port(),
                discovery_port: config.discovery_port,
                interval: config.announce_interval(),
                targets: None,
            })
            .await;
            match announcer {
                Ok(announcer) => Some(announcer),
                Err(e) => {
                    warn!("Room will not be discoverable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            local_name: local_name.to_string(),
            events,
            inner: Inner::Host { host, announcer },
        })
    }

    /// Connect to a host and say hello.
    ///
    /// A failed or timed-out connect reports `disconnected` on the event
    /// channel and returns the error.
    pub async fn start_client(
        local_name: &str,
        host_ip: IpAddr,
        tcp_port: u16,
        host_name_hint: Option<&str>,
        config: &SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let events = EventSink::new(events);
        let remote = SocketAddr::new(host_ip, tcp_port);
        let link = Link::connect(local_name, remote, host_name_hint, config, events.clone()).await?;

        Ok(Self {
            local_name: local_name.to_string(),
            events,
            inner: Inner::Client(link),
        })
    }

    pub fn role(&self) -> Role {
        match self.inner {
            Inner::Host { .. } => Role::Host,
            Inner::Client(_) => Role::Client,
        }
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Host listening address; `None` for a client.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            Inner::Host { host, .. } => Some(host.local_addr()),
            Inner::Client(_) => None,
        }
    }

    /// Host address this client is linked to; `None` for a host.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            Inner::Host { .. } => None,
            Inner::Client(link) => Some(link.remote_addr()),
        }
    }

    /// Tell every peer about the local activity state.
    pub async fn send_local_status(&self, state: ActivityState) {
        match &self.inner {
            Inner::Host { host, .. } => {
                host.send_local_status(state).await;
            }
            Inner::Client(link) => {
                link.send_status(state);
            }
        }
    }

    pub async fn send_projectile(&self, kind: ProjectileKind, direction: ProjectileDirection) {
        match &self.inner {
            Inner::Host { host, .. } => {
                host.send_projectile(kind, direction).await;
            }
            Inner::Client(link) => {
                link.send_projectile(kind, direction);
            }
        }
    }

    pub async fn roster(&self) -> Vec<Peer> {
        match &self.inner {
            Inner::Host { host, .. } => host.roster().await,
            Inner::Client(link) => link.roster(),
        }
    }

    /// Leave the session and tear everything down.
    ///
    /// No events are emitted from here on.
    pub async fn stop(self, key_presses: u64) -> LeaveStats {
        let peer_name = self.roster().await.into_iter().next().map(|p| p.name);
        self.events.mute();

        match self.inner {
            Inner::Host { host, announcer } => {
                if let Some(announcer) = announcer {
                    announcer.stop().await;
                }
                host.shutdown().await;
            }
            Inner::Client(link) => link.close().await,
        }

        let stats = self.events.finish(key_presses, peer_name);
        info!(
            "Session ended after {:?} ({:?} connected)",
            stats.session_duration(),
            stats.connected_duration()
        );
        stats
    }
}

/// Session error types.
#[derive(Debug)]
pub enum SessionError {
    Config(ConfigError),
    Bind(String),
    AddressInUse(SocketAddr),
    Connect(String),
    ConnectTimeout(SocketAddr),
    Io(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "Configuration error: {}", e),
            Self::Bind(s) => write!(f, "Bind error: {}", s),
            Self::AddressInUse(addr) => write!(f, "Address already in use: {}", addr),
            Self::Connect(s) => write!(f, "Connect error: {}", s),
            Self::ConnectTimeout(addr) => write!(f, "Timed out connecting to {}", addr),
            Self::Io(s) => write!(f, "I/O error: {}", s),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
