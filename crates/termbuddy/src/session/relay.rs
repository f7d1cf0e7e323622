// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host relay.
//!
//! Accepts peer connections and relays presence between them:
//!
//! 1. An accepted socket is registered as `Connecting`
//! 2. Its `hello` activates it: the host answers with its own `hello`, tells
//!    the other active peers with `peer_joined`, and replays one
//!    `peer_joined` per existing peer to the newcomer
//! 3. `status` and `projectile` are stamped with the sender's name and
//!    relayed to every other active peer
//! 4. Close, read error or liveness eviction removes the peer and
//!    broadcasts `peer_left`
//!
//! Every connection has its own reader, writer task and heartbeat, so a
//! stalled peer never holds up the others.

use super::connection::{write_loop, ConnectionError, PacketReader};
use super::liveness::{LivenessPolicy, Verdict};
use super::registry::{PeerConnection, PeerId, PeerRegistry};
use super::{ConnectionStatus, EventSink, Peer, SessionError, SessionEvent};
use crate::config::SessionConfig;
use crate::protocol::{
    ActivityState, ProjectileDirection, ProjectileKind, SessionPacket, HOST_PLACEHOLDER_NAME,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

/// How long a removed peer's writer may keep flushing before it is aborted.
const WRITER_GRACE: Duration = Duration::from_millis(250);

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A running host.
pub struct Host {
    local_addr: SocketAddr,
    shared: Arc<HostShared>,
    shutdown_tx: watch::Sender<bool>,
    acceptor: JoinHandle<()>,
}

struct HostShared {
    local_name: String,
    registry: RwLock<PeerRegistry>,
    events: EventSink,
    policy: LivenessPolicy,
    max_line: usize,
    queue_depth: usize,
    stopping: AtomicBool,
}

impl Host {
    /// Validate `config`, bind the listener and start accepting.
    pub async fn bind(
        local_name: &str,
        addr: SocketAddr,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                SessionError::AddressInUse(addr)
            } else {
                SessionError::Bind(format!("{}: {}", addr, e))
            }
        })?;
        let local_addr = listener.local_addr()?;
        info!("Host '{}' listening on {}", local_name, local_addr);

        let shared = Arc::new(HostShared {
            local_name: local_name.to_string(),
            registry: RwLock::new(PeerRegistry::new()),
            events,
            policy: LivenessPolicy::from(config),
            max_line: config.max_line_length,
            queue_depth: config.outbound_queue_depth,
            stopping: AtomicBool::new(false),
        });
        shared
            .events
            .emit(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Waiting));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let acceptor = tokio::spawn(accept_loop(listener, shared.clone(), shutdown_rx));

        Ok(Self {
            local_addr,
            shared,
            shutdown_tx,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Active peers in join order.
    pub async fn roster(&self) -> Vec<Peer> {
        self.shared.registry.read().await.roster()
    }

    /// Broadcast the host's own state. Clients attribute a status without
    /// sender to the host entry.
    pub async fn send_local_status(&self, state: ActivityState) -> usize {
        let packet = SessionPacket::status(state, None);
        self.shared.registry.read().await.broadcast(&packet, None)
    }

    pub async fn send_projectile(&self, kind: ProjectileKind, direction: ProjectileDirection) -> usize {
        let packet =
            SessionPacket::projectile(kind, direction, Some(self.shared.local_name.clone()));
        self.shared.registry.read().await.broadcast(&packet, None)
    }

    /// Stop accepting, close every peer socket, then the listener.
    pub async fn shutdown(self) {
        self.shared.stopping.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.acceptor.await {
            debug!("Acceptor ended abnormally: {}", e);
        }
        info!("Host on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<HostShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        info!("New connection from {}", peer_addr);
                        connections.spawn(serve_peer(
                            stream,
                            peer_addr,
                            shared.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
            Some(result) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = result {
                    warn!("Connection task failed: {}", e);
                }
            }
            _ = shutdown.changed() => {
                debug!("Acceptor shutting down");
                break;
            }
        }
    }

    while connections.join_next().await.is_some() {}
    drop(listener);
}

async fn serve_peer(
    stream: TcpStream,
    peer_addr: SocketAddr,
    shared: Arc<HostShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel(shared.queue_depth);
    let mut heartbeat = shared.policy.ticker();
    let mut writer = tokio::spawn(write_loop(write_half, rx));
    let id = shared.register(peer_addr, tx).await;

    let mut reader = PacketReader::new(read_half, shared.max_line);
    let mut writer_done = false;

    loop {
        tokio::select! {
            result = reader.next_packet() => {
                match result {
                    Ok(Some(packet)) => shared.handle_packet(id, packet).await,
                    Ok(None) => {
                        info!("Connection closed: {} ({})", id, peer_addr);
                        break;
                    }
                    Err(e) => {
                        warn!("Read error from {}: {}", peer_addr, e);
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if !shared.heartbeat(id).await {
                    break;
                }
            }
            result = &mut writer, if !writer_done => {
                writer_done = true;
                log_writer_exit(peer_addr, result);
                break;
            }
            _ = shutdown.changed() => {
                debug!("Connection handler shutting down: {}", peer_addr);
                break;
            }
        }
    }

    // Dropping the registry entry closes the queue; the writer flushes what
    // it has and shuts the socket down.
    shared.remove_peer(id).await;
    if !writer_done && tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

fn log_writer_exit(
    peer_addr: SocketAddr,
    result: Result<Result<(), ConnectionError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => debug!("Writer for {} finished", peer_addr),
        Ok(Err(e)) => warn!("Write error to {}: {}", peer_addr, e),
        Err(e) => warn!("Writer task for {} failed: {}", peer_addr, e),
    }
}

impl HostShared {
    async fn register(&self, peer_addr: SocketAddr, tx: mpsc::Sender<SessionPacket>) -> PeerId {
        let mut registry = self.registry.write().await;
        let id = registry.allocate_id();
        registry.insert(PeerConnection::new(
            id,
            peer_addr,
            tx,
            self.policy,
            Instant::now(),
        ));
        debug!("Registered {} for {}", id, peer_addr);
        id
    }

    /// One heartbeat tick: evict if silent too long, otherwise ping.
    ///
    /// Returns false when the connection should close.
    async fn heartbeat(&self, id: PeerId) -> bool {
        let registry = self.registry.read().await;
        let Some(peer) = registry.get(id) else {
            return false;
        };
        if let Verdict::Dead { idle } = peer.liveness().check(Instant::now()) {
            info!(
                "Evicting {} '{}' ({}): silent for {:?}",
                id,
                peer.display_name(),
                peer.addr(),
                idle
            );
            return false;
        }
        peer.send(SessionPacket::ping());
        true
    }

    /// Apply one packet from `id` under the registry lock.
    async fn handle_packet(&self, id: PeerId, packet: SessionPacket) {
        let mut registry = self.registry.write().await;
        if !registry.touch(id, Instant::now()) {
            return;
        }
        trace!("<- {} from {}", packet.type_name(), id);

        match &packet {
            SessionPacket::Hello { client_name, .. } => {
                self.on_hello(&mut registry, id, client_name);
            }
            SessionPacket::Ping { .. } => {
                registry.send_to(id, SessionPacket::pong());
            }
            SessionPacket::Pong { .. } => {}
            SessionPacket::Status { state, .. } => {
                let Some(name) = active_name(&registry, id) else {
                    debug!("Status from {} before hello, dropped", id);
                    return;
                };
                registry.set_state(id, *state);
                registry.broadcast(&packet.with_sender(&name), Some(id));
                self.events.emit(SessionEvent::StatusChanged {
                    peer_id: id.to_string(),
                    state: *state,
                });
            }
            SessionPacket::Projectile {
                kind, direction, ..
            } => {
                let Some(name) = active_name(&registry, id) else {
                    debug!("Projectile from {} before hello, dropped", id);
                    return;
                };
                registry.broadcast(&packet.with_sender(&name), Some(id));
                self.events.emit(SessionEvent::ProjectileReceived {
                    kind: *kind,
                    direction: *direction,
                    sender_name: Some(name),
                });
            }
            SessionPacket::PeerJoined { .. } | SessionPacket::PeerLeft { .. } => {
                debug!("Ignoring {} from {}", packet.type_name(), id);
            }
        }
    }

    fn on_hello(&self, registry: &mut PeerRegistry, id: PeerId, client_name: &str) {
        let name = client_name.trim();
        if name.is_empty() {
            debug!("Ignoring hello without a name from {}", id);
            return;
        }

        let reply = SessionPacket::hello(&self.local_name, HOST_PLACEHOLDER_NAME);
        let Some(others) = registry.activate(id, name) else {
            // Repeated hello: answer it, keep the first identity.
            registry.send_to(id, reply);
            return;
        };

        registry.send_to(id, reply);
        registry.broadcast(&SessionPacket::peer_joined(name), Some(id));
        for other in &others {
            registry.send_to(id, SessionPacket::peer_joined(other));
        }

        if let Some(peer) = registry.get(id) {
            info!("Peer '{}' joined from {} as {}", name, peer.addr(), id);
        }
        self.events.emit(SessionEvent::RosterChanged(registry.roster()));
        if registry.active_count() == 1 {
            self.events
                .emit(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Connected));
        }
    }

    async fn remove_peer(&self, id: PeerId) {
        let mut registry = self.registry.write().await;
        let Some(peer) = registry.remove(id) else {
            return;
        };
        if !peer.is_active() {
            debug!("Dropped {} ({}) before hello", id, peer.addr());
            return;
        }

        info!("Peer '{}' left ({})", peer.display_name(), peer.addr());
        if self.stopping.load(Ordering::Acquire) {
            return;
        }
        registry.broadcast(&SessionPacket::peer_left(peer.display_name()), None);
        self.events.emit(SessionEvent::RosterChanged(registry.roster()));
        if registry.active_count() == 0 {
            self.events
                .emit(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Waiting));
        }
    }
}

fn active_name(registry: &PeerRegistry, id: PeerId) -> Option<String> {
    registry
        .get(id)
        .filter(|peer| peer.is_active())
        .map(|peer| peer.display_name().to_string())
}
