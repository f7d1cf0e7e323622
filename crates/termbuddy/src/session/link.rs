// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client link to a host.
//!
//! One outbound TCP connection, `connecting -> connected -> disconnected`.
//! There is no reconnect: once the link drops, the roster is cleared and the
//! caller decides whether to scan and join again.

use super::connection::{write_loop, ConnectionError, PacketReader};
use super::liveness::{LivenessMonitor, LivenessPolicy, Verdict};
use super::{ConnectionStatus, EventSink, Peer, SessionError, SessionEvent};
use crate::config::SessionConfig;
use crate::protocol::{
    ActivityState, ProjectileDirection, ProjectileKind, SessionPacket, HOST_PLACEHOLDER_NAME,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Roster id of the entry representing the host itself.
pub const HOST_PEER_ID: &str = "host";

/// The client's view of who is in the room.
///
/// Peers relayed by the host are known by name only; the host entry has the
/// fixed id [`HOST_PEER_ID`].
#[derive(Debug, Default)]
pub struct ClientRoster {
    peers: Vec<Peer>,
    next_id: u64,
}

impl ClientRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the host entry at the front, once.
    pub fn on_host_hello(&mut self, host_name: &str) -> bool {
        if self.peers.iter().any(|p| p.id == HOST_PEER_ID) {
            return false;
        }
        self.peers.insert(
            0,
            Peer {
                id: HOST_PEER_ID.to_string(),
                name: host_name.to_string(),
                state: ActivityState::Idle,
            },
        );
        true
    }

    /// Apply a status; returns the ids of the entries it changed.
    ///
    /// With a sender name, relayed entries are matched by name. Without one
    /// the status came from the host itself.
    pub fn on_status(&mut self, state: ActivityState, sender_name: Option<&str>) -> Vec<String> {
        let mut changed = Vec::new();
        for peer in &mut self.peers {
            let matches = match sender_name {
                Some(name) => peer.id != HOST_PEER_ID && peer.name == name,
                None => peer.id == HOST_PEER_ID,
            };
            if matches {
                peer.state = state;
                changed.push(peer.id.clone());
            }
        }
        changed
    }

    /// Idempotent by name. The host entry never counts as a match.
    pub fn on_peer_joined(&mut self, name: &str) -> bool {
        if self.peers.iter().any(|p| p.id != HOST_PEER_ID && p.name == name) {
            return false;
        }
        self.next_id += 1;
        self.peers.push(Peer {
            id: format!("peer-{}", self.next_id),
            name: name.to_string(),
            state: ActivityState::Idle,
        });
        true
    }

    pub fn on_peer_left(&mut self, name: &str) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.id == HOST_PEER_ID || p.name != name);
        self.peers.len() != before
    }

    pub fn clear(&mut self) -> bool {
        let had_peers = !self.peers.is_empty();
        self.peers.clear();
        had_peers
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }
}

struct LinkShared {
    roster: Mutex<ClientRoster>,
    connected: AtomicBool,
    events: EventSink,
}

impl LinkShared {
    fn roster(&self) -> MutexGuard<'_, ClientRoster> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_packet(&self, packet: SessionPacket, outbound: &mpsc::Sender<SessionPacket>) {
        trace!("<- {}", packet.type_name());
        match packet {
            SessionPacket::Hello { host_name, .. } => {
                let mut roster = self.roster();
                if roster.on_host_hello(&host_name) {
                    info!("Joined the room of '{}'", host_name);
                    self.events
                        .emit(SessionEvent::RosterChanged(roster.peers().to_vec()));
                }
            }
            SessionPacket::Status {
                state, sender_name, ..
            } => {
                let changed = self.roster().on_status(state, sender_name.as_deref());
                for peer_id in changed {
                    self.events
                        .emit(SessionEvent::StatusChanged { peer_id, state });
                }
            }
            SessionPacket::Ping { .. } => {
                queue(outbound, SessionPacket::pong());
            }
            SessionPacket::Pong { .. } => {}
            SessionPacket::Projectile {
                kind,
                direction,
                sender_name,
                ..
            } => {
                self.events.emit(SessionEvent::ProjectileReceived {
                    kind,
                    direction,
                    sender_name,
                });
            }
            SessionPacket::PeerJoined { peer_name, .. } => {
                let mut roster = self.roster();
                if roster.on_peer_joined(&peer_name) {
                    debug!("Peer '{}' joined", peer_name);
                    self.events
                        .emit(SessionEvent::RosterChanged(roster.peers().to_vec()));
                }
            }
            SessionPacket::PeerLeft { peer_name, .. } => {
                let mut roster = self.roster();
                if roster.on_peer_left(&peer_name) {
                    debug!("Peer '{}' left", peer_name);
                    self.events
                        .emit(SessionEvent::RosterChanged(roster.peers().to_vec()));
                }
            }
        }
    }

    fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        let mut roster = self.roster();
        if roster.clear() {
            self.events.emit(SessionEvent::RosterChanged(Vec::new()));
        }
        self.events
            .emit(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected));
    }
}

/// A running client link.
pub struct Link {
    remote: SocketAddr,
    outbound: mpsc::Sender<SessionPacket>,
    shared: Arc<LinkShared>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Link {
    /// Connect, send `hello`, and start the read loop and heartbeat.
    ///
    /// `host_name_hint` is the name the scanner saw; it only fills the
    /// `hostName` field of our `hello`.
    pub async fn connect(
        local_name: &str,
        remote: SocketAddr,
        host_name_hint: Option<&str>,
        config: &SessionConfig,
        events: EventSink,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        events.emit(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Connecting));
        info!("Connecting to {}", remote);

        let stream = match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(remote))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("Connect to {} failed: {}", remote, e);
                events.emit(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected));
                return Err(SessionError::Connect(format!("{}: {}", remote, e)));
            }
            Err(_) => {
                warn!("Connect to {} timed out", remote);
                events.emit(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected));
                return Err(SessionError::ConnectTimeout(remote));
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let (outbound, rx) = mpsc::channel(config.outbound_queue_depth);
        let hello = SessionPacket::hello(host_name_hint.unwrap_or(HOST_PLACEHOLDER_NAME), local_name);
        outbound
            .try_send(hello)
            .map_err(|e| SessionError::Io(format!("failed to queue hello: {}", e)))?;
        let writer = tokio::spawn(write_loop(write_half, rx));

        let shared = Arc::new(LinkShared {
            roster: Mutex::new(ClientRoster::new()),
            connected: AtomicBool::new(true),
            events,
        });
        shared
            .events
            .emit(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Connected));
        info!("Connected to {}", remote);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_link(
            PacketReader::new(read_half, config.max_line_length),
            writer,
            outbound.clone(),
            shared.clone(),
            LivenessPolicy::from(config),
            remote,
            shutdown_rx,
        ));

        Ok(Self {
            remote,
            outbound,
            shared,
            shutdown_tx,
            task,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn roster(&self) -> Vec<Peer> {
        self.shared.roster().peers().to_vec()
    }

    /// Returns false if the link is down or the packet was dropped.
    pub fn send_status(&self, state: ActivityState) -> bool {
        self.send(SessionPacket::status(state, None))
    }

    pub fn send_projectile(&self, kind: ProjectileKind, direction: ProjectileDirection) -> bool {
        self.send(SessionPacket::projectile(kind, direction, None))
    }

    fn send(&self, packet: SessionPacket) -> bool {
        self.is_connected() && queue(&self.outbound, packet)
    }

    /// Stop the heartbeat and close the socket. No events are emitted.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            debug!("Link task ended abnormally: {}", e);
        }
        info!("Link to {} closed", self.remote);
    }
}

fn queue(outbound: &mpsc::Sender<SessionPacket>, packet: SessionPacket) -> bool {
    match outbound.try_send(packet) {
        Ok(()) => true,
        Err(TrySendError::Full(packet)) => {
            warn!("Outbound queue full, dropping {}", packet.type_name());
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

async fn run_link(
    mut reader: PacketReader<OwnedReadHalf>,
    mut writer: JoinHandle<Result<(), ConnectionError>>,
    outbound: mpsc::Sender<SessionPacket>,
    shared: Arc<LinkShared>,
    policy: LivenessPolicy,
    remote: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut liveness = LivenessMonitor::new(policy, Instant::now());
    let mut heartbeat = policy.ticker();
    let mut writer_done = false;

    let user_stop = loop {
        tokio::select! {
            result = reader.next_packet() => {
                match result {
                    Ok(Some(packet)) => {
                        liveness.record(Instant::now());
                        shared.handle_packet(packet, &outbound);
                    }
                    Ok(None) => {
                        info!("Host {} closed the connection", remote);
                        break false;
                    }
                    Err(e) => {
                        warn!("Read error from host {}: {}", remote, e);
                        break false;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if let Verdict::Dead { idle } = liveness.check(Instant::now()) {
                    warn!("Host {} silent for {:?}, disconnecting", remote, idle);
                    break false;
                }
                queue(&outbound, SessionPacket::ping());
            }
            result = &mut writer, if !writer_done => {
                writer_done = true;
                match result {
                    Ok(Ok(())) => debug!("Writer for {} finished", remote),
                    Ok(Err(e)) => warn!("Write error to host {}: {}", remote, e),
                    Err(e) => warn!("Writer task for {} failed: {}", remote, e),
                }
                break false;
            }
            _ = shutdown.changed() => break true,
        }
    };

    shared.connected.store(false, Ordering::Release);
    if !writer_done {
        writer.abort();
    }
    if !user_stop {
        shared.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_roster_host_entry_first_and_once() {
        let mut roster = ClientRoster::new();
        assert!(roster.on_peer_joined("Bob"));
        assert!(roster.on_host_hello("H"));
        assert!(!roster.on_host_hello("H again"));

        let peers = roster.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].id, HOST_PEER_ID);
        assert_eq!(peers[0].name, "H");
        assert_eq!(peers[1].name, "Bob");
    }

    #[test]
    fn test_roster_join_leave_idempotent() {
        let mut roster = ClientRoster::new();
        assert!(roster.on_peer_joined("X"));
        assert!(!roster.on_peer_joined("X"));
        assert_eq!(roster.peers().len(), 1);

        assert!(roster.on_peer_left("X"));
        assert!(!roster.on_peer_left("X"));
        assert!(roster.peers().is_empty());
    }

    #[test]
    fn test_roster_peer_named_like_host() {
        let mut roster = ClientRoster::new();
        roster.on_host_hello("Ann");

        assert!(roster.on_peer_joined("Ann"));
        assert_eq!(roster.peers().len(), 2);
        let relayed = roster.peers()[1].id.clone();

        assert_eq!(
            roster.on_status(ActivityState::Typing, Some("Ann")),
            vec![relayed]
        );
        assert_eq!(roster.peers()[0].state, ActivityState::Idle);

        assert!(roster.on_peer_left("Ann"));
        assert_eq!(roster.peers().len(), 1);
        assert_eq!(roster.peers()[0].id, HOST_PEER_ID);
        assert!(!roster.on_peer_left("Ann"));
    }

    #[test]
    fn test_roster_status_attribution() {
        let mut roster = ClientRoster::new();
        roster.on_host_hello("H");
        roster.on_peer_joined("Bob");

        assert_eq!(
            roster.on_status(ActivityState::Typing, None),
            vec![HOST_PEER_ID.to_string()]
        );
        let bob_id = roster.peers()[1].id.clone();
        assert_eq!(
            roster.on_status(ActivityState::Offline, Some("Bob")),
            vec![bob_id]
        );
        assert!(roster.on_status(ActivityState::Idle, Some("Nobody")).is_empty());

        assert_eq!(roster.peers()[0].state, ActivityState::Typing);
        assert_eq!(roster.peers()[1].state, ActivityState::Offline);
    }

    #[test]
    fn test_roster_synthetic_ids_unique() {
        let mut roster = ClientRoster::new();
        roster.on_peer_joined("A");
        roster.on_peer_left("A");
        roster.on_peer_joined("A");
        roster.on_peer_joined("B");
        let ids: Vec<_> = roster.peers().iter().map(|p| p.id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
        assert!(ids.iter().all(|id| id != HOST_PEER_ID));
    }

    fn test_config() -> SessionConfig {
        SessionConfig {
            heartbeat_interval_ms: 50,
            liveness_timeout_ms: 200,
            connect_timeout_ms: 1000,
            ..Default::default()
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_sends_hello_first() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut events) = mpsc::unbounded_channel();

        let link = Link::connect("Bob", addr, None, &test_config(), EventSink::new(tx))
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();

        let first = lines.next_line().await.unwrap().unwrap();
        match SessionPacket::decode_line(first.as_bytes()).unwrap() {
            SessionPacket::Hello {
                host_name,
                client_name,
                ..
            } => {
                assert_eq!(host_name, HOST_PLACEHOLDER_NAME);
                assert_eq!(client_name, "Bob");
            }
            other => panic!("expected hello, got {:?}", other),
        }

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::ConnectionStatusChanged(ConnectionStatus::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::ConnectionStatusChanged(ConnectionStatus::Connected)
        );
        assert!(link.is_connected());
        link.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused_reports_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let (tx, mut events) = mpsc::unbounded_channel();

        let result = Link::connect("Bob", addr, None, &test_config(), EventSink::new(tx)).await;
        assert!(matches!(result, Err(SessionError::Connect(_))));
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::ConnectionStatusChanged(ConnectionStatus::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_host_close_clears_roster() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut events) = mpsc::unbounded_channel();

        let link = Link::connect("Bob", addr, Some("H"), &test_config(), EventSink::new(tx))
            .await
            .unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(&SessionPacket::hello("H", HOST_PLACEHOLDER_NAME).encode_line().unwrap())
            .await
            .unwrap();
        stream
            .write_all(&SessionPacket::peer_joined("Ann").encode_line().unwrap())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while link.roster().len() != 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(link.roster()[0].id, HOST_PEER_ID);

        drop(stream);

        let disconnected = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected)) =
                    events.recv().await
                {
                    return;
                }
            }
        })
        .await;
        assert!(disconnected.is_ok());
        assert!(link.roster().is_empty());
        assert!(!link.is_connected());
        assert!(!link.send_status(ActivityState::Typing));
        link.close().await;
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut events) = mpsc::unbounded_channel();

        let link = Link::connect("Bob", addr, None, &test_config(), EventSink::new(tx))
            .await
            .unwrap();
        // Accept and hold the socket without ever writing to it.
        let (_stream, _) = listener.accept().await.unwrap();

        let started = Instant::now();
        let disconnected = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(SessionEvent::ConnectionStatusChanged(ConnectionStatus::Disconnected)) =
                    events.recv().await
                {
                    return;
                }
            }
        })
        .await;
        assert!(disconnected.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(150));
        link.close().await;
    }

    #[tokio::test]
    async fn test_close_emits_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut events) = mpsc::unbounded_channel();

        let link = Link::connect("Bob", addr, None, &test_config(), EventSink::new(tx))
            .await
            .unwrap();
        let (_stream, _) = listener.accept().await.unwrap();
        next_event(&mut events).await;
        next_event(&mut events).await;

        link.close().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_zero_heartbeat() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = SessionConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        let result = Link::connect(
            "Bob",
            listener.local_addr().unwrap(),
            None,
            &config,
            EventSink::new(tx),
        )
        .await;
        assert!(matches!(result, Err(SessionError::Config(_))));
        assert!(rx.try_recv().is_err());
    }
}
