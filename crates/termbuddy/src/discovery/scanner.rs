// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side room scanner.

use super::DiscoveryError;
use crate::config::SessionConfig;
use crate::protocol::DiscoveryPacket;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// A host seen on the LAN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredRoom {
    /// Datagram source address; identity, together with `tcp_port`.
    pub ip: IpAddr,
    /// Display only, as claimed by the packet.
    pub host_name: String,
    /// Display only, as claimed by the packet.
    pub room_name: String,
    pub tcp_port: u16,
    pub last_seen_at: Instant,
}

impl DiscoveredRoom {
    /// Where to connect.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }
}

/// Last-write-wins room set keyed by `ip:tcpPort`, pruned by age.
#[derive(Debug)]
pub struct RoomTable {
    rooms: HashMap<SocketAddr, DiscoveredRoom>,
    stale_after: Duration,
}

impl RoomTable {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            stale_after,
        }
    }

    /// Insert or supersede the room for `ip:packet.tcp_port`.
    ///
    /// Returns `true` if the key was not present before.
    pub fn upsert(&mut self, ip: IpAddr, packet: &DiscoveryPacket, now: Instant) -> bool {
        let room = DiscoveredRoom {
            ip,
            host_name: packet.host_name.clone(),
            room_name: packet.room_name.clone(),
            tcp_port: packet.tcp_port,
            last_seen_at: now,
        };
        self.rooms.insert(room.addr(), room).is_none()
    }

    /// Drop every room older than the staleness threshold; returns them.
    pub fn prune(&mut self, now: Instant) -> Vec<DiscoveredRoom> {
        let stale: Vec<SocketAddr> = self
            .rooms
            .iter()
            .filter(|(_, room)| now.saturating_duration_since(room.last_seen_at) > self.stale_after)
            .map(|(key, _)| *key)
            .collect();

        stale
            .into_iter()
            .filter_map(|key| self.rooms.remove(&key))
            .collect()
    }

    /// Rooms, most recently seen first.
    pub fn snapshot(&self) -> Vec<DiscoveredRoom> {
        let mut rooms: Vec<DiscoveredRoom> = self.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.addr().cmp(&b.addr()))
        });
        rooms
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// Scanner socket and timing.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub bind_address: Ipv4Addr,
    pub port: u16,
    pub prune_interval: Duration,
    pub stale_after: Duration,
}

impl From<&SessionConfig> for ScannerConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            bind_address: Ipv4Addr::UNSPECIFIED,
            port: config.discovery_port,
            prune_interval: config.prune_interval(),
            stale_after: config.stale_after(),
        }
    }
}

/// Listens for announcements and keeps a fresh room list.
pub struct Scanner {
    local_addr: SocketAddr,
    updates: watch::Receiver<Vec<DiscoveredRoom>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scanner {
    /// Bind the discovery port and start listening.
    ///
    /// The socket is bound with address (and, on unix, port) reuse so
    /// several scanners on one machine can share the well-known port.
    pub async fn start(config: ScannerConfig) -> Result<Self, DiscoveryError> {
        if config.prune_interval.is_zero() {
            return Err(DiscoveryError::InvalidConfig(
                "prune interval cannot be 0".into(),
            ));
        }
        let socket = bind_shared_udp(SocketAddr::from((config.bind_address, config.port)))?;
        let local_addr = socket.local_addr()?;
        info!("Scanning for rooms on {}", local_addr);

        let (updates_tx, updates) = watch::channel(Vec::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(scan_loop(socket, config, updates_tx, shutdown_rx));

        Ok(Self {
            local_addr,
            updates,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Current rooms, most recently seen first.
    pub fn rooms(&self) -> Vec<DiscoveredRoom> {
        self.updates.borrow().clone()
    }

    /// Change feed: a new snapshot on every upsert or prune removal.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DiscoveredRoom>> {
        self.updates.clone()
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            debug!("Scanner task ended abnormally: {}", e);
        }
    }
}

fn bind_shared_udp(addr: SocketAddr) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DiscoveryError::Bind(e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| DiscoveryError::SocketOption(e.to_string()))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| DiscoveryError::SocketOption(e.to_string()))?;
    socket
        .set_broadcast(true)
        .map_err(|e| DiscoveryError::SocketOption(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| DiscoveryError::SocketOption(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| DiscoveryError::Bind(format!("{}: {}", addr, e)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(|e| DiscoveryError::Io(e.to_string()))
}

async fn scan_loop(
    socket: UdpSocket,
    config: ScannerConfig,
    updates: watch::Sender<Vec<DiscoveredRoom>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut table = RoomTable::new(config.stale_after);
    let mut prune = tokio::time::interval(config.prune_interval);
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, src)) => match DiscoveryPacket::decode(&buf[..n]) {
                        Ok(packet) => {
                            if table.upsert(src.ip(), &packet, Instant::now()) {
                                info!(
                                    "Discovered room '{}' hosted by {} at {}:{}",
                                    packet.room_name, packet.host_name, src.ip(), packet.tcp_port
                                );
                            }
                            updates.send_replace(table.snapshot());
                        }
                        Err(e) => debug!("Ignoring datagram from {}: {}", src, e),
                    },
                    Err(e) => debug!("Discovery receive error: {}", e),
                }
            }
            _ = prune.tick() => {
                let removed = table.prune(Instant::now());
                if !removed.is_empty() {
                    for room in &removed {
                        info!("Room '{}' at {} went stale", room.room_name, room.addr());
                    }
                    updates.send_replace(table.snapshot());
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("Scanner stopped");
}
