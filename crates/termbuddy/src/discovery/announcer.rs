// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host-side room announcer.

use super::interfaces::broadcast_targets;
use super::DiscoveryError;
use crate::protocol::DiscoveryPacket;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

/// What to announce and where.
#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    pub host_name: String,
    pub room_name: String,
    /// The host's bound TCP port.
    pub tcp_port: u16,
    /// Destination UDP port on every target.
    pub discovery_port: u16,
    pub interval: Duration,
    /// Explicit targets; `None` enumerates the local interfaces.
    pub targets: Option<Vec<Ipv4Addr>>,
}

/// Periodically broadcasts a [`DiscoveryPacket`] for one room.
pub struct Announcer {
    targets: Vec<Ipv4Addr>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Announcer {
    /// Bind a broadcast-enabled UDP socket and start announcing.
    ///
    /// The first announcement goes out immediately. A zero interval is
    /// rejected.
    pub async fn start(config: AnnouncerConfig) -> Result<Self, DiscoveryError> {
        if config.interval.is_zero() {
            return Err(DiscoveryError::InvalidConfig(
                "announce interval cannot be 0".into(),
            ));
        }
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
            .await
            .map_err(|e| DiscoveryError::Bind(e.to_string()))?;
        socket
            .set_broadcast(true)
            .map_err(|e| DiscoveryError::SocketOption(e.to_string()))?;

        let targets = config.targets.clone().unwrap_or_else(broadcast_targets);
        info!(
            "Announcing room '{}' (tcp port {}) to {} target(s) every {:?}",
            config.room_name,
            config.tcp_port,
            targets.len(),
            config.interval
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(announce_loop(socket, config, targets.clone(), shutdown_rx));

        Ok(Self {
            targets,
            shutdown_tx,
            task,
        })
    }

    /// Addresses every announcement is sent to.
    pub fn targets(&self) -> &[Ipv4Addr] {
        &self.targets
    }

    /// Stop announcing and close the socket. No goodbye is sent.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            debug!("Announcer task ended abnormally: {}", e);
        }
    }
}

async fn announce_loop(
    socket: UdpSocket,
    config: AnnouncerConfig,
    targets: Vec<Ipv4Addr>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                announce_once(&socket, &config, &targets).await;
            }
            _ = shutdown.changed() => break,
        }
    }

    debug!("Announcer stopped");
}

/// Send one fresh packet to every target. Returns how many sends succeeded.
async fn announce_once(socket: &UdpSocket, config: &AnnouncerConfig, targets: &[Ipv4Addr]) -> usize {
    let packet = DiscoveryPacket::new(&config.host_name, &config.room_name, config.tcp_port);
    let payload = match packet.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Failed to encode discovery packet: {}", e);
            return 0;
        }
    };

    let mut sent = 0;
    for target in targets {
        let dest = SocketAddr::from((*target, config.discovery_port));
        match socket.send_to(&payload, dest).await {
            Ok(_) => sent += 1,
            // Unroutable broadcast targets are common (no default route,
            // container networking); keep going.
            Err(e) => trace!("Announce to {} failed: {}", dest, e),
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DISCOVERY_KIND;

    #[tokio::test]
    async fn test_announcer_sends_to_explicit_target() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let announcer = Announcer::start(AnnouncerConfig {
            host_name: "H".into(),
            room_name: "H's Room".into(),
            tcp_port: 9000,
            discovery_port: port,
            interval: Duration::from_millis(50),
            targets: Some(vec![Ipv4Addr::LOCALHOST]),
        })
        .await
        .unwrap();
        assert_eq!(announcer.targets(), &[Ipv4Addr::LOCALHOST]);

        let mut buf = [0u8; 2048];
        for _ in 0..2 {
            let (n, _) = tokio::time::timeout(Duration::from_secs(2), receiver.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            let packet = DiscoveryPacket::decode(&buf[..n]).unwrap();
            assert_eq!(packet.kind, DISCOVERY_KIND);
            assert_eq!(packet.host_name, "H");
            assert_eq!(packet.tcp_port, 9000);
        }

        announcer.stop().await;
    }

    #[tokio::test]
    async fn test_announcer_stops_sending() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let announcer = Announcer::start(AnnouncerConfig {
            host_name: "H".into(),
            room_name: "Room".into(),
            tcp_port: 9000,
            discovery_port: port,
            interval: Duration::from_millis(20),
            targets: Some(vec![Ipv4Addr::LOCALHOST]),
        })
        .await
        .unwrap();
        announcer.stop().await;

        // Drain whatever was in flight before the stop.
        let mut buf = [0u8; 2048];
        while tokio::time::timeout(Duration::from_millis(100), receiver.recv_from(&mut buf))
            .await
            .is_ok()
        {}

        let late = tokio::time::timeout(Duration::from_millis(200), receiver.recv_from(&mut buf)).await;
        assert!(late.is_err());
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let result = Announcer::start(AnnouncerConfig {
            host_name: "H".into(),
            room_name: "Room".into(),
            tcp_port: 9000,
            discovery_port: 41234,
            interval: Duration::ZERO,
            targets: Some(vec![Ipv4Addr::LOCALHOST]),
        })
        .await;
        assert!(matches!(result, Err(DiscoveryError::InvalidConfig(_))));
    }
}
