// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Host-side peer registry.
//!
//! Each accepted socket gets a [`PeerConnection`] that starts out
//! `Connecting` and becomes `Active` on its `hello`. Only active peers take
//! part in broadcasts and the roster. The registry is the single shared
//! datum of the host; callers hold its lock across a mutation and the
//! broadcast it triggers.

use super::liveness::{LivenessMonitor, LivenessPolicy};
use super::Peer;
use crate::protocol::{ActivityState, SessionPacket};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Display name of a peer whose `hello` has not arrived yet.
pub const CONNECTING_NAME: &str = "Connecting...";

/// Host-assigned, unique for the lifetime of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// Accepted, identity unknown.
    Connecting,
    /// Identity known, participates in broadcasts.
    Active,
}

/// One accepted socket.
#[derive(Debug)]
pub struct PeerConnection {
    id: PeerId,
    addr: SocketAddr,
    display_name: Option<String>,
    state: ActivityState,
    liveness: LivenessMonitor,
    outbound: mpsc::Sender<SessionPacket>,
}

impl PeerConnection {
    pub fn new(
        id: PeerId,
        addr: SocketAddr,
        outbound: mpsc::Sender<SessionPacket>,
        policy: LivenessPolicy,
        now: Instant,
    ) -> Self {
        Self {
            id,
            addr,
            display_name: None,
            state: ActivityState::Idle,
            liveness: LivenessMonitor::new(policy, now),
            outbound,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn phase(&self) -> PeerPhase {
        if self.display_name.is_some() {
            PeerPhase::Active
        } else {
            PeerPhase::Connecting
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase() == PeerPhase::Active
    }

    /// The name from `hello`, or the connecting placeholder.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(CONNECTING_NAME)
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    /// Queue a packet for this peer without waiting.
    ///
    /// A full queue drops the packet; returns whether it was queued.
    pub fn send(&self, packet: SessionPacket) -> bool {
        match self.outbound.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                warn!(
                    "Outbound queue full for {} ({}), dropping {}",
                    self.id,
                    self.addr,
                    packet.type_name()
                );
                false
            }
            Err(TrySendError::Closed(packet)) => {
                debug!("Writer for {} gone, dropping {}", self.id, packet.type_name());
                false
            }
        }
    }

    /// Roster projection.
    pub fn peer(&self) -> Peer {
        Peer {
            id: self.id.to_string(),
            name: self.display_name().to_string(),
            state: self.state,
        }
    }
}

/// All sockets currently accepted by the host.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerConnection>,
    next_id: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> PeerId {
        self.next_id += 1;
        PeerId(self.next_id)
    }

    pub fn insert(&mut self, peer: PeerConnection) {
        self.peers.insert(peer.id, peer);
    }

    pub fn remove(&mut self, id: PeerId) -> Option<PeerConnection> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerConnection> {
        self.peers.get(&id)
    }

    /// Mark a peer active under `name`.
    ///
    /// Returns the names of the other active peers, for replay to the new
    /// one, or `None` if the peer is unknown or already active.
    pub fn activate(&mut self, id: PeerId, name: &str) -> Option<Vec<String>> {
        match self.peers.get_mut(&id) {
            Some(peer) if !peer.is_active() => peer.display_name = Some(name.to_string()),
            _ => return None,
        }
        Some(
            self.peers
                .values()
                .filter(|p| p.id != id && p.is_active())
                .map(|p| p.display_name().to_string())
                .collect(),
        )
    }

    /// Refresh liveness; returns false if the peer is gone.
    pub fn touch(&mut self, id: PeerId, now: Instant) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.liveness.record(now);
                true
            }
            None => false,
        }
    }

    pub fn set_state(&mut self, id: PeerId, state: ActivityState) -> bool {
        match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.state = state;
                true
            }
            None => false,
        }
    }

    /// Queue a packet for one peer, whatever its phase.
    pub fn send_to(&self, id: PeerId, packet: SessionPacket) -> bool {
        self.peers
            .get(&id)
            .map(|peer| peer.send(packet))
            .unwrap_or(false)
    }

    /// Queue a packet for every active peer except `exclude`.
    ///
    /// Returns how many peers it was queued for.
    pub fn broadcast(&self, packet: &SessionPacket, exclude: Option<PeerId>) -> usize {
        let mut sent = 0;
        for peer in self.peers.values() {
            if !peer.is_active() || exclude == Some(peer.id) {
                continue;
            }
            if peer.send(packet.clone()) {
                sent += 1;
            }
        }
        sent
    }

    /// Active peers in accept order.
    pub fn roster(&self) -> Vec<Peer> {
        self.peers
            .values()
            .filter(|p| p.is_active())
            .map(PeerConnection::peer)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
