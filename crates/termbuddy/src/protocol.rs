// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TermBuddy wire protocol.
//!
//! Two packet families share one JSON encoding (UTF-8 object, `type`
//! discriminant, camelCase fields):
//!
//! - [`DiscoveryPacket`]: one object per UDP datagram, no framing.
//! - [`SessionPacket`]: newline-delimited over a persistent TCP stream.
//!
//! Wire format (session):
//! ```text
//! {"type":"status","state":"TYPING","sentAt":1718000000000}\n
//! {"type":"ping","sentAt":1718000000100}\n
//! ```
//!
//! All input is untrusted. Decoding returns a [`ProtocolError`] that callers
//! log and drop; nothing in here may take a reader loop down.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Discriminant carried by every discovery datagram.
pub const DISCOVERY_KIND: &str = "termbuddy_discovery";

/// Protocol version announced and accepted by discovery.
pub const DISCOVERY_VERSION: u32 = 1;

/// Well-known UDP port hosts announce to and scanners bind.
pub const DISCOVERY_PORT: u16 = 41234;

/// Name used in `hello` where the host's real name is unknown: the host's
/// own `clientName`, and a client's `hostName` when no hint was given.
pub const HOST_PLACEHOLDER_NAME: &str = "Host";

/// Default upper bound for a single session line (bytes, without `\n`).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Self-reported presence of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActivityState {
    Typing,
    #[default]
    Idle,
    Offline,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Typing => write!(f, "TYPING"),
            Self::Idle => write!(f, "IDLE"),
            Self::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// What got thrown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectileKind {
    Rose,
    Poop,
    Hammer,
}

impl std::fmt::Display for ProjectileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rose => write!(f, "ROSE"),
            Self::Poop => write!(f, "POOP"),
            Self::Hammer => write!(f, "HAMMER"),
        }
    }
}

/// Which way it flies across the sender's screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectileDirection {
    LeftToRight,
    RightToLeft,
}

impl ProjectileDirection {
    /// The same throw seen from the receiving side.
    pub fn flipped(self) -> Self {
        match self {
            Self::LeftToRight => Self::RightToLeft,
            Self::RightToLeft => Self::LeftToRight,
        }
    }
}

/// Host announcement broadcast over UDP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPacket {
    /// Always [`DISCOVERY_KIND`].
    #[serde(rename = "type")]
    pub kind: String,
    pub version: u32,
    pub host_name: String,
    pub room_name: String,
    pub tcp_port: u16,
    /// Milliseconds since the Unix epoch.
    pub sent_at: u64,
}

impl DiscoveryPacket {
    /// Build a fresh announcement stamped with the current time.
    pub fn new(host_name: &str, room_name: &str, tcp_port: u16) -> Self {
        Self {
            kind: DISCOVERY_KIND.to_string(),
            version: DISCOVERY_VERSION,
            host_name: host_name.to_string(),
            room_name: room_name.to_string(),
            tcp_port,
            sent_at: now_millis(),
        }
    }

    /// Encode as a single datagram payload.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }

    /// Decode and validate a datagram payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let packet: Self = serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        packet.validate()?;
        Ok(packet)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        if self.kind != DISCOVERY_KIND {
            return Err(ProtocolError::UnknownKind(self.kind.clone()));
        }
        if self.version != DISCOVERY_VERSION {
            return Err(ProtocolError::VersionMismatch(self.version));
        }
        if self.host_name.is_empty() || self.room_name.is_empty() {
            return Err(ProtocolError::InvalidField("empty host or room name"));
        }
        if self.tcp_port == 0 {
            return Err(ProtocolError::InvalidField("tcpPort is 0"));
        }
        Ok(())
    }
}

/// Session packets exchanged over the host/client TCP link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionPacket {
    /// First packet on a fresh connection, sent by both sides.
    Hello {
        host_name: String,
        client_name: String,
        sent_at: u64,
    },

    /// Presence update. `sender_name` is stamped by the host when relaying.
    Status {
        state: ActivityState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        sent_at: u64,
    },

    Ping {
        sent_at: u64,
    },

    Pong {
        sent_at: u64,
    },

    /// Ephemeral thrown object, relayed untouched apart from `sender_name`.
    Projectile {
        kind: ProjectileKind,
        direction: ProjectileDirection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        sent_at: u64,
    },

    PeerJoined {
        peer_name: String,
        sent_at: u64,
    },

    PeerLeft {
        peer_name: String,
        sent_at: u64,
    },
}

impl SessionPacket {
    pub fn hello(host_name: &str, client_name: &str) -> Self {
        Self::Hello {
            host_name: host_name.to_string(),
            client_name: client_name.to_string(),
            sent_at: now_millis(),
        }
    }

    pub fn status(state: ActivityState, sender_name: Option<String>) -> Self {
        Self::Status {
            state,
            sender_name,
            sent_at: now_millis(),
        }
    }

    pub fn ping() -> Self {
        Self::Ping {
            sent_at: now_millis(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            sent_at: now_millis(),
        }
    }

    pub fn projectile(
        kind: ProjectileKind,
        direction: ProjectileDirection,
        sender_name: Option<String>,
    ) -> Self {
        Self::Projectile {
            kind,
            direction,
            sender_name,
            sent_at: now_millis(),
        }
    }

    pub fn peer_joined(peer_name: &str) -> Self {
        Self::PeerJoined {
            peer_name: peer_name.to_string(),
            sent_at: now_millis(),
        }
    }

    pub fn peer_left(peer_name: &str) -> Self {
        Self::PeerLeft {
            peer_name: peer_name.to_string(),
            sent_at: now_millis(),
        }
    }

    /// Short name used in logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::Status { .. } => "status",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Projectile { .. } => "projectile",
            Self::PeerJoined { .. } => "peer_joined",
            Self::PeerLeft { .. } => "peer_left",
        }
    }

    /// Copy of this packet with `sender_name` replaced (status/projectile only).
    pub fn with_sender(&self, name: &str) -> Self {
        let mut out = self.clone();
        match &mut out {
            Self::Status { sender_name, .. } | Self::Projectile { sender_name, .. } => {
                *sender_name = Some(name.to_string());
            }
            _ => {}
        }
        out
    }

    /// Encode as one line, trailing `\n` included.
    pub fn encode_line(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut line =
            serde_json::to_vec(self).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Decode one line (without its `\n`). Surrounding whitespace is ignored.
    pub fn decode_line(line: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(line)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?
            .trim();
        if text.is_empty() {
            return Err(ProtocolError::EmptyLine);
        }
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }
}

/// Splits a byte stream into `\n`-terminated lines.
///
/// Bytes after the last newline stay buffered until more data arrives. A
/// fragment that grows past `max_line` without a newline is thrown away along
/// with everything up to the next newline.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            max_line,
            discarding: false,
        }
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete line, if any.
    ///
    /// Returns `Err(LineTooLong)` once per oversized fragment; the caller
    /// should log it and keep polling.
    pub fn next_line(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            match self.buffer.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    let mut line: Vec<u8> = self.buffer.drain(..=idx).collect();
                    line.pop();
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if line.len() > self.max_line {
                        return Err(ProtocolError::LineTooLong(line.len()));
                    }
                    return Ok(Some(line));
                }
                None => {
                    if self.buffer.len() > self.max_line {
                        let dropped = self.buffer.len();
                        self.buffer.clear();
                        if !self.discarding {
                            self.discarding = true;
                            return Err(ProtocolError::LineTooLong(dropped));
                        }
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Bytes currently waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

/// Milliseconds since the Unix epoch (0 if the clock is before 1970).
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    Serialize(String),
    InvalidJson(String),
    UnknownKind(String),
    VersionMismatch(u32),
    InvalidField(&'static str),
    EmptyLine,
    LineTooLong(usize),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialize(s) => write!(f, "Serialize error: {}", s),
            Self::InvalidJson(s) => write!(f, "Invalid JSON: {}", s),
            Self::UnknownKind(k) => write!(f, "Unknown packet kind: {}", k),
            Self::VersionMismatch(v) => write!(
                f,
                "Protocol version mismatch: got {}, expected {}",
                v, DISCOVERY_VERSION
            ),
            Self::InvalidField(s) => write!(f, "Invalid field: {}", s),
            Self::EmptyLine => write!(f, "Empty line"),
            Self::LineTooLong(n) => write!(f, "Line too long: {} bytes", n),
        }
    }
}

impl std::error::Error for ProtocolError {}
