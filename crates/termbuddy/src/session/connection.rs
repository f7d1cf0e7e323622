// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Line-framed packet I/O on one TCP connection.
//!
//! Reads go through [`PacketReader`], which never fails on bad input: blank,
//! malformed or oversized lines are logged and skipped. Writes go through a
//! bounded queue drained by [`write_loop`], so a stalled socket only ever
//! blocks its own writer task.

use crate::protocol::{LineFramer, ProtocolError, SessionPacket};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

/// Decodes session packets from a byte stream.
pub struct PacketReader<R> {
    reader: R,
    framer: LineFramer,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(reader: R, max_line: usize) -> Self {
        Self {
            reader,
            framer: LineFramer::new(max_line),
            chunk: vec![0u8; READ_CHUNK],
        }
    }

    /// Next well-formed packet.
    ///
    /// Returns `Ok(None)` once the remote side closes the connection.
    /// Cancel-safe: buffered bytes survive a dropped future.
    pub async fn next_packet(&mut self) -> Result<Option<SessionPacket>, ConnectionError> {
        loop {
            if let Some(packet) = self.next_buffered() {
                return Ok(Some(packet));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                return Ok(None);
            }
            self.framer.push(&self.chunk[..n]);
        }
    }

    fn next_buffered(&mut self) -> Option<SessionPacket> {
        loop {
            let line = match self.framer.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    debug!("Discarding input: {}", e);
                    continue;
                }
            };
            match SessionPacket::decode_line(&line) {
                Ok(packet) => return Some(packet),
                Err(ProtocolError::EmptyLine) => continue,
                Err(e) => debug!("Dropping malformed packet: {}", e),
            }
        }
    }
}

/// Encode and write one packet, flushing afterwards.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &SessionPacket,
) -> Result<(), ConnectionError> {
    let line = packet.encode_line()?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Drain `rx` onto `writer` until the queue closes or a write fails.
///
/// The write half is shut down on exit.
pub async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<SessionPacket>,
) -> Result<(), ConnectionError> {
    let result = async {
        while let Some(packet) = rx.recv().await {
            trace!("-> {}", packet.type_name());
            write_packet(&mut writer, &packet).await?;
        }
        Ok::<(), ConnectionError>(())
    }
    .await;

    let _ = writer.shutdown().await;
    result
}

/// Connection error types.
#[derive(Debug)]
pub enum ConnectionError {
    Io(String),
    Protocol(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(s) => write!(f, "I/O error: {}", s),
            Self::Protocol(s) => write!(f, "Protocol error: {}", s),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
