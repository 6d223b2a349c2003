// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The byte transport under the daemon channels.
//!
//! The transport is abstract: anything `AsyncRead + AsyncWrite` (a socket,
//! a file-descriptor pair, an in-memory duplex in tests). Messages are
//! length-prefixed frames (u32 little-endian length, then the payload).
//! Connection setup performs a version exchange; the accepted range is
//! supplied by the caller, since the floor differs per target platform.

use crate::errors::{CompanionError, ProtocolError, TransportError};
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Frames larger than this are rejected rather than buffered.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// The stream types a transport can be built over.
pub trait TransportStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> TransportStream for T {}

/// A length-prefixed packet framing over a byte stream.
///
/// `recv_frame` is cancel-safe: partial reads accumulate in an internal
/// buffer, so dropping an in-flight receive (e.g. when another `select!`
/// branch wins) never loses framing.
pub struct FramedTransport<T> {
    io: T,
    read_buf: BytesMut,
}

impl<T: TransportStream> FramedTransport<T> {
    /// Wraps a stream.
    pub fn new(io: T) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Writes one frame.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: payload.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        self.io
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await
            .map_err(TransportError::Io)?;
        self.io.write_all(payload).await.map_err(TransportError::Io)?;
        self.io.flush().await.map_err(TransportError::Io)?;
        Ok(())
    }

    /// Reads one frame. Returns [`TransportError::Closed`] on EOF at a
    /// frame boundary.
    pub async fn recv_frame(&mut self) -> Result<Bytes, TransportError> {
        loop {
            if self.read_buf.len() >= 4 {
                let length = u32::from_le_bytes(
                    self.read_buf[..4].try_into().expect("four bytes checked"),
                ) as usize;
                if length > MAX_FRAME_SIZE {
                    return Err(TransportError::FrameTooLarge {
                        size: length,
                        limit: MAX_FRAME_SIZE,
                    });
                }
                if self.read_buf.len() >= 4 + length {
                    self.read_buf.advance(4);
                    return Ok(self.read_buf.split_to(length).freeze());
                }
            }
            let read = self
                .io
                .read_buf(&mut self.read_buf)
                .await
                .map_err(TransportError::Io)?;
            if read == 0 {
                return Err(TransportError::Closed);
            }
        }
    }
}

/// The range of daemon protocol versions this client accepts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProtocolVersionRange {
    /// The lowest accepted version.
    pub minimum: u32,
    /// The highest version this client speaks.
    pub maximum: u32,
}

impl ProtocolVersionRange {
    /// A range accepting a single version.
    pub fn exact(version: u32) -> Self {
        Self {
            minimum: version,
            maximum: version,
        }
    }
}

/// The capability announcement sent during the handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientCapabilities {
    /// The highest protocol version the client speaks.
    pub protocol_version: u32,
    /// Feature tags the client understands.
    pub capabilities: Vec<String>,
}

/// The daemon's half of the version exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonHello {
    /// The protocol version the daemon will speak.
    pub protocol_version: u32,
}

/// Performs the version exchange: sends client capabilities, receives the
/// daemon's version.
///
/// Fails with [`ProtocolError::IncompatibleDaemon`] when a version packet
/// arrived but is below the minimum, and [`ProtocolError::HandshakeTimeout`]
/// when no version packet arrived in time.
pub async fn handshake<T: TransportStream>(
    transport: &mut FramedTransport<T>,
    range: ProtocolVersionRange,
    capabilities: Vec<String>,
    timeout: Duration,
) -> Result<u32, CompanionError> {
    let hello = ClientCapabilities {
        protocol_version: range.maximum,
        capabilities,
    };
    let payload = serde_json::to_vec(&hello)
        .map_err(|err| ProtocolError::MalformedMessage(err.to_string()))?;
    transport.send_frame(&payload).await.map_err(CompanionError::from)?;

    let frame = match tokio::time::timeout(timeout, transport.recv_frame()).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(ProtocolError::HandshakeTimeout(timeout).into()),
    };
    let daemon: DaemonHello = serde_json::from_slice(&frame)
        .map_err(|err| ProtocolError::MalformedMessage(format!("bad version packet: {err}")))?;

    if daemon.protocol_version < range.minimum {
        return Err(ProtocolError::IncompatibleDaemon {
            daemon_version: daemon.protocol_version,
            minimum: range.minimum,
        }
        .into());
    }
    debug!(version = daemon.protocol_version, "daemon handshake complete");
    Ok(daemon.protocol_version.min(range.maximum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn frames_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = FramedTransport::new(client);
        let mut server = FramedTransport::new(server);

        client.send_frame(b"hello").await.expect("send");
        client.send_frame(b"").await.expect("send empty");
        assert_eq!(server.recv_frame().await.expect("recv"), "hello");
        assert_eq!(server.recv_frame().await.expect("recv"), "");
    }

    #[tokio::test]
    async fn closed_peer_reports_closed() {
        let (client, server) = tokio::io::duplex(1024);
        let mut server = FramedTransport::new(server);
        drop(client);
        assert!(matches!(
            server.recv_frame().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_reading() {
        let (client, server) = tokio::io::duplex(1024);
        let mut server = FramedTransport::new(server);
        let mut client = client;
        // A length prefix claiming 1 GiB.
        tokio::io::AsyncWriteExt::write_all(&mut client, &(1u32 << 30).to_le_bytes())
            .await
            .expect("write");
        assert!(matches!(
            server.recv_frame().await,
            Err(TransportError::FrameTooLarge { .. })
        ));
    }

    async fn run_daemon(
        server: tokio::io::DuplexStream,
        respond_version: Option<u32>,
    ) {
        let mut server = FramedTransport::new(server);
        let _caps = server.recv_frame().await.expect("client hello");
        if let Some(version) = respond_version {
            let hello = serde_json::to_vec(&DaemonHello {
                protocol_version: version,
            })
            .expect("serialize");
            server.send_frame(&hello).await.expect("send hello");
        }
        // Hold the transport open until the test finishes.
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn handshake_accepts_supported_version() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(run_daemon(server, Some(27)));
        let mut client = FramedTransport::new(client);
        let version = handshake(
            &mut client,
            ProtocolVersionRange {
                minimum: 25,
                maximum: 29,
            },
            vec!["activities".to_owned()],
            Duration::from_secs(1),
        )
        .await
        .expect("handshake");
        assert_eq!(version, 27);
    }

    #[tokio::test]
    async fn handshake_rejects_old_daemon() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(run_daemon(server, Some(8)));
        let mut client = FramedTransport::new(client);
        let err = handshake(
            &mut client,
            ProtocolVersionRange {
                minimum: 25,
                maximum: 29,
            },
            Vec::new(),
            Duration::from_secs(1),
        )
        .await
        .expect_err("too old");
        assert!(matches!(
            err,
            CompanionError::Protocol(ProtocolError::IncompatibleDaemon {
                daemon_version: 8,
                minimum: 25,
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out_without_version_packet() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(run_daemon(server, None));
        let mut client = FramedTransport::new(client);
        let err = handshake(
            &mut client,
            ProtocolVersionRange::exact(29),
            Vec::new(),
            Duration::from_millis(200),
        )
        .await
        .expect_err("no version packet");
        assert!(matches!(
            err,
            CompanionError::Protocol(ProtocolError::HandshakeTimeout(_))
        ));
    }
}
