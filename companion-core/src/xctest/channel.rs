// Copyright (c) The ios-companion Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Channel multiplexing over the daemon transport.
//!
//! One [`ChannelMultiplexer`] owns the framed transport and carries any
//! number of logical channels: in practice a "bundle channel" to the test
//! runner and a "daemon channel" to the target daemon. Messages are
//! RPC-shaped (correlation identifier, method, payload); replies are routed
//! back to the caller by identifier, events are delivered per-channel in
//! FIFO order. Ordering across channels is not guaranteed.
//!
//! Channel lifecycle:
//!
//! ```text
//! NEW ──open──▶ HANDSHAKING ──version-ok──▶ READY
//! HANDSHAKING ──version-bad──▶ FAILED(IncompatibleDaemon)
//! READY ──send/recv──▶ READY
//! READY ──peer-fin──▶ CLOSING ──drain──▶ CLOSED
//! READY ──transport-error──▶ FAILED(Transport)
//! any ──cancel──▶ CANCELLED
//! ```
//!
//! The version half of the handshake happens once per transport (see
//! [`connect`](ChannelMultiplexer::connect)); opening a channel afterwards
//! is an in-band announcement.

use crate::{
    errors::{CompanionError, FutureResult, ProtocolError, TransportError},
    fut::{Deferred, Resolver},
    logger::Logger,
    xctest::transport::{
        FramedTransport, ProtocolVersionRange, TransportStream, handshake,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Which endpoint a channel talks to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    /// The test-runner process.
    Bundle,
    /// The target daemon.
    Daemon,
}

/// The lifecycle state of one channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    /// Created but not yet announced to the peer.
    New,
    /// The transport version exchange is in flight.
    Handshaking,
    /// Open for sends and receives.
    Ready,
    /// A fin has been exchanged; draining.
    Closing,
    /// Drained and closed.
    Closed,
    /// The transport failed or the daemon was incompatible.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// The message role within a channel.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RpcKind {
    /// Expects a correlated reply.
    Request,
    /// Correlated to an earlier request.
    Reply,
    /// Fire-and-forget.
    Event,
}

/// One RPC-style message on a channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcMessage {
    /// The correlation identifier. Unique per in-flight request.
    pub identifier: u32,
    /// The method name.
    pub method: String,
    /// The method payload.
    pub payload: Value,
    /// The message role.
    pub kind: RpcKind,
}

/// The method name announcing a new channel.
const METHOD_CHANNEL_OPEN: &str = "_channel.open";
/// The method name half-closing a channel.
const METHOD_CHANNEL_FIN: &str = "_channel.fin";

#[derive(Serialize, Deserialize)]
struct Envelope {
    channel: u32,
    message: RpcMessage,
}

/// The pieces of a freshly-opened channel handed back by the mux task; the
/// public handle is assembled by [`ChannelMultiplexer::open_channel`].
#[derive(Clone)]
struct OpenedChannel {
    id: u32,
    events: std::sync::Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RpcMessage>>>,
    state_rx: watch::Receiver<ChannelState>,
}

enum MuxCommand {
    Open {
        kind: ChannelKind,
        done: Resolver<OpenedChannel>,
    },
    Send {
        channel: u32,
        message: RpcMessage,
        reply: Option<Resolver<Value>>,
    },
    Close {
        channel: u32,
        cancelled: bool,
        done: Resolver<()>,
    },
    Shutdown {
        done: Resolver<()>,
    },
}

struct ChannelEntry {
    state_tx: watch::Sender<ChannelState>,
    events_tx: Option<mpsc::UnboundedSender<RpcMessage>>,
    pending: HashMap<u32, Resolver<Value>>,
}

impl ChannelEntry {
    fn set_state(&self, state: ChannelState) {
        let _ = self.state_tx.send(state);
    }

    fn fail(&mut self, error: &str) {
        self.set_state(ChannelState::Failed);
        self.events_tx = None;
        for (_, resolver) in self.pending.drain() {
            resolver.reject(CompanionError::Transport(TransportError::Io(
                std::io::Error::other(error.to_owned()),
            )));
        }
    }
}

/// A handle to one logical channel.
#[derive(Clone)]
pub struct DtxChannel {
    id: u32,
    kind: ChannelKind,
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
    events: std::sync::Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<RpcMessage>>>,
    state_rx: watch::Receiver<ChannelState>,
    next_correlation: std::sync::Arc<std::sync::atomic::AtomicU32>,
}

impl DtxChannel {
    /// The channel's endpoint kind.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// The channel's current state.
    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    /// Sends a request and awaits the correlated reply.
    pub async fn call(&self, method: &str, payload: Value) -> FutureResult<Value> {
        self.require_ready()
            .map_err(crate::errors::FutureError::rejected)?;
        let identifier = self
            .next_correlation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (resolver, reply) = Deferred::new();
        let message = RpcMessage {
            identifier,
            method: method.to_owned(),
            payload,
            kind: RpcKind::Request,
        };
        self.cmd_tx
            .send(MuxCommand::Send {
                channel: self.id,
                message,
                reply: Some(resolver),
            })
            .map_err(|_| {
                crate::errors::FutureError::rejected(TransportError::MultiplexerGone)
            })?;
        reply.value().await
    }

    /// Sends a fire-and-forget event.
    pub fn notify(&self, method: &str, payload: Value) -> Result<(), CompanionError> {
        self.require_ready()?;
        let identifier = self
            .next_correlation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.cmd_tx
            .send(MuxCommand::Send {
                channel: self.id,
                message: RpcMessage {
                    identifier,
                    method: method.to_owned(),
                    payload,
                    kind: RpcKind::Event,
                },
                reply: None,
            })
            .map_err(|_| TransportError::MultiplexerGone.into())
    }

    /// Receives the next inbound event on this channel, in FIFO order.
    /// Returns `None` once the channel is drained and closed.
    pub async fn next_event(&self) -> Option<RpcMessage> {
        self.events.lock().await.recv().await
    }

    /// Closes the channel: sends a fin and drains.
    pub async fn close(&self) {
        let (done, closed) = Deferred::new();
        if self
            .cmd_tx
            .send(MuxCommand::Close {
                channel: self.id,
                cancelled: false,
                done,
            })
            .is_ok()
        {
            let _ = closed.value().await;
        }
    }

    /// Cancels the channel without the fin exchange.
    pub async fn cancel(&self) {
        let (done, cancelled) = Deferred::new();
        if self
            .cmd_tx
            .send(MuxCommand::Close {
                channel: self.id,
                cancelled: true,
                done,
            })
            .is_ok()
        {
            let _ = cancelled.value().await;
        }
    }

    fn require_ready(&self) -> Result<(), CompanionError> {
        let state = self.state();
        if state == ChannelState::Ready {
            Ok(())
        } else {
            Err(ProtocolError::ChannelNotReady {
                state: state.to_string(),
            }
            .into())
        }
    }
}

impl std::fmt::Debug for DtxChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtxChannel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

/// Owns the transport and routes messages between channels.
pub struct ChannelMultiplexer {
    cmd_tx: mpsc::UnboundedSender<MuxCommand>,
    daemon_version: u32,
    task: tokio::task::JoinHandle<()>,
}

impl ChannelMultiplexer {
    /// Performs the transport version exchange and starts the multiplexer.
    pub async fn connect<T: TransportStream>(
        stream: T,
        range: ProtocolVersionRange,
        capabilities: Vec<String>,
        handshake_timeout: Duration,
        logger: Logger,
    ) -> Result<Self, CompanionError> {
        let mut transport = FramedTransport::new(stream);
        let daemon_version =
            handshake(&mut transport, range, capabilities, handshake_timeout).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(mux_loop(transport, cmd_rx, logger.named("mux")));
        Ok(Self {
            cmd_tx,
            daemon_version,
            task,
        })
    }

    /// The protocol version negotiated with the daemon.
    pub fn daemon_version(&self) -> u32 {
        self.daemon_version
    }

    /// Opens a logical channel.
    pub async fn open_channel(&self, kind: ChannelKind) -> Result<DtxChannel, CompanionError> {
        let (done, opened) = Deferred::new();
        self.cmd_tx
            .send(MuxCommand::Open { kind, done })
            .map_err(|_| CompanionError::from(TransportError::MultiplexerGone))?;
        let parts = opened
            .value()
            .await
            .map_err(|err| CompanionError::Precondition(err.to_string()))?;
        Ok(DtxChannel {
            id: parts.id,
            kind,
            cmd_tx: self.cmd_tx.clone(),
            events: parts.events,
            state_rx: parts.state_rx,
            next_correlation: std::sync::Arc::new(std::sync::atomic::AtomicU32::new(1)),
        })
    }

    /// Closes every channel in reverse open order and stops the
    /// multiplexer.
    pub async fn shutdown(self) {
        let (done, finished) = Deferred::new();
        if self.cmd_tx.send(MuxCommand::Shutdown { done }).is_ok() {
            let _ = finished.value().await;
        }
        self.task.abort();
    }
}

async fn mux_loop<T: TransportStream>(
    mut transport: FramedTransport<T>,
    mut cmd_rx: mpsc::UnboundedReceiver<MuxCommand>,
    logger: Logger,
) {
    let mut channels: HashMap<u32, ChannelEntry> = HashMap::new();
    let mut open_order: Vec<u32> = Vec::new();
    let mut next_channel_id: u32 = 1;

    loop {
        tokio::select! {
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    MuxCommand::Open { kind, done } => {
                        let id = next_channel_id;
                        next_channel_id += 1;
                        let (state_tx, state_rx) = watch::channel(ChannelState::Ready);
                        let (events_tx, events_rx) = mpsc::unbounded_channel();
                        channels.insert(id, ChannelEntry {
                            state_tx,
                            events_tx: Some(events_tx),
                            pending: HashMap::new(),
                        });
                        open_order.push(id);
                        let announce = Envelope {
                            channel: id,
                            message: RpcMessage {
                                identifier: 0,
                                method: METHOD_CHANNEL_OPEN.to_owned(),
                                payload: serde_json::json!({ "kind": kind }),
                                kind: RpcKind::Event,
                            },
                        };
                        if let Err(err) = send_envelope(&mut transport, &announce).await {
                            fail_all(&mut channels, &err.to_string());
                            done.reject(CompanionError::from(err));
                            break;
                        }
                        logger.debug(format!("opened {kind:?} channel {id}"));
                        done.resolve(OpenedChannel {
                            id,
                            events: std::sync::Arc::new(tokio::sync::Mutex::new(events_rx)),
                            state_rx,
                        });
                    }
                    MuxCommand::Send { channel, message, reply } => {
                        let Some(entry) = channels.get_mut(&channel) else {
                            if let Some(reply) = reply {
                                reply.reject(CompanionError::NotFound(format!(
                                    "channel {channel}"
                                )));
                            }
                            continue;
                        };
                        if let Some(reply) = reply {
                            entry.pending.insert(message.identifier, reply);
                        }
                        let envelope = Envelope { channel, message };
                        if let Err(err) = send_envelope(&mut transport, &envelope).await {
                            fail_all(&mut channels, &err.to_string());
                            break;
                        }
                    }
                    MuxCommand::Close { channel, cancelled, done } => {
                        if let Some(entry) = channels.get_mut(&channel) {
                            if cancelled {
                                entry.set_state(ChannelState::Cancelled);
                                for (_, resolver) in entry.pending.drain() {
                                    resolver.complete(Err(
                                        crate::errors::FutureError::Cancelled,
                                    ));
                                }
                            } else {
                                entry.set_state(ChannelState::Closing);
                                let fin = Envelope {
                                    channel,
                                    message: RpcMessage {
                                        identifier: 0,
                                        method: METHOD_CHANNEL_FIN.to_owned(),
                                        payload: Value::Null,
                                        kind: RpcKind::Event,
                                    },
                                };
                                if let Err(err) = send_envelope(&mut transport, &fin).await {
                                    fail_all(&mut channels, &err.to_string());
                                    done.resolve(());
                                    break;
                                }
                                entry.set_state(ChannelState::Closed);
                            }
                            entry.events_tx = None;
                        }
                        done.resolve(());
                    }
                    MuxCommand::Shutdown { done } => {
                        // Reverse open order: the most recently opened
                        // channel closes first.
                        for id in open_order.iter().rev() {
                            if let Some(entry) = channels.get_mut(id) {
                                if *entry.state_tx.borrow() == ChannelState::Ready {
                                    entry.set_state(ChannelState::Closing);
                                    let fin = Envelope {
                                        channel: *id,
                                        message: RpcMessage {
                                            identifier: 0,
                                            method: METHOD_CHANNEL_FIN.to_owned(),
                                            payload: Value::Null,
                                            kind: RpcKind::Event,
                                        },
                                    };
                                    let _ = send_envelope(&mut transport, &fin).await;
                                    entry.set_state(ChannelState::Closed);
                                }
                                entry.events_tx = None;
                            }
                        }
                        done.resolve(());
                        break;
                    }
                }
            }
            frame = transport.recv_frame() => {
                match frame {
                    Ok(frame) => {
                        let envelope: Envelope = match serde_json::from_slice(&frame) {
                            Ok(envelope) => envelope,
                            Err(err) => {
                                warn!("dropping malformed envelope: {err}");
                                continue;
                            }
                        };
                        route_inbound(&mut channels, envelope);
                    }
                    Err(err) => {
                        debug!("transport error: {err}");
                        fail_all(&mut channels, &err.to_string());
                        break;
                    }
                }
            }
        }
    }
}

fn route_inbound(channels: &mut HashMap<u32, ChannelEntry>, envelope: Envelope) {
    let Some(entry) = channels.get_mut(&envelope.channel) else {
        warn!(channel = envelope.channel, "message for unknown channel");
        return;
    };
    let message = envelope.message;
    if message.method == METHOD_CHANNEL_FIN {
        entry.set_state(ChannelState::Closing);
        entry.events_tx = None;
        entry.set_state(ChannelState::Closed);
        return;
    }
    match message.kind {
        RpcKind::Reply => match entry.pending.remove(&message.identifier) {
            Some(resolver) => {
                resolver.resolve(message.payload);
            }
            None => {
                warn!(
                    identifier = message.identifier,
                    "reply for unknown correlation identifier"
                );
            }
        },
        RpcKind::Request | RpcKind::Event => {
            if let Some(events_tx) = &entry.events_tx {
                let _ = events_tx.send(message);
            }
        }
    }
}

fn fail_all(channels: &mut HashMap<u32, ChannelEntry>, error: &str) {
    for entry in channels.values_mut() {
        entry.fail(error);
    }
}

async fn send_envelope<T: TransportStream>(
    transport: &mut FramedTransport<T>,
    envelope: &Envelope,
) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|err| TransportError::Io(std::io::Error::other(err)))?;
    transport.send_frame(&payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xctest::transport::DaemonHello;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// A scripted daemon: answers the version handshake, echoes a reply
    /// for every request, and can inject events.
    struct FakeDaemon {
        transport: FramedTransport<tokio::io::DuplexStream>,
    }

    impl FakeDaemon {
        async fn accept(stream: tokio::io::DuplexStream, version: u32) -> Self {
            let mut transport = FramedTransport::new(stream);
            let _caps = transport.recv_frame().await.expect("client hello");
            let hello =
                serde_json::to_vec(&DaemonHello { protocol_version: version }).expect("hello");
            transport.send_frame(&hello).await.expect("send hello");
            Self { transport }
        }

        async fn recv(&mut self) -> Envelope {
            let frame = self.transport.recv_frame().await.expect("frame");
            serde_json::from_slice(&frame).expect("envelope")
        }

        async fn send(&mut self, envelope: Envelope) {
            let payload = serde_json::to_vec(&envelope).expect("serialize");
            self.transport.send_frame(&payload).await.expect("send");
        }

        async fn send_event(&mut self, channel: u32, method: &str, payload: Value) {
            self.send(Envelope {
                channel,
                message: RpcMessage {
                    identifier: 0,
                    method: method.to_owned(),
                    payload,
                    kind: RpcKind::Event,
                },
            })
            .await;
        }
    }

    async fn connected_pair() -> (ChannelMultiplexer, FakeDaemon) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let daemon = tokio::spawn(FakeDaemon::accept(server, 29));
        let mux = ChannelMultiplexer::connect(
            client,
            ProtocolVersionRange { minimum: 25, maximum: 29 },
            vec![],
            Duration::from_secs(1),
            Logger::null(),
        )
        .await
        .expect("connect");
        (mux, daemon.await.expect("daemon"))
    }

    #[tokio::test]
    async fn open_announces_channel() {
        let (mux, mut daemon) = connected_pair().await;
        assert_eq!(mux.daemon_version(), 29);
        let channel = mux.open_channel(ChannelKind::Daemon).await.expect("open");
        assert_eq!(channel.state(), ChannelState::Ready);

        let announce = daemon.recv().await;
        assert_eq!(announce.message.method, METHOD_CHANNEL_OPEN);
        assert_eq!(announce.channel, 1);
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn replies_are_correlated() {
        let (mux, mut daemon) = connected_pair().await;
        let channel = mux.open_channel(ChannelKind::Daemon).await.expect("open");
        let _announce = daemon.recv().await;

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .call("beginTestPlan", json!({"plan": "all"}))
                    .await
            })
        };

        let request = daemon.recv().await;
        assert_eq!(request.message.method, "beginTestPlan");
        assert_eq!(request.message.kind, RpcKind::Request);
        daemon
            .send(Envelope {
                channel: request.channel,
                message: RpcMessage {
                    identifier: request.message.identifier,
                    method: "beginTestPlan".to_owned(),
                    payload: json!({"accepted": true}),
                    kind: RpcKind::Reply,
                },
            })
            .await;

        let reply = call.await.expect("join").expect("reply");
        assert_eq!(reply, json!({"accepted": true}));
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn events_are_fifo_per_channel() {
        let (mux, mut daemon) = connected_pair().await;
        let bundle = mux.open_channel(ChannelKind::Bundle).await.expect("open");
        let _announce = daemon.recv().await;

        for i in 0..5 {
            daemon
                .send_event(1, "caseDidStart", json!({"index": i}))
                .await;
        }
        for i in 0..5 {
            let event = bundle.next_event().await.expect("event");
            assert_eq!(event.payload["index"], json!(i), "events stay in order");
        }
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn transport_error_fails_in_flight_calls() {
        let (mux, mut daemon) = connected_pair().await;
        let channel = mux.open_channel(ChannelKind::Daemon).await.expect("open");
        let _announce = daemon.recv().await;

        let call = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.call("hang", Value::Null).await })
        };
        let _request = daemon.recv().await;
        drop(daemon); // Tears the transport down mid-call.

        let err = call.await.expect("join").expect_err("transport failed");
        assert!(matches!(
            err,
            crate::errors::FutureError::Rejected(inner)
                if matches!(&*inner, CompanionError::Transport(_))
        ));
        assert_eq!(channel.state(), ChannelState::Failed);
    }

    #[tokio::test]
    async fn peer_fin_closes_channel() {
        let (mux, mut daemon) = connected_pair().await;
        let channel = mux.open_channel(ChannelKind::Bundle).await.expect("open");
        let _announce = daemon.recv().await;

        daemon.send_event(1, METHOD_CHANNEL_FIN, Value::Null).await;
        assert!(channel.next_event().await.is_none(), "drained then closed");
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(
            channel.notify("late", Value::Null).is_err(),
            "sends rejected after close"
        );
        mux.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_in_reverse_open_order() {
        let (mux, mut daemon) = connected_pair().await;
        let _bundle = mux.open_channel(ChannelKind::Bundle).await.expect("open");
        let _daemon_channel = mux.open_channel(ChannelKind::Daemon).await.expect("open");
        let _a1 = daemon.recv().await;
        let _a2 = daemon.recv().await;

        mux.shutdown().await;
        let fin_first = daemon.recv().await;
        let fin_second = daemon.recv().await;
        assert_eq!(fin_first.message.method, METHOD_CHANNEL_FIN);
        assert_eq!(fin_first.channel, 2, "last opened closes first");
        assert_eq!(fin_second.channel, 1);
    }
}
