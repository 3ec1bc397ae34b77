//! Raw socket transports.
//!
//! Each accepted or dialed TCP stream is split into a reader task and a writer
//! task. The reader decodes frames and forwards them to the session loop as
//! [`SocketEvent`]s, always ending with [`SocketEventKind::TransportClosed`].
//! The writer drains a command queue fed through a cloneable
//! [`SocketTransport`] handle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::codec::Codec;
use crate::framing::{FrameConfig, FrameError, FramedReader, FramedWriter};
use crate::protocol::{self, ConnectRequest, ConnectResponse, Frame, Heartbeat, SocketMessage};

/// Identifier of one raw transport. Never reused within a session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

/// Atomic generator for monotonically increasing [`TransportId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`TransportId`].
    pub fn next_id(&self) -> TransportId {
        TransportId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that happened on a raw transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketEvent<P> {
    /// Transport the event arrived on.
    pub transport: TransportId,
    /// What arrived.
    pub kind: SocketEventKind<P>,
}

/// Decoded content of a [`SocketEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEventKind<P> {
    /// Handshake request from an initiator.
    ConnectRequest(ConnectRequest),
    /// Handshake response from an acceptor.
    ConnectResponse(ConnectResponse),
    /// A sequenced application message. Batches arrive as consecutive events.
    Data(SocketMessage<P>),
    /// Liveness marker with the peer's acknowledgement.
    Heartbeat {
        /// Ping or pong.
        beat: Heartbeat,
        /// Peer's acknowledgement of our traffic.
        ack: u64,
    },
    /// Bare acknowledgement of our traffic.
    Ack(u64),
    /// The transport is gone. Always the last event of a transport.
    TransportClosed,
}

impl<P> SocketEventKind<P> {
    /// Short name for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            SocketEventKind::ConnectRequest(_) => "connect request",
            SocketEventKind::ConnectResponse(_) => "connect response",
            SocketEventKind::Data(_) => "data",
            SocketEventKind::Heartbeat { .. } => "heartbeat",
            SocketEventKind::Ack(_) => "ack",
            SocketEventKind::TransportClosed => "transport closed",
        }
    }
}

#[derive(Debug)]
pub(crate) enum WriterCommand {
    Send(Frame),
    Close,
}

/// Cloneable handle to the writer side of a socket transport.
#[derive(Debug, Clone)]
pub struct SocketTransport {
    id: TransportId,
    peer: Option<SocketAddr>,
    commands: mpsc::UnboundedSender<WriterCommand>,
}

impl SocketTransport {
    /// This transport's id.
    pub fn id(&self) -> TransportId {
        self.id
    }

    /// Remote address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue a frame for writing. Returns false if the writer is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.commands.send(WriterCommand::Send(frame)).is_ok()
    }

    /// Close the transport after already-queued frames are written.
    ///
    /// Idempotent; closing a transport whose writer already exited is a no-op.
    pub fn close(&self) {
        let _ = self.commands.send(WriterCommand::Close);
    }

    /// Whether the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// A transport with no socket behind it. Frames are delivered to the
    /// returned receiver.
    #[cfg(test)]
    pub(crate) fn detached(
        id: TransportId,
    ) -> (Self, mpsc::UnboundedReceiver<WriterCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                peer: None,
                commands,
            },
            rx,
        )
    }
}

/// Start reader and writer tasks for `stream` on `tasks`.
pub(crate) fn spawn_socket<P: Send + 'static>(
    id: TransportId,
    stream: TcpStream,
    config: &FrameConfig,
    codec: Arc<dyn Codec<P>>,
    events: mpsc::UnboundedSender<SocketEvent<P>>,
    tasks: &mut JoinSet<()>,
) -> SocketTransport {
    let peer = stream.peer_addr().ok();
    let (reader, writer) = stream.into_split();
    spawn_halves(id, peer, reader, writer, config, codec, events, tasks)
}

#[allow(clippy::too_many_arguments)]
fn spawn_halves<P, R, W>(
    id: TransportId,
    peer: Option<SocketAddr>,
    reader: R,
    writer: W,
    config: &FrameConfig,
    codec: Arc<dyn Codec<P>>,
    events: mpsc::UnboundedSender<SocketEvent<P>>,
    tasks: &mut JoinSet<()>,
) -> SocketTransport
where
    P: Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tasks.spawn(write_loop(
        id,
        FramedWriter::new(writer, config.clone()),
        command_rx,
        shutdown_tx,
    ));
    tasks.spawn(read_loop(
        id,
        FramedReader::new(reader, config.clone()),
        codec,
        events,
        shutdown_rx,
    ));

    SocketTransport { id, peer, commands }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    id: TransportId,
    mut writer: FramedWriter<W>,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
    shutdown: watch::Sender<bool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send(frame) => {
                if let Err(e) = writer.send(&frame).await {
                    tracing::warn!("Transport {id:?} write failed: {e}");
                    break;
                }
            }
            WriterCommand::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    let _ = shutdown.send(true);
    tracing::debug!("Transport {id:?} writer stopped");
}

async fn read_loop<P: Send + 'static, R: AsyncRead + Unpin>(
    id: TransportId,
    mut reader: FramedReader<R>,
    codec: Arc<dyn Codec<P>>,
    events: mpsc::UnboundedSender<SocketEvent<P>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = reader.recv() => match result {
                Ok(frame) => {
                    if !forward(id, frame, codec.as_ref(), &events) {
                        break;
                    }
                }
                Err(FrameError::ConnectionClosed) => break,
                Err(e) => {
                    tracing::warn!("Transport {id:?} read failed: {e}");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    let _ = events.send(SocketEvent {
        transport: id,
        kind: SocketEventKind::TransportClosed,
    });
}

/// Decode `frame` into events. Returns false when the transport must stop.
fn forward<P: 'static>(
    id: TransportId,
    frame: Frame,
    codec: &dyn Codec<P>,
    events: &mpsc::UnboundedSender<SocketEvent<P>>,
) -> bool {
    let wires = match frame {
        Frame::ConnectRequest(request) => {
            return emit(id, SocketEventKind::ConnectRequest(request), events);
        }
        Frame::ConnectResponse(response) => {
            return emit(id, SocketEventKind::ConnectResponse(response), events);
        }
        Frame::Heartbeat { beat, ack } => {
            return emit(id, SocketEventKind::Heartbeat { beat, ack }, events);
        }
        Frame::Ack { ack } => return emit(id, SocketEventKind::Ack(ack), events),
        Frame::Data(wire) => vec![wire],
        Frame::Batch(wires) => wires,
    };

    for wire in wires {
        match protocol::decode_message(wire, codec) {
            Ok(message) => {
                if !emit(id, SocketEventKind::Data(message), events) {
                    return false;
                }
            }
            Err(e) => {
                tracing::warn!("Transport {id:?} dropped, undecodable message: {e}");
                return false;
            }
        }
    }
    true
}

fn emit<P>(
    id: TransportId,
    kind: SocketEventKind<P>,
    events: &mpsc::UnboundedSender<SocketEvent<P>>,
) -> bool {
    events.send(SocketEvent { transport: id, kind }).is_ok()
}
