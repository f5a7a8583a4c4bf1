//! # TCP Transport
//!
//! Device-facing server. Per accepted connection:
//!
//! ```text
//!            socket task (async)                 pipeline thread (blocking)
//! socket --> read_buf --> [bounded chunks] --> ConnSession -> FrameParser -> ModuleRouter
//! socket <-- write_all <-- [unbounded outbound] <-------------- TcpResponseChannel
//! ```
//!
//! The socket task owns the stream; the pipeline thread owns the handshake state, the
//! parser and the dispatch, so a handler blocking on an external resource only stalls its
//! own connection. The inbound queue holds at most `backpressure_limit` chunks, after
//! which the socket task stops reading. A close request travels on the outbound queue
//! behind the frames already sent, so a handshake rejection reaches the peer before the
//! socket is closed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{AetherConfig, ServerConfig};
use crate::core::codec::AetherCodec;
use crate::core::command::CommandType;
use crate::core::packet::{ModuleId, Packet, MAX_WIRE_PAYLOAD};
use crate::error::{ProtocolError, Result};
use crate::protocol::channel::{ChannelId, ResponseChannel};
use crate::protocol::handshake::{ConnSession, SessionEvent};
use crate::protocol::parser::FrameParser;
use crate::protocol::router::{ModuleRouter, PacketHandler, RouteOutcome};
use crate::transport::session_registry::SessionRegistry;
use crate::utils::metrics::Metrics;

/// Instruction for a connection's socket task
#[derive(Debug)]
enum Outbound {
    Frame(Bytes),
    Close,
}

/// [`ResponseChannel`] writing to one TCP connection.
pub struct TcpResponseChannel {
    id: ChannelId,
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl TcpResponseChannel {
    fn new(peer: SocketAddr, outbound: mpsc::UnboundedSender<Outbound>, metrics: Arc<Metrics>) -> Self {
        Self {
            id: ChannelId::next(),
            peer,
            outbound,
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl ResponseChannel for TcpResponseChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn send_packet(&self, packet: &Packet) -> Result<()> {
        if self.is_closed() {
            return Err(ProtocolError::ChannelClosed);
        }
        packet.check_size(MAX_WIRE_PAYLOAD)?;
        let frame = packet.to_bytes();
        let len = frame.len() as u64;
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| ProtocolError::ChannelClosed)?;
        self.metrics.packet_sent(len);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Router wrapper counting the packets the router had to answer itself.
struct MeteredRouter {
    router: Arc<ModuleRouter>,
    metrics: Arc<Metrics>,
}

impl PacketHandler for MeteredRouter {
    fn module_id(&self) -> ModuleId {
        ModuleId::ROUTER
    }

    fn on_packet(&self, packet: Packet, channel: &Arc<dyn ResponseChannel>) {
        match self.router.route(packet, channel) {
            RouteOutcome::Delivered(_) => {}
            RouteOutcome::NotFound(_) | RouteOutcome::Unavailable(_) => self.metrics.routing_error(),
        }
    }
}

/// What every connection needs; cloned into each connection task.
#[derive(Clone)]
struct ConnectionContext {
    router: Arc<ModuleRouter>,
    sessions: SessionRegistry,
    metrics: Arc<Metrics>,
    max_payload_size: usize,
    backpressure_limit: usize,
    read_buffer_size: usize,
}

/// Device-facing TCP server
pub struct TcpServer {
    server: ServerConfig,
    context: ConnectionContext,
}

impl TcpServer {
    pub fn new(
        config: &AetherConfig,
        router: Arc<ModuleRouter>,
        sessions: SessionRegistry,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            context: ConnectionContext {
                router,
                sessions,
                metrics,
                max_payload_size: config.transport.max_payload_size,
                backpressure_limit: config.server.backpressure_limit,
                read_buffer_size: config.server.read_buffer_size,
            },
            server: config.server.clone(),
        }
    }

    /// Bind the configured address. Failing to bind is fatal to the daemon.
    #[instrument(skip(self), fields(address = %self.server.address))]
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.server.address).await?;
        info!(address = %listener.local_addr()?, "Listening for devices");
        Ok(listener)
    }

    /// Bind and serve until `shutdown` fires.
    pub async fn run(self, shutdown: mpsc::Receiver<()>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` fires, then close every
    /// connection and wait up to `shutdown_timeout` for them to finish.
    pub async fn serve(self, listener: TcpListener, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let active = Arc::new(AtomicUsize::new(0));
        let (closing_tx, closing_rx) = watch::channel(false);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutting down server. Closing device connections...");
                    let _ = closing_tx.send(true);

                    let timeout = tokio::time::sleep(self.server.shutdown_timeout);
                    tokio::pin!(timeout);

                    loop {
                        let connections = active.load(Ordering::Acquire);
                        if connections == 0 {
                            info!("All connections closed, shutting down");
                            break;
                        }
                        tokio::select! {
                            _ = &mut timeout => {
                                warn!(connections, "Shutdown timeout reached, forcing exit");
                                break;
                            }
                            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                                trace!(connections, "Waiting for connections to close");
                            }
                        }
                    }

                    return Ok(());
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            if active.load(Ordering::Acquire) >= self.server.max_connections {
                                warn!(peer = %peer, limit = self.server.max_connections, "Connection limit reached, closing");
                                self.context.metrics.connection_rejected();
                                drop(stream);
                                continue;
                            }

                            active.fetch_add(1, Ordering::AcqRel);
                            let active = active.clone();
                            let context = self.context.clone();
                            let closing = closing_rx.clone();

                            tokio::spawn(async move {
                                handle_connection(stream, peer, context, closing).await;
                                active.fetch_sub(1, Ordering::AcqRel);
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Error accepting connection");
                            self.context.metrics.connection_error();
                        }
                    }
                }
            }
        }
    }
}

#[instrument(name = "connection", skip_all, fields(peer = %peer))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: ConnectionContext,
    mut closing: watch::Receiver<bool>,
) {
    let metrics = context.metrics.clone();
    metrics.connection_established();
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let channel = Arc::new(TcpResponseChannel::new(peer, outbound_tx, metrics.clone()));
    let channel_id = channel.id();
    info!(channel = %channel_id, "Device connected");

    let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(context.backpressure_limit);
    let (done_tx, mut done_rx) = oneshot::channel::<()>();
    let pipeline_channel: Arc<dyn ResponseChannel> = channel.clone();
    let read_buffer_size = context.read_buffer_size;

    let spawned = thread::Builder::new()
        .name(format!("conn-{}", channel_id.0))
        .spawn(move || {
            let _done = done_tx;
            run_pipeline(pipeline_channel, inbound_rx, context);
        });
    if let Err(e) = spawned {
        error!(error = %e, "Failed to spawn connection pipeline");
        metrics.connection_error();
        metrics.connection_closed();
        return;
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = BytesMut::with_capacity(read_buffer_size);
    let mut inbound = Some(inbound_tx);
    let mut pipeline_done = false;

    loop {
        buffer.reserve(read_buffer_size);

        tokio::select! {
            biased;

            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        warn!(error = %e, "Write failed");
                        metrics.connection_error();
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    debug!("Close requested");
                    break;
                }
            },

            read = reader.read_buf(&mut buffer), if inbound.is_some() => match read {
                Ok(0) => {
                    debug!("Peer closed the connection");
                    // Let the pipeline finish what it has, then flush its replies
                    inbound = None;
                }
                Ok(n) => {
                    metrics.bytes_received(n as u64);
                    let chunk = buffer.split().freeze();
                    if let Some(tx) = &inbound {
                        if tx.send(chunk).await.is_err() {
                            inbound = None;
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Read failed");
                    metrics.connection_error();
                    break;
                }
            },

            _ = &mut done_rx, if !pipeline_done => {
                pipeline_done = true;
                while let Ok(outbound) = outbound_rx.try_recv() {
                    let Outbound::Frame(frame) = outbound else { break };
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }

            _ = closing.changed() => {
                debug!("Server shutting down");
                break;
            }
        }
    }

    channel.close();
    drop(inbound);
    if let Err(e) = writer.shutdown().await {
        trace!(error = %e, "Socket shutdown failed");
    }
    if !pipeline_done {
        let _ = done_rx.await;
    }

    metrics.connection_closed();
    info!(channel = %channel_id, "Device disconnected");
}

/// Blocking half of a connection: handshake, framing and dispatch.
fn run_pipeline(
    channel: Arc<dyn ResponseChannel>,
    mut inbound: mpsc::Receiver<Bytes>,
    context: ConnectionContext,
) {
    let metrics = context.metrics.clone();
    let mut session = ConnSession::new(channel.clone(), context.sessions.clone())
        .with_max_payload(context.max_payload_size);
    let mut parser = FrameParser::with_codec(AetherCodec::with_max_payload(context.max_payload_size));
    parser.set_handler(Arc::new(MeteredRouter {
        router: context.router.clone(),
        metrics: metrics.clone(),
    }));

    while let Some(chunk) = inbound.blocking_recv() {
        let bytes = match session.feed(&chunk) {
            SessionEvent::Pending | SessionEvent::Discarded => continue,
            SessionEvent::Rejected { .. } => {
                metrics.handshake_failed();
                channel.close();
                continue;
            }
            SessionEvent::Established { leftover, .. } => {
                metrics.handshake_success();
                leftover
            }
            SessionEvent::Forward(bytes) => bytes,
        };

        if bytes.is_empty() {
            continue;
        }

        let resyncs = parser.resyncs();
        let result = parser.feed(&bytes, &channel);
        metrics.resynced(parser.resyncs() - resyncs);

        match result {
            Ok(decoded) => metrics.packets_received(decoded as u64),
            Err(e) => {
                warn!(channel = %channel.id(), error = %e, "Framing violation, closing connection");
                metrics.protocol_error();
                channel.close();
                break;
            }
        }
    }

    trace!(channel = %channel.id(), device_id = %session.device_id(), "Pipeline finished");
}

/// Open a framed client connection to a server.
#[instrument]
pub async fn connect(addr: &str) -> Result<Framed<TcpStream, AetherCodec>> {
    let stream = TcpStream::connect(addr).await?;
    Ok(Framed::new(stream, AetherCodec::new()))
}

/// Connect and complete the HELLO handshake as `device_id`.
///
/// Fails with [`ProtocolError::HandshakeError`] carrying the server's reason on rejection.
pub async fn connect_device(addr: &str, device_id: &str) -> Result<Framed<TcpStream, AetherCodec>> {
    let mut framed = connect(addr).await?;
    framed
        .send(Packet::build(CommandType::Hello, ModuleId::CORE, device_id.to_owned()))
        .await?;

    match framed.next().await {
        Some(Ok(reply)) if reply.command_type() == Some(CommandType::Ack) => Ok(framed),
        Some(Ok(reply)) => Err(ProtocolError::HandshakeError(
            reply.payload_str().unwrap_or("unexpected reply").to_string(),
        )),
        Some(Err(e)) => Err(e),
        None => Err(ProtocolError::ChannelClosed),
    }
}
