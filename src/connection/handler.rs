//! Connection Handler Module
//!
//! This module handles individual peer connections to the relay.
//! Each peer gets its own handler task that runs the connection state
//! machine, routing inbound traffic and writing queued outbound messages.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Connecting: peer connected (TCP handshake)
//!        │
//!        ▼
//! 2. Handshaking: first message must be a HANDSHAKE
//!        │          (bounded by the handshake timeout)
//!        │
//!        ├── timeout / malformed / rejected ──────────┐
//!        ▼                                            │
//! 3. Active                                           │
//!    ┌──────────────────────────────────────────┐     │
//!    │  select!                                 │     │
//!    │   ├─ socket bytes  ─▶ parse ─▶ route     │     │
//!    │   │                    ├─ FRAME_SEGMENT ─▶ FrameDispatcher
//!    │   │                    └─ COMMAND ───────▶ CommandHandler
//!    │   ├─ outbound queue ─▶ write to peer     │     │
//!    │   └─ server shutdown                     │     │
//!    └──────────────────────────────────────────┘     │
//!        │                                            │
//!        ▼                                            │
//! 4. Closing: stream retired / observer detached      │
//!        │                                            │
//!        ▼                                            │
//! 5. Closed ◀─────────────────────────────────────────┘
//! ```
//!
//! ## Outbound Queue
//!
//! The handler registers the sending half of its outbound queue with the
//! registry and keeps only the receiving half. Whatever holds the stream
//! entry can reach the peer without touching the socket, and once the
//! entry lets go of the handle the queue closes and so does the connection.

use crate::commands::CommandOrigin;
use crate::notify::Notification;
use crate::protocol::{
    Handshake, Message, MessageParser, ParseError, Role, HEADER_LEN, PROTOCOL_VERSION,
};
use crate::registry::{ConnectionId, Outbound, PeerHandle, RegistryError, SharedEntry};
use crate::server::RelayContext;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 64 * 1024;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Handshakes that registered a producer or observer
    pub handshakes_completed: AtomicU64,
    /// Handshakes that timed out, were malformed or were refused
    pub handshakes_rejected: AtomicU64,
    /// Messages received after the handshake
    pub messages_received: AtomicU64,
    /// Messages written to peers
    pub messages_sent: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_completed(&self) {
        self.handshakes_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handshake_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Closing,
    Closed,
}

/// What the handshake bound this connection to.
#[derive(Debug, Clone)]
struct Session {
    /// Current stream URI; follows renames once their rebind is delivered
    uri: String,
    role: Role,
    /// The entry the handshake attached to, whatever it is named now
    entry: SharedEntry,
}

/// One wake-up of the active loop.
enum Activity {
    Read(std::io::Result<usize>),
    Outbound(Option<Outbound>),
    Shutdown,
}

/// Handles a single peer connection.
///
/// This struct owns the socket, the read buffer and the receiving half of
/// the connection's outbound queue.
pub struct ConnectionHandler {
    /// Socket read half
    reader: OwnedReadHalf,

    /// Buffered socket write half
    writer: BufWriter<OwnedWriteHalf>,

    /// Peer's address (for logging)
    addr: SocketAddr,

    /// Process-unique connection id
    id: ConnectionId,

    /// Buffer for incoming data
    buffer: BytesMut,

    /// Wire decoder
    parser: MessageParser,

    /// Shared relay state
    ctx: Arc<RelayContext>,

    state: ConnectionState,

    /// Set once the handshake succeeded
    session: Option<Session>,

    /// Sending half, handed to the registry at registration
    outbound_tx: Option<mpsc::UnboundedSender<Outbound>>,

    outbound: mpsc::UnboundedReceiver<Outbound>,

    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    ///
    /// # Arguments
    ///
    /// * `stream` - The TCP stream for this connection
    /// * `addr` - The peer's socket address
    /// * `ctx` - Shared relay state
    /// * `shutdown` - Fires when the server stops
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<RelayContext>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ctx.stats.connection_opened();

        let (reader, writer) = stream.into_split();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();

        Self {
            reader,
            writer: BufWriter::new(writer),
            addr,
            id: ctx.next_connection_id(),
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: MessageParser::with_max_message_size(ctx.config.max_message_size)
                .with_max_tiles_per_frame(ctx.config.max_tiles_per_frame),
            ctx,
            state: ConnectionState::Connecting,
            session: None,
            outbound_tx: Some(outbound_tx),
            outbound,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn transition(&mut self, state: ConnectionState) {
        trace!(
            client = %self.addr,
            connection = %self.id,
            from = ?self.state,
            to = ?state,
            "State change"
        );
        self.state = state;
    }

    /// Runs the connection to completion.
    ///
    /// Whatever ends the connection, the stream or observer registration
    /// it held is torn down before this returns.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, connection = %self.id, "Peer connected");

        let result = self.serve().await;
        self.teardown();

        match &result {
            Ok(()) => info!(client = %self.addr, "Peer disconnected gracefully"),
            Err(e) => match e {
                ConnectionError::ClientDisconnected => {
                    debug!(client = %self.addr, "Peer disconnected")
                }
                ConnectionError::Released => {
                    info!(client = %self.addr, "Stream released, closing connection")
                }
                ConnectionError::ServerShutdown => {
                    debug!(client = %self.addr, "Closing connection for shutdown")
                }
                ConnectionError::IoError(io_err)
                    if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
                {
                    debug!(client = %self.addr, "Connection reset by peer")
                }
                _ => warn!(client = %self.addr, error = %e, "Connection error"),
            },
        }

        self.ctx.stats.connection_closed();
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::Handshaking);

        let timeout = self.ctx.config.handshake_timeout;
        let handshake = match tokio::time::timeout(timeout, self.read_handshake()).await {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                self.ctx.stats.handshake_rejected();
                return Err(e);
            }
            Err(_) => {
                self.ctx.stats.handshake_rejected();
                return Err(ConnectionError::HandshakeTimeout(timeout));
            }
        };

        if let Err(e) = self.register(&handshake) {
            self.ctx.stats.handshake_rejected();
            return Err(e);
        }
        self.ctx.stats.handshake_completed();

        self.write_message(&Message::HandshakeAck {
            uri: handshake.uri.clone(),
        })
        .await?;

        self.transition(ConnectionState::Active);
        self.main_loop().await
    }

    /// Reads until the first message arrives and validates it.
    async fn read_handshake(&mut self) -> Result<Handshake, ConnectionError> {
        loop {
            let parsed = self
                .parser
                .parse(&mut self.buffer)
                .map_err(|e| ConnectionError::MalformedHandshake(e.to_string()))?;

            match parsed {
                Some(Message::Handshake(handshake)) => return validate_handshake(handshake),
                Some(other) => {
                    return Err(ConnectionError::MalformedHandshake(format!(
                        "expected handshake, got {}",
                        other.name()
                    )))
                }
                None => self.read_more_data().await?,
            }
        }
    }

    /// Registers this connection under the handshake's URI.
    fn register(&mut self, handshake: &Handshake) -> Result<(), ConnectionError> {
        let tx = self
            .outbound_tx
            .take()
            .ok_or_else(|| {
                ConnectionError::ProtocolViolation("duplicate registration".to_string())
            })?;
        let peer = PeerHandle::new(self.id, tx);
        let uri = handshake.uri.clone();

        let entry = match handshake.role {
            Role::Producer => {
                let attached = self
                    .ctx
                    .registry
                    .create_or_attach(&uri, peer, handshake.takeover)?;

                if let Some(displaced) = attached.displaced {
                    self.ctx.dispatcher.retire(&displaced);
                }
                info!(
                    client = %self.addr,
                    connection = %self.id,
                    uri = %uri,
                    "Producer bound stream"
                );
                self.ctx
                    .notifier
                    .notify(Notification::StreamOpened { uri: uri.clone() });
                attached.entry
            }
            Role::Observer => {
                let entry = self.ctx.registry.attach_observer(&uri, peer)?;
                info!(
                    client = %self.addr,
                    connection = %self.id,
                    uri = %uri,
                    "Observer attached"
                );
                entry
            }
        };

        self.session = Some(Session {
            uri,
            role: handshake.role,
            entry,
        });
        Ok(())
    }

    /// The active read-route-write loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Route everything already buffered before waiting again
            while let Some(message) = self.try_parse_message()? {
                self.route(message)?;
                self.drain_outbound().await?;
            }

            self.check_buffer_limit()?;

            let activity = tokio::select! {
                read = self.reader.read_buf(&mut self.buffer) => Activity::Read(read),
                item = self.outbound.recv() => Activity::Outbound(item),
                _ = self.shutdown.changed() => Activity::Shutdown,
            };

            match activity {
                Activity::Read(read) => self.on_read(read?)?,
                Activity::Outbound(Some(item)) => self.deliver(item).await?,
                Activity::Outbound(None) => return Err(ConnectionError::Released),
                Activity::Shutdown => return Err(ConnectionError::ServerShutdown),
            }
        }
    }

    /// Attempts to parse a message from the buffer.
    fn try_parse_message(&mut self) -> Result<Option<Message>, ConnectionError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        match self.parser.parse(&mut self.buffer) {
            Ok(Some(message)) => {
                trace!(
                    client = %self.addr,
                    message = message.name(),
                    remaining = self.buffer.len(),
                    "Parsed message"
                );
                Ok(Some(message))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(client = %self.addr, error = %e, "Parse error");
                Err(ConnectionError::ParseError(e))
            }
        }
    }

    fn route(&mut self, message: Message) -> Result<(), ConnectionError> {
        self.ctx.stats.message_received();

        let Some(session) = &self.session else {
            return Err(ConnectionError::ProtocolViolation(
                "message before handshake".to_string(),
            ));
        };

        match message {
            Message::Segment(segment) => {
                if session.role != Role::Producer {
                    return Err(ConnectionError::ProtocolViolation(
                        "observers cannot send frame segments".to_string(),
                    ));
                }
                if segment.stream_uri != session.uri {
                    return Err(ConnectionError::ProtocolViolation(format!(
                        "segment for {} on stream {}",
                        segment.stream_uri, session.uri
                    )));
                }
                self.ctx.dispatcher.ingest_segment(segment);
            }
            Message::Command(line) => {
                let origin = CommandOrigin::new(session.uri.clone(), self.id);
                self.ctx.commands.process(&line, &origin);
            }
            other => {
                return Err(ConnectionError::ProtocolViolation(format!(
                    "unexpected {} message from peer",
                    other.name()
                )));
            }
        }

        Ok(())
    }

    /// Delivers everything already queued, without waiting.
    ///
    /// Keeps a rename issued by this peer ahead of its next message.
    async fn drain_outbound(&mut self) -> Result<(), ConnectionError> {
        while let Ok(item) = self.outbound.try_recv() {
            self.deliver(item).await?;
        }
        Ok(())
    }

    async fn deliver(&mut self, item: Outbound) -> Result<(), ConnectionError> {
        match item {
            Outbound::Message(message) => self.write_message(&message).await,
            Outbound::Rebind { uri } => {
                if let Some(session) = &mut self.session {
                    debug!(
                        client = %self.addr,
                        from = %session.uri,
                        to = %uri,
                        "Connection rebound"
                    );
                    session.uri = uri;
                }
                Ok(())
            }
        }
    }

    fn on_read(&mut self, n: usize) -> Result<(), ConnectionError> {
        if n == 0 {
            // Connection closed by peer
            if self.buffer.is_empty() {
                return Err(ConnectionError::ClientDisconnected);
            } else {
                // Partial message in buffer
                return Err(ConnectionError::UnexpectedEof);
            }
        }

        self.ctx.stats.bytes_read(n);
        trace!(client = %self.addr, bytes = n, "Read data");
        Ok(())
    }

    fn check_buffer_limit(&mut self) -> Result<(), ConnectionError> {
        // The parser bounds a single message; one message plus header is the most we ever hold
        let limit = HEADER_LEN + self.parser.max_message_size();
        if self.buffer.len() >= limit {
            error!(
                client = %self.addr,
                size = self.buffer.len(),
                "Buffer size limit exceeded"
            );
            return Err(ConnectionError::BufferFull);
        }

        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }
        Ok(())
    }

    /// Reads more data from the socket into the buffer.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        self.check_buffer_limit()?;
        let n = self.reader.read_buf(&mut self.buffer).await?;
        self.on_read(n)
    }

    /// Sends a message to the peer.
    async fn write_message(&mut self, message: &Message) -> Result<(), ConnectionError> {
        let bytes = message.serialize();
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;

        self.ctx.stats.message_sent();
        self.ctx.stats.bytes_written(bytes.len());
        trace!(
            client = %self.addr,
            message = message.name(),
            bytes = bytes.len(),
            "Sent message"
        );
        Ok(())
    }

    /// Releases whatever this connection registered.
    ///
    /// A producer closes its stream, unless a takeover or rename already
    /// moved the stream away from it; an observer just detaches.
    fn teardown(&mut self) {
        self.transition(ConnectionState::Closing);

        if let Some(session) = self.session.take() {
            match session.role {
                Role::Producer => {
                    if self.ctx.dispatcher.close_owned_stream(&session.uri, self.id) {
                        info!(
                            client = %self.addr,
                            uri = %session.uri,
                            "Producer disconnected, stream closed"
                        );
                    }
                }
                Role::Observer => {
                    // A rename may not have reached this connection yet
                    session.entry.lock().unwrap().remove_observer(self.id);
                }
            }
        }

        self.transition(ConnectionState::Closed);
    }
}

fn validate_handshake(handshake: Handshake) -> Result<Handshake, ConnectionError> {
    if handshake.version != PROTOCOL_VERSION {
        return Err(ConnectionError::MalformedHandshake(format!(
            "unsupported protocol version {}",
            handshake.version
        )));
    }
    if handshake.uri.trim().is_empty() {
        return Err(ConnectionError::MalformedHandshake(
            "empty stream uri".to_string(),
        ));
    }
    Ok(handshake)
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Wire decoding error
    #[error("Parse error: {0}")]
    ParseError(#[from] ParseError),

    /// Peer disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Unexpected end of stream (partial message)
    #[error("Unexpected end of stream")]
    UnexpectedEof,

    /// Buffer size limit exceeded
    #[error("Buffer size limit exceeded")]
    BufferFull,

    /// No handshake within the configured timeout
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The first message was not a valid handshake
    #[error("Malformed handshake: {0}")]
    MalformedHandshake(String),

    /// The registry refused the handshake
    #[error("Registration rejected: {0}")]
    Rejected(#[from] RegistryError),

    /// The peer broke the protocol after the handshake
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The stream entry let go of this connection
    #[error("Stream released")]
    Released,

    /// The server is shutting down
    #[error("Server shutting down")]
    ServerShutdown,
}

/// Handles a peer connection.
///
/// This is a convenience function that creates a ConnectionHandler
/// and runs it to completion.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<RelayContext>,
    shutdown: watch::Receiver<bool>,
) {
    let handler = ConnectionHandler::new(stream, addr, ctx, shutdown);
    if let Err(e) = handler.run().await {
        match e {
            ConnectionError::ClientDisconnected
            | ConnectionError::Released
            | ConnectionError::ServerShutdown => {}
            ConnectionError::IoError(ref io_err)
                if io_err.kind() == std::io::ErrorKind::ConnectionReset => {}
            _ => {
                debug!(client = %addr, error = %e, "Connection ended with error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::protocol::{FrameSegment, InteractionEvent};
    use bytes::Bytes;
    use tokio::net::TcpListener;

    const WAIT: Duration = Duration::from_secs(2);

    async fn create_test_server(
        config: RelayConfig,
    ) -> (SocketAddr, Arc<RelayContext>, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = Arc::new(RelayContext::new(config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ctx_clone = Arc::clone(&ctx);
        tokio::spawn(async move {
            while let Ok((stream, peer_addr)) = listener.accept().await {
                tokio::spawn(handle_connection(
                    stream,
                    peer_addr,
                    Arc::clone(&ctx_clone),
                    shutdown_rx.clone(),
                ));
            }
        });

        (addr, ctx, shutdown_tx)
    }

    struct Peer {
        stream: TcpStream,
        buffer: BytesMut,
        parser: MessageParser,
    }

    impl Peer {
        async fn connect(addr: SocketAddr) -> Self {
            Self {
                stream: TcpStream::connect(addr).await.unwrap(),
                buffer: BytesMut::new(),
                parser: MessageParser::new(),
            }
        }

        /// Connects and completes a handshake, asserting it was acknowledged.
        async fn bind(addr: SocketAddr, handshake: Handshake) -> Self {
            let uri = handshake.uri.clone();
            let mut peer = Self::connect(addr).await;
            peer.send(Message::Handshake(handshake)).await;
            assert_eq!(peer.recv().await, Some(Message::HandshakeAck { uri }));
            peer
        }

        async fn send(&mut self, message: Message) {
            self.stream.write_all(&message.serialize()).await.unwrap();
        }

        async fn send_tile(&mut self, uri: &str, frame: u64, tile: u32, total: u32) {
            let payload = Bytes::from(format!("{}/{}", frame, tile));
            self.send(Message::Segment(FrameSegment::new(uri, frame, tile, total, payload)))
                .await;
        }

        /// Next message, or None once the relay closed the connection.
        async fn recv(&mut self) -> Option<Message> {
            loop {
                if let Some(message) = self.parser.parse(&mut self.buffer).unwrap() {
                    return Some(message);
                }
                match tokio::time::timeout(WAIT, self.stream.read_buf(&mut self.buffer))
                    .await
                    .expect("timed out waiting for the relay")
                {
                    Ok(0) | Err(_) => return None,
                    Ok(_) => {}
                }
            }
        }
    }

    async fn next_notification(
        rx: &mut mpsc::UnboundedReceiver<Notification>,
        wanted: impl Fn(&Notification) -> bool,
    ) -> Notification {
        loop {
            let notification = tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("timed out waiting for notification")
                .expect("notifier dropped");
            if wanted(&notification) {
                return notification;
            }
        }
    }

    fn is_frame_ready(n: &Notification) -> bool {
        matches!(n, Notification::FrameReady { .. })
    }

    fn is_stream_closed(n: &Notification) -> bool {
        matches!(n, Notification::StreamClosed { .. })
    }

    #[tokio::test]
    async fn test_handshake_acknowledged() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let _producer = Peer::bind(addr, Handshake::producer("wall/demo")).await;

        assert_eq!(
            next_notification(&mut notifications, |_| true).await,
            Notification::StreamOpened {
                uri: "wall/demo".to_string()
            }
        );
        assert!(ctx.registry.is_live("wall/demo"));
        assert_eq!(ctx.stats.handshakes_completed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_handshake_timeout_closes_connection() {
        let config = RelayConfig {
            handshake_timeout: Duration::from_millis(100),
            ..RelayConfig::local()
        };
        let (addr, ctx, _shutdown) = create_test_server(config).await;

        let mut silent = Peer::connect(addr).await;
        assert_eq!(silent.recv().await, None);

        assert_eq!(ctx.stats.handshakes_rejected.load(Ordering::Relaxed), 1);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_handshake_closes_connection() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;

        let mut early_command = Peer::connect(addr).await;
        early_command
            .send(Message::Command("close wall/demo".to_string()))
            .await;
        assert_eq!(early_command.recv().await, None);

        let mut wrong_version = Peer::connect(addr).await;
        let mut handshake = Handshake::producer("wall/demo");
        handshake.version = PROTOCOL_VERSION + 1;
        wrong_version.send(Message::Handshake(handshake)).await;
        assert_eq!(wrong_version.recv().await, None);

        let mut garbage = Peer::connect(addr).await;
        garbage.stream.write_all(&[0xEE, 0, 0, 0, 0]).await.unwrap();
        assert_eq!(garbage.recv().await, None);

        assert!(ctx.registry.is_empty());
        assert_eq!(ctx.stats.handshakes_rejected.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_duplicate_bind_rejected_first_unaffected() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let mut first = Peer::bind(addr, Handshake::producer("wall/demo")).await;

        let mut second = Peer::connect(addr).await;
        second
            .send(Message::Handshake(Handshake::producer("wall/demo")))
            .await;
        assert_eq!(second.recv().await, None);

        first.send_tile("wall/demo", 0, 0, 1).await;
        next_notification(&mut notifications, is_frame_ready).await;

        let frame = ctx.dispatcher.take_latest_frame("wall/demo").unwrap();
        assert_eq!(frame.index(), 0);
        assert_eq!(ctx.registry.stats().rejections, 1);
    }

    #[tokio::test]
    async fn test_takeover_replaces_producer() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let mut first = Peer::bind(addr, Handshake::producer("wall/demo")).await;
        let mut second = Peer::bind(addr, Handshake::producer("wall/demo").with_takeover()).await;

        // The displaced producer is disconnected
        assert_eq!(first.recv().await, None);
        next_notification(&mut notifications, is_stream_closed).await;

        second.send_tile("wall/demo", 3, 0, 1).await;
        next_notification(&mut notifications, is_frame_ready).await;
        assert_eq!(
            ctx.dispatcher.take_latest_frame("wall/demo").unwrap().index(),
            3
        );
        assert!(ctx.registry.is_live("wall/demo"));
    }

    #[tokio::test]
    async fn test_end_to_end_freshest_frame() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let mut producer = Peer::bind(addr, Handshake::producer("wall/demo")).await;

        for frame in 0..2 {
            for tile in 0..3 {
                producer.send_tile("wall/demo", frame, tile, 3).await;
            }
        }
        // Frame 1 supersedes frame 0 under the same outstanding notification
        next_notification(&mut notifications, is_frame_ready).await;
        tokio::time::timeout(WAIT, async {
            while ctx.dispatcher.stats().frames_completed < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("second frame never completed");

        let frame = ctx.dispatcher.take_latest_frame("wall/demo").unwrap();
        assert_eq!(frame.index(), 1);
        assert_eq!(frame.into_payload(), Bytes::from("1/01/11/2"));
        assert!(ctx.dispatcher.take_latest_frame("wall/demo").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_mid_frame() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let mut producer = Peer::bind(addr, Handshake::producer("wall/demo")).await;
        producer.send_tile("wall/demo", 0, 0, 3).await;
        producer.send_tile("wall/demo", 0, 1, 3).await;
        drop(producer);

        next_notification(&mut notifications, is_stream_closed).await;
        assert!(ctx.dispatcher.take_latest_frame("wall/demo").is_none());
        assert_eq!(ctx.dispatcher.stats().frames_abandoned, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let repeated = std::iter::from_fn(|| notifications.try_recv().ok())
            .filter(is_stream_closed)
            .count();
        assert_eq!(repeated, 0);
    }

    #[tokio::test]
    async fn test_segment_for_other_stream_is_violation() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let mut producer = Peer::bind(addr, Handshake::producer("mine")).await;
        producer.send_tile("theirs", 0, 0, 1).await;

        assert_eq!(producer.recv().await, None);
        next_notification(&mut notifications, is_stream_closed).await;
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_observer_receives_events_and_closure() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;

        let producer = Peer::bind(addr, Handshake::producer("s")).await;
        let mut observer = Peer::bind(addr, Handshake::observer("s")).await;

        observer
            .send(Message::Command("event-subscribe s exclusive".to_string()))
            .await;
        assert_eq!(
            observer.recv().await,
            Some(Message::EventRegistrationReply {
                uri: "s".to_string(),
                success: true
            })
        );

        let entry = ctx.registry.find("s").unwrap();
        let delivered = entry.lock().unwrap().send_event(&InteractionEvent::press(0.25, 0.75));
        assert_eq!(delivered, 1);
        assert_eq!(
            observer.recv().await,
            Some(Message::Event {
                uri: "s".to_string(),
                event: InteractionEvent::press(0.25, 0.75)
            })
        );

        drop(producer);
        assert_eq!(
            observer.recv().await,
            Some(Message::StreamClosed {
                uri: "s".to_string()
            })
        );
        assert_eq!(observer.recv().await, None);
    }

    #[tokio::test]
    async fn test_observer_of_missing_stream_rejected() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;

        let mut observer = Peer::connect(addr).await;
        observer
            .send(Message::Handshake(Handshake::observer("nobody")))
            .await;

        assert_eq!(observer.recv().await, None);
        assert_eq!(ctx.stats.handshakes_rejected.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_observer_detached_despite_pending_rebind() {
        let ctx = Arc::new(RelayContext::new(RelayConfig::local()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, peer_addr) = accepted.unwrap();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let owner = ConnectionId::new(900);
        let (producer_tx, _producer_rx) = mpsc::unbounded_channel();
        ctx.registry
            .create_or_attach("old", PeerHandle::new(owner, producer_tx), false)
            .unwrap();

        let mut observer =
            ConnectionHandler::new(stream, peer_addr, Arc::clone(&ctx), shutdown_rx);
        observer.register(&Handshake::observer("old")).unwrap();
        ctx.registry.rename("old", "new", owner).unwrap();

        // The rebind sits unread in the observer's queue
        observer.teardown();

        let entry = ctx.registry.find("new").unwrap();
        assert_eq!(entry.lock().unwrap().observer_count(), 0);
        assert_eq!(observer.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_segment_over_tile_limit_closes_only_its_connection() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let mut offender = Peer::bind(addr, Handshake::producer("bad")).await;
        let mut bystander = Peer::bind(addr, Handshake::producer("good")).await;

        offender
            .send(Message::Segment(FrameSegment::new(
                "bad",
                0,
                0,
                u32::MAX,
                Bytes::from_static(b"x"),
            )))
            .await;
        assert_eq!(offender.recv().await, None);
        assert_eq!(
            next_notification(&mut notifications, is_stream_closed).await,
            Notification::StreamClosed {
                uri: "bad".to_string()
            }
        );

        bystander.send_tile("good", 0, 0, 1).await;
        assert_eq!(
            next_notification(&mut notifications, is_frame_ready).await,
            Notification::FrameReady {
                uri: "good".to_string()
            }
        );
        assert!(ctx.registry.is_live("good"));
        assert!(!ctx.registry.is_live("bad"));
    }

    #[tokio::test]
    async fn test_rename_applies_to_following_segments() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let mut producer = Peer::bind(addr, Handshake::producer("old")).await;
        producer
            .send(Message::Command("bind old new".to_string()))
            .await;
        producer.send_tile("new", 0, 0, 1).await;

        assert_eq!(
            next_notification(&mut notifications, is_frame_ready).await,
            Notification::FrameReady {
                uri: "new".to_string()
            }
        );
        assert!(ctx.registry.find("old").is_none());
        assert!(ctx.dispatcher.take_latest_frame("new").is_some());
    }

    #[tokio::test]
    async fn test_unknown_command_keeps_connection_open() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let mut producer = Peer::bind(addr, Handshake::producer("s")).await;
        producer
            .send(Message::Command("teleport s".to_string()))
            .await;
        producer.send_tile("s", 0, 0, 1).await;

        next_notification(&mut notifications, is_frame_ready).await;
        assert_eq!(ctx.commands.stats().unknown, 1);
        assert!(ctx.registry.is_live("s"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (addr, ctx, shutdown) = create_test_server(RelayConfig::local()).await;
        let mut notifications = ctx.notifier.subscribe();

        let mut producer = Peer::bind(addr, Handshake::producer("s")).await;
        shutdown.send(true).unwrap();

        assert_eq!(producer.recv().await, None);
        next_notification(&mut notifications, is_stream_closed).await;
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_connection_stats() {
        let (addr, ctx, _shutdown) = create_test_server(RelayConfig::local()).await;

        assert_eq!(ctx.stats.active_connections.load(Ordering::Relaxed), 0);

        let producer = Peer::bind(addr, Handshake::producer("s")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(ctx.stats.connections_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(ctx.stats.active_connections.load(Ordering::Relaxed), 1);
        assert!(ctx.stats.bytes_read.load(Ordering::Relaxed) > 0);
        assert!(ctx.stats.bytes_written.load(Ordering::Relaxed) > 0);

        drop(producer);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(ctx.stats.active_connections.load(Ordering::Relaxed), 0);
    }
}
