//! Relay Client
//!
//! An async client speaking the relay wire protocol. Producers use it to
//! stream frames and receive interaction events; observers use it to
//! follow an existing stream's events.
//!
//! ## Example
//!
//! ```ignore
//! use pixelrelay::client::RelayClient;
//!
//! let mut client = RelayClient::connect_producer("127.0.0.1:1701", "wall/demo").await?;
//! client.register_for_events(true).await?;
//!
//! let mut frame_index = 0;
//! loop {
//!     let tiles = render_tiles();
//!     client.send_frame(frame_index, tiles).await?;
//!     frame_index += 1;
//! }
//! ```

use crate::protocol::{
    is_encodable_uri, FrameSegment, Handshake, Message, MessageParser, ParseError, SizeHints,
};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, trace};

/// Errors returned by `RelayClient`.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The relay sent bytes that do not decode
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The relay closed the connection instead of acknowledging the handshake
    #[error("Handshake for {0} rejected")]
    Rejected(String),

    /// The relay answered with a message that makes no sense here
    #[error("Unexpected {0} message")]
    UnexpectedMessage(&'static str),

    /// Stream URIs must be non-empty, free of whitespace and encodable
    #[error("Invalid stream uri: {0:?}")]
    InvalidUri(String),

    /// A frame needs at least one tile
    #[error("Frame has no tiles")]
    EmptyFrame,

    /// The relay closed the connection
    #[error("Disconnected from relay")]
    Disconnected,
}

/// A connection to a relay, bound to one stream.
pub struct RelayClient {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
    parser: MessageParser,
    uri: String,
    /// Messages read while waiting for a specific reply
    pending: VecDeque<Message>,
}

fn validate_uri(uri: &str) -> Result<(), ClientError> {
    if !is_encodable_uri(uri) || uri.chars().any(char::is_whitespace) {
        return Err(ClientError::InvalidUri(uri.to_string()));
    }
    Ok(())
}

impl RelayClient {
    /// Connects and performs `handshake`, waiting for the acknowledgement.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        handshake: Handshake,
    ) -> Result<Self, ClientError> {
        validate_uri(&handshake.uri)?;

        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        let mut client = Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(4096),
            parser: MessageParser::new(),
            uri: handshake.uri.clone(),
            pending: VecDeque::new(),
        };

        client.send(&Message::Handshake(handshake)).await?;
        match client.read_message().await? {
            Some(Message::HandshakeAck { uri }) if uri == client.uri => {
                debug!(uri = %uri, "Connected to relay");
                Ok(client)
            }
            Some(other) => Err(ClientError::UnexpectedMessage(other.name())),
            None => Err(ClientError::Rejected(client.uri)),
        }
    }

    /// Connects as the producer of `uri`.
    pub async fn connect_producer(
        addr: impl ToSocketAddrs,
        uri: &str,
    ) -> Result<Self, ClientError> {
        Self::connect(addr, Handshake::producer(uri)).await
    }

    /// Connects as an observer of the existing stream `uri`.
    pub async fn connect_observer(
        addr: impl ToSocketAddrs,
        uri: &str,
    ) -> Result<Self, ClientError> {
        Self::connect(addr, Handshake::observer(uri)).await
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub async fn send_segment(&mut self, segment: FrameSegment) -> Result<(), ClientError> {
        validate_uri(&segment.stream_uri)?;
        self.send(&Message::Segment(segment)).await
    }

    /// Sends one frame as a sequence of tiles, in order.
    pub async fn send_frame<I, B>(&mut self, frame_index: u64, tiles: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let tiles: Vec<Bytes> = tiles.into_iter().map(Into::into).collect();
        if tiles.is_empty() {
            return Err(ClientError::EmptyFrame);
        }

        let total = tiles.len() as u32;
        for (index, payload) in tiles.into_iter().enumerate() {
            let segment =
                FrameSegment::new(self.uri.clone(), frame_index, index as u32, total, payload);
            self.write(&Message::Segment(segment)).await?;
        }
        self.stream.flush().await?;
        trace!(uri = %self.uri, frame = frame_index, tiles = total, "Sent frame");
        Ok(())
    }

    /// Sends a raw command line.
    pub async fn send_command(&mut self, line: &str) -> Result<(), ClientError> {
        self.send(&Message::Command(line.to_string())).await
    }

    /// Declares this stream's size hints.
    pub async fn send_size_hints(&mut self, hints: SizeHints) -> Result<(), ClientError> {
        let values = hints
            .to_array()
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        let line = format!("size-hint-update {} {}", self.uri, values);
        self.send_command(&line).await
    }

    /// Subscribes to interaction events and waits for the relay's answer.
    ///
    /// Messages arriving before the answer are kept for `next_message`.
    pub async fn register_for_events(&mut self, exclusive: bool) -> Result<bool, ClientError> {
        let line = if exclusive {
            format!("event-subscribe {} exclusive", self.uri)
        } else {
            format!("event-subscribe {}", self.uri)
        };
        self.send_command(&line).await?;

        loop {
            match self.read_message().await? {
                Some(Message::EventRegistrationReply { uri, success }) if uri == self.uri => {
                    return Ok(success)
                }
                Some(other) => self.pending.push_back(other),
                None => return Err(ClientError::Disconnected),
            }
        }
    }

    /// Renames this stream. Later frames are sent under `new_uri`.
    pub async fn rename(&mut self, new_uri: &str) -> Result<(), ClientError> {
        validate_uri(new_uri)?;
        let line = format!("bind {} {}", self.uri, new_uri);
        self.send_command(&line).await?;
        self.uri = new_uri.to_string();
        Ok(())
    }

    /// Next message from the relay, or `None` once it closed the connection.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ClientError> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Some(message));
        }
        self.read_message().await
    }

    /// Disconnects. A producer's stream closes with it.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn write(&mut self, message: &Message) -> Result<(), ClientError> {
        self.stream.write_all(&message.serialize()).await?;
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        self.write(message).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Option<Message>, ClientError> {
        loop {
            if let Some(message) = self.parser.parse(&mut self.buffer)? {
                return Ok(Some(message));
            }

            match self.stream.get_mut().read_buf(&mut self.buffer).await {
                Ok(0) => return Ok(None),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
