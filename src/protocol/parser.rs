//! Zero-Copy Wire Message Parser
//!
//! This module implements the incremental decoder for relay messages.
//! Frame payloads can be large, so the parser splits complete messages off
//! the connection's `BytesMut` buffer and hands out `Bytes` slices of it:
//! tile payloads reach the dispatcher without being copied.
//!
//! ## How the Parser Works
//!
//! `MessageParser::parse` returns either:
//! - `Ok(Some(message))` - A complete message was removed from the buffer
//! - `Ok(None)` - Need more data, the buffer is left untouched
//! - `Err(ParseError)` - Invalid protocol data, the connection should be dropped
//!
//! The header is validated before the body arrives, so an oversized or
//! unknown message is rejected without buffering it.

use crate::protocol::types::{
    class, EventKind, FrameSegment, Handshake, InteractionEvent, Message, Role, SizeHints,
    FLAG_TAKEOVER, HEADER_LEN,
};
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Errors that can occur while decoding relay messages.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown message class byte
    #[error("unknown message class: {0:#04x}")]
    UnknownClass(u8),

    /// The body ended before a field could be read
    #[error("truncated {0}")]
    Truncated(&'static str),

    /// The body has bytes left over after the last field
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    /// Invalid UTF-8 in a string field or command line
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// A field holds a value outside its domain
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },

    /// Segment header is inconsistent
    #[error("invalid segment: {0}")]
    InvalidSegment(String),

    /// The message exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Default cap on a single message body (64 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default cap on the tile count a segment may declare for its frame.
pub const DEFAULT_MAX_TILES_PER_FRAME: u32 = 16 * 1024;

/// An incremental relay message parser.
///
/// # Example
///
/// ```
/// use pixelrelay::protocol::{Message, MessageParser};
/// use bytes::BytesMut;
///
/// let mut parser = MessageParser::new();
/// let mut buffer = BytesMut::from(&Message::Command("close wall/demo".into()).serialize()[..]);
///
/// let message = parser.parse(&mut buffer).unwrap().unwrap();
/// assert_eq!(message, Message::Command("close wall/demo".into()));
/// assert!(buffer.is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct MessageParser {
    max_message_size: usize,
    max_tiles_per_frame: u32,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageParser {
    /// Creates a parser with the default message size cap.
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Creates a parser rejecting bodies larger than `max_message_size`.
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            max_tiles_per_frame: DEFAULT_MAX_TILES_PER_FRAME,
        }
    }

    /// Rejects segments declaring more than `max_tiles_per_frame` tiles.
    pub fn with_max_tiles_per_frame(mut self, max_tiles_per_frame: u32) -> Self {
        self.max_tiles_per_frame = max_tiles_per_frame;
        self
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn max_tiles_per_frame(&self) -> u32 {
        self.max_tiles_per_frame
    }

    /// Attempts to split one complete message off the front of `buf`.
    pub fn parse(&mut self, buf: &mut BytesMut) -> ParseResult<Option<Message>> {
        let Some((msg_class, body_len)) = self.peek_header(buf)? else {
            return Ok(None);
        };

        let total = HEADER_LEN + body_len;
        if buf.len() < total {
            // Make room for the rest of the body up front
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut frame = buf.split_to(total).freeze();
        frame.advance(HEADER_LEN);
        decode(msg_class, frame, self.max_tiles_per_frame).map(Some)
    }

    /// Validates the header, returning the class and body length.
    fn peek_header(&self, buf: &[u8]) -> ParseResult<Option<(u8, usize)>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let msg_class = buf[0];
        if !class::is_known(msg_class) {
            return Err(ParseError::UnknownClass(msg_class));
        }

        let body_len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if body_len > self.max_message_size {
            return Err(ParseError::MessageTooLarge {
                size: body_len,
                max: self.max_message_size,
            });
        }

        Ok(Some((msg_class, body_len)))
    }
}

/// Parses one message from a byte slice.
///
/// Convenience wrapper that copies `buf`; returns the message and the
/// number of bytes it occupied.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(Message, usize)>> {
    let mut owned = BytesMut::from(buf);
    let before = owned.len();
    let parsed = MessageParser::new().parse(&mut owned)?;
    Ok(parsed.map(|message| (message, before - owned.len())))
}

/// Decodes a message body of the given class.
pub fn decode_body(msg_class: u8, body: Bytes) -> ParseResult<Message> {
    decode(msg_class, body, DEFAULT_MAX_TILES_PER_FRAME)
}

fn decode(msg_class: u8, body: Bytes, max_tiles: u32) -> ParseResult<Message> {
    let mut reader = BodyReader { body };

    let message = match msg_class {
        class::HANDSHAKE => {
            let version = reader.u8("handshake version")?;
            let raw_role = reader.u8("handshake role")?;
            let role = Role::from_u8(raw_role).ok_or(ParseError::InvalidField {
                field: "role",
                value: raw_role as u64,
            })?;
            let flags = reader.u8("handshake flags")?;
            let uri = reader.string("handshake uri")?;
            Message::Handshake(Handshake {
                version,
                role,
                takeover: flags & FLAG_TAKEOVER != 0,
                uri,
            })
        }
        class::FRAME_SEGMENT => Message::Segment(decode_segment(&mut reader, max_tiles)?),
        class::COMMAND => {
            let raw = reader.rest();
            let text = String::from_utf8(raw.to_vec())
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Message::Command(text)
        }
        class::HANDSHAKE_ACK => Message::HandshakeAck {
            uri: reader.string("uri")?,
        },
        class::EVENT => {
            let raw_kind = reader.u8("event kind")?;
            let kind = EventKind::from_u8(raw_kind).ok_or(ParseError::InvalidField {
                field: "event kind",
                value: raw_kind as u64,
            })?;
            let event = InteractionEvent {
                kind,
                x: reader.f64("event x")?,
                y: reader.f64("event y")?,
                dx: reader.f64("event dx")?,
                dy: reader.f64("event dy")?,
            };
            Message::Event {
                uri: reader.string("uri")?,
                event,
            }
        }
        class::SIZE_HINTS_ACK => {
            let mut values = [0u32; 6];
            for value in values.iter_mut() {
                *value = reader.u32("size hints")?;
            }
            Message::SizeHintsAck {
                hints: SizeHints::from_array(values),
                uri: reader.string("uri")?,
            }
        }
        class::EVENT_REGISTRATION_REPLY => {
            let success = reader.u8("registration result")? != 0;
            Message::EventRegistrationReply {
                success,
                uri: reader.string("uri")?,
            }
        }
        class::STREAM_CLOSED => Message::StreamClosed {
            uri: reader.string("uri")?,
        },
        other => return Err(ParseError::UnknownClass(other)),
    };

    reader.finish()?;
    Ok(message)
}

fn decode_segment(reader: &mut BodyReader, max_tiles: u32) -> ParseResult<FrameSegment> {
    let stream_uri = reader.string("segment uri")?;
    let frame_index = reader.u64("frame index")?;
    let tile_index = reader.u32("tile index")?;
    let total_tiles = reader.u32("total tiles")?;
    let payload_len = reader.u32("payload length")? as usize;

    if total_tiles == 0 {
        return Err(ParseError::InvalidSegment("frame has zero tiles".to_string()));
    }
    if total_tiles > max_tiles {
        return Err(ParseError::InvalidSegment(format!(
            "{} tiles exceeds the limit of {}",
            total_tiles, max_tiles
        )));
    }
    if tile_index >= total_tiles {
        return Err(ParseError::InvalidSegment(format!(
            "tile {} out of range for {} tiles",
            tile_index, total_tiles
        )));
    }
    if reader.remaining() != payload_len {
        return Err(ParseError::InvalidSegment(format!(
            "payload length {} does not match {} body bytes",
            payload_len,
            reader.remaining()
        )));
    }

    Ok(FrameSegment {
        stream_uri,
        frame_index,
        tile_index,
        total_tiles,
        payload: reader.bytes(payload_len, "payload")?,
    })
}

/// Bounds-checked reads over a message body.
struct BodyReader {
    body: Bytes,
}

impl BodyReader {
    fn need(&self, n: usize, what: &'static str) -> ParseResult<()> {
        if self.body.remaining() < n {
            Err(ParseError::Truncated(what))
        } else {
            Ok(())
        }
    }

    fn remaining(&self) -> usize {
        self.body.remaining()
    }

    fn u8(&mut self, what: &'static str) -> ParseResult<u8> {
        self.need(1, what)?;
        Ok(self.body.get_u8())
    }

    fn u16(&mut self, what: &'static str) -> ParseResult<u16> {
        self.need(2, what)?;
        Ok(self.body.get_u16())
    }

    fn u32(&mut self, what: &'static str) -> ParseResult<u32> {
        self.need(4, what)?;
        Ok(self.body.get_u32())
    }

    fn u64(&mut self, what: &'static str) -> ParseResult<u64> {
        self.need(8, what)?;
        Ok(self.body.get_u64())
    }

    fn f64(&mut self, what: &'static str) -> ParseResult<f64> {
        self.need(8, what)?;
        Ok(self.body.get_f64())
    }

    fn bytes(&mut self, len: usize, what: &'static str) -> ParseResult<Bytes> {
        self.need(len, what)?;
        Ok(self.body.split_to(len))
    }

    fn string(&mut self, what: &'static str) -> ParseResult<String> {
        let len = self.u16(what)? as usize;
        let raw = self.bytes(len, what)?;
        String::from_utf8(raw.to_vec()).map_err(|e| ParseError::InvalidUtf8(e.to_string()))
    }

    fn rest(&mut self) -> Bytes {
        let len = self.body.remaining();
        self.body.split_to(len)
    }

    fn finish(self) -> ParseResult<()> {
        match self.body.remaining() {
            0 => Ok(()),
            n => Err(ParseError::TrailingBytes(n)),
        }
    }
}
