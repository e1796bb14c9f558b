//! Relay Wire Message Types
//!
//! This module defines the messages exchanged between producers, observers
//! and the relay. Every message is a small fixed header followed by a body:
//!
//! ```text
//! ┌──────────┬────────────────┬──────────────────────────────┐
//! │ class u8 │ length u32 BE  │ body (length bytes)          │
//! └──────────┴────────────────┴──────────────────────────────┘
//! ```
//!
//! Strings inside a body are encoded as a `u16` length followed by UTF-8
//! bytes. All integers are big-endian.
//!
//! ## Message Classes
//!
//! Peer to relay:
//! - `0x01` Handshake: `version u8, role u8, flags u8, uri`
//! - `0x02` Frame segment: `uri, frame u64, tile u32, total u32, len u32, payload`
//! - `0x03` Command: a UTF-8 text line `<TYPE> <URI> [<ARGS...>]`
//!
//! Relay to peer:
//! - `0x10` Handshake acknowledgement: `uri`
//! - `0x11` Interaction event: `kind u8, x f64, y f64, dx f64, dy f64, uri`
//! - `0x12` Size hints acknowledgement: `6 x u32, uri`
//! - `0x13` Event registration reply: `success u8, uri`
//! - `0x14` Stream closed: `uri`

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Version of the wire protocol and command grammar spoken by this relay.
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed message header (class byte + body length).
pub const HEADER_LEN: usize = 5;

/// Longest URI that fits the `u16` string encoding.
pub const MAX_URI_LEN: usize = u16::MAX as usize;

/// Returns true if `uri` is non-empty and fits the wire string encoding.
pub fn is_encodable_uri(uri: &str) -> bool {
    !uri.is_empty() && uri.len() <= MAX_URI_LEN
}

/// Handshake flag requesting forced takeover of a bound URI.
pub const FLAG_TAKEOVER: u8 = 0b0000_0001;

/// Message class bytes
pub mod class {
    pub const HANDSHAKE: u8 = 0x01;
    pub const FRAME_SEGMENT: u8 = 0x02;
    pub const COMMAND: u8 = 0x03;
    pub const HANDSHAKE_ACK: u8 = 0x10;
    pub const EVENT: u8 = 0x11;
    pub const SIZE_HINTS_ACK: u8 = 0x12;
    pub const EVENT_REGISTRATION_REPLY: u8 = 0x13;
    pub const STREAM_CLOSED: u8 = 0x14;

    /// Returns true if `class` is a known message class.
    pub fn is_known(class: u8) -> bool {
        matches!(
            class,
            HANDSHAKE
                | FRAME_SEGMENT
                | COMMAND
                | HANDSHAKE_ACK
                | EVENT
                | SIZE_HINTS_ACK
                | EVENT_REGISTRATION_REPLY
                | STREAM_CLOSED
        )
    }
}

/// The role a peer declares in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Streams frames and owns the stream identity.
    Producer,
    /// Attaches to an existing stream to receive its events.
    Observer,
}

impl Role {
    pub fn as_u8(self) -> u8 {
        match self {
            Role::Producer => 0,
            Role::Observer => 1,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Role::Producer),
            1 => Some(Role::Observer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Observer => write!(f, "observer"),
        }
    }
}

/// First message on every connection: who the peer is and which stream it is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: u8,
    pub role: Role,
    pub takeover: bool,
    pub uri: String,
}

impl Handshake {
    /// Handshake for a producer that refuses to displace a live stream.
    pub fn producer(uri: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            role: Role::Producer,
            takeover: false,
            uri: uri.into(),
        }
    }

    /// Handshake for an observer of an existing stream.
    pub fn observer(uri: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            role: Role::Observer,
            takeover: false,
            uri: uri.into(),
        }
    }

    /// Requests forced takeover if the URI is already bound.
    pub fn with_takeover(mut self) -> Self {
        self.takeover = true;
        self
    }
}

/// One tile of one frame.
///
/// The payload is opaque to the relay (usually a compressed image tile).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSegment {
    pub stream_uri: String,
    pub frame_index: u64,
    pub tile_index: u32,
    pub total_tiles: u32,
    pub payload: Bytes,
}

impl FrameSegment {
    pub fn new(
        stream_uri: impl Into<String>,
        frame_index: u64,
        tile_index: u32,
        total_tiles: u32,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            stream_uri: stream_uri.into(),
            frame_index,
            tile_index,
            total_tiles,
            payload: payload.into(),
        }
    }
}

/// Kinds of interaction events relayed back to producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Press,
    Move,
    Release,
    Wheel,
    Resize,
}

impl EventKind {
    pub fn as_u8(self) -> u8 {
        match self {
            EventKind::Press => 0,
            EventKind::Move => 1,
            EventKind::Release => 2,
            EventKind::Wheel => 3,
            EventKind::Resize => 4,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(EventKind::Press),
            1 => Some(EventKind::Move),
            2 => Some(EventKind::Release),
            3 => Some(EventKind::Wheel),
            4 => Some(EventKind::Resize),
            _ => None,
        }
    }
}

/// An interaction event from the wall.
///
/// Pointer coordinates are normalized to `[0, 1]` over the stream's
/// window. For `Resize`, `x` and `y` carry the new width and height in
/// pixels; for `Wheel`, `dy` carries the vertical scroll delta.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InteractionEvent {
    pub kind: EventKind,
    pub x: f64,
    pub y: f64,
    pub dx: f64,
    pub dy: f64,
}

impl InteractionEvent {
    fn pointer(kind: EventKind, x: f64, y: f64) -> Self {
        Self {
            kind,
            x,
            y,
            dx: 0.0,
            dy: 0.0,
        }
    }

    pub fn press(x: f64, y: f64) -> Self {
        Self::pointer(EventKind::Press, x, y)
    }

    pub fn moved(x: f64, y: f64) -> Self {
        Self::pointer(EventKind::Move, x, y)
    }

    pub fn release(x: f64, y: f64) -> Self {
        Self::pointer(EventKind::Release, x, y)
    }

    pub fn wheel(x: f64, y: f64, delta_y: f64) -> Self {
        Self {
            kind: EventKind::Wheel,
            x,
            y,
            dx: 0.0,
            dy: delta_y,
        }
    }

    pub fn resize(width: f64, height: f64) -> Self {
        Self::pointer(EventKind::Resize, width, height)
    }
}

/// Producer-declared layout constraints for one stream.
///
/// A value of `0` means "unspecified".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SizeHints {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub preferred_width: u32,
    pub preferred_height: u32,
}

impl SizeHints {
    /// The six values in wire order.
    pub fn to_array(&self) -> [u32; 6] {
        [
            self.min_width,
            self.min_height,
            self.max_width,
            self.max_height,
            self.preferred_width,
            self.preferred_height,
        ]
    }

    pub fn from_array(values: [u32; 6]) -> Self {
        Self {
            min_width: values[0],
            min_height: values[1],
            max_width: values[2],
            max_height: values[3],
            preferred_width: values[4],
            preferred_height: values[5],
        }
    }
}

/// A message on the relay wire, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Handshake(Handshake),
    Segment(FrameSegment),
    Command(String),
    HandshakeAck { uri: String },
    Event { uri: String, event: InteractionEvent },
    SizeHintsAck { uri: String, hints: SizeHints },
    EventRegistrationReply { uri: String, success: bool },
    StreamClosed { uri: String },
}

impl Message {
    /// The class byte written in the header.
    pub fn class(&self) -> u8 {
        match self {
            Message::Handshake(_) => class::HANDSHAKE,
            Message::Segment(_) => class::FRAME_SEGMENT,
            Message::Command(_) => class::COMMAND,
            Message::HandshakeAck { .. } => class::HANDSHAKE_ACK,
            Message::Event { .. } => class::EVENT,
            Message::SizeHintsAck { .. } => class::SIZE_HINTS_ACK,
            Message::EventRegistrationReply { .. } => class::EVENT_REGISTRATION_REPLY,
            Message::StreamClosed { .. } => class::STREAM_CLOSED,
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::Segment(_) => "frame-segment",
            Message::Command(_) => "command",
            Message::HandshakeAck { .. } => "handshake-ack",
            Message::Event { .. } => "event",
            Message::SizeHintsAck { .. } => "size-hints-ack",
            Message::EventRegistrationReply { .. } => "event-registration-reply",
            Message::StreamClosed { .. } => "stream-closed",
        }
    }

    /// Returns true for messages a peer may send to the relay.
    pub fn is_from_peer(&self) -> bool {
        matches!(
            self,
            Message::Handshake(_) | Message::Segment(_) | Message::Command(_)
        )
    }

    /// Serializes the message (header included) to bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.to_vec()
    }

    /// Appends the serialized message to `buf`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        let mut body = BytesMut::new();
        self.write_body(&mut body);

        buf.reserve(HEADER_LEN + body.len());
        buf.put_u8(self.class());
        buf.put_u32(body.len() as u32);
        buf.extend_from_slice(&body);
    }

    fn write_body(&self, body: &mut BytesMut) {
        match self {
            Message::Handshake(handshake) => {
                body.put_u8(handshake.version);
                body.put_u8(handshake.role.as_u8());
                body.put_u8(if handshake.takeover { FLAG_TAKEOVER } else { 0 });
                put_str(body, &handshake.uri);
            }
            Message::Segment(segment) => {
                put_str(body, &segment.stream_uri);
                body.put_u64(segment.frame_index);
                body.put_u32(segment.tile_index);
                body.put_u32(segment.total_tiles);
                body.put_u32(segment.payload.len() as u32);
                body.extend_from_slice(&segment.payload);
            }
            Message::Command(text) => {
                body.extend_from_slice(text.as_bytes());
            }
            Message::HandshakeAck { uri } | Message::StreamClosed { uri } => {
                put_str(body, uri);
            }
            Message::Event { uri, event } => {
                body.put_u8(event.kind.as_u8());
                body.put_f64(event.x);
                body.put_f64(event.y);
                body.put_f64(event.dx);
                body.put_f64(event.dy);
                put_str(body, uri);
            }
            Message::SizeHintsAck { uri, hints } => {
                for value in hints.to_array() {
                    body.put_u32(value);
                }
                put_str(body, uri);
            }
            Message::EventRegistrationReply { uri, success } => {
                body.put_u8(u8::from(*success));
                put_str(body, uri);
            }
        }
    }
}

/// Writes a `u16`-length-prefixed string.
///
/// The registry and client refuse URIs over `MAX_URI_LEN`. Should one get
/// through anyway, it is cut at a char boundary so the peer can still decode it.
fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= MAX_URI_LEN, "uri of {} bytes reached the encoder", s.len());
    let mut end = s.len().min(MAX_URI_LEN);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let bytes = &s.as_bytes()[..end];
    buf.put_u16(bytes.len() as u16);
    buf.extend_from_slice(bytes);
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Handshake(h) => write!(f, "handshake {} {}", h.role, h.uri),
            Message::Segment(s) => write!(
                f,
                "segment {} frame {} tile {}/{} ({} bytes)",
                s.stream_uri,
                s.frame_index,
                s.tile_index + 1,
                s.total_tiles,
                s.payload.len()
            ),
            Message::Command(text) => write!(f, "command \"{}\"", text),
            Message::HandshakeAck { uri } => write!(f, "handshake-ack {}", uri),
            Message::Event { uri, event } => write!(f, "event {:?} {}", event.kind, uri),
            Message::SizeHintsAck { uri, .. } => write!(f, "size-hints-ack {}", uri),
            Message::EventRegistrationReply { uri, success } => {
                write!(f, "event-registration-reply {} {}", uri, success)
            }
            Message::StreamClosed { uri } => write!(f, "stream-closed {}", uri),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let bytes = Message::StreamClosed {
            uri: "a".to_string(),
        }
        .serialize();

        assert_eq!(bytes[0], class::STREAM_CLOSED);
        assert_eq!(&bytes[1..5], &3u32.to_be_bytes());
        assert_eq!(&bytes[5..], &[0, 1, b'a']);
    }

    #[test]
    fn test_handshake_serialize() {
        let bytes =
            Message::Handshake(Handshake::producer("wall/demo").with_takeover()).serialize();

        assert_eq!(bytes[0], class::HANDSHAKE);
        assert_eq!(bytes[5], PROTOCOL_VERSION);
        assert_eq!(bytes[6], Role::Producer.as_u8());
        assert_eq!(bytes[7], FLAG_TAKEOVER);
        assert_eq!(&bytes[8..10], &9u16.to_be_bytes());
        assert_eq!(&bytes[10..], b"wall/demo");
    }

    #[test]
    fn test_segment_serialize() {
        let segment = FrameSegment::new("s", 7, 1, 3, Bytes::from_static(b"xyz"));
        let bytes = Message::Segment(segment).serialize();

        // uri(2+1) + frame(8) + tile(4) + total(4) + len(4) + payload(3)
        assert_eq!(&bytes[1..5], &26u32.to_be_bytes());
        assert_eq!(&bytes[8..16], &7u64.to_be_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_be_bytes());
        assert_eq!(&bytes[20..24], &3u32.to_be_bytes());
        assert_eq!(&bytes[24..28], &3u32.to_be_bytes());
        assert_eq!(&bytes[28..], b"xyz");
    }

    #[test]
    fn test_command_body_is_text() {
        let bytes = Message::Command("close wall/demo".to_string()).serialize();
        assert_eq!(&bytes[5..], b"close wall/demo");
    }

    #[test]
    fn test_peer_direction() {
        assert!(Message::Command(String::new()).is_from_peer());
        assert!(!Message::HandshakeAck {
            uri: "x".to_string()
        }
        .is_from_peer());
    }

    #[test]
    fn test_size_hints_array() {
        let hints = SizeHints::from_array([1, 2, 3, 4, 5, 6]);
        assert_eq!(hints.preferred_width, 5);
        assert_eq!(hints.to_array(), [1, 2, 3, 4, 5, 6]);
    }
}
