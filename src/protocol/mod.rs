//! Relay Wire Protocol
//!
//! This module implements the length-prefixed binary protocol spoken between
//! stream producers, observers and the relay.
//!
//! ## Modules
//!
//! - `types`: Defines the `Message` enum, its payload types and serialization
//! - `parser`: Incremental zero-copy decoder for incoming bytes
//!
//! ## Example
//!
//! ```
//! use pixelrelay::protocol::{FrameSegment, Message, parse_message};
//!
//! let segment = FrameSegment::new("wall/demo", 0, 0, 1, &b"tile"[..]);
//! let bytes = Message::Segment(segment.clone()).serialize();
//!
//! let (message, consumed) = parse_message(&bytes).unwrap().unwrap();
//! assert_eq!(message, Message::Segment(segment));
//! assert_eq!(consumed, bytes.len());
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{
    parse_message, MessageParser, ParseError, ParseResult, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_MAX_TILES_PER_FRAME,
};
pub use types::{
    is_encodable_uri, EventKind, FrameSegment, Handshake, InteractionEvent, Message, Role,
    SizeHints, HEADER_LEN, MAX_URI_LEN, PROTOCOL_VERSION,
};
