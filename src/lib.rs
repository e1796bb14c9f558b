//! # pixelrelay - A Pixel-Stream Relay for Display Walls
//!
//! pixelrelay accepts connections from remote applications that stream
//! rendered frames (cut into tiles) and hands the freshest complete frame
//! of each stream to a wall compositor. The compositor sends interaction
//! events and size-hint acknowledgements back to the producers through the
//! same connections.
//!
//! ## Features
//!
//! - **Freshest frame wins**: producers never block on a slow consumer, and
//!   the consumer never sees queued stale frames
//! - **Out-of-order tiles**: frames reassemble regardless of tile arrival order
//! - **Pluggable commands**: one handler per command type, swappable at runtime
//! - **Async I/O**: Built on Tokio, one lightweight task per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              pixelrelay                                 │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │   Server    │───>│ Connection  │───>│  Command    │                  │
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │                  │
//! │  └─────────────┘    └──────┬──────┘    └──────┬──────┘                  │
//! │                            │                  │                         │
//! │                            ▼                  ▼                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐   │
//! │  │   Wire      │    │              StreamRegistry                  │   │
//! │  │  Protocol   │    │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │  │             │    │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │   │
//! │  └─────────────┘    │  │RwLock  │ │RwLock  │ │RwLock  │ │shards  │ │   │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │                     └──────────────────────────────────────────────┘   │
//! │                                               ▲                         │
//! │                                               │                         │
//! │                     ┌─────────────────────────┴───────────────────────┐ │
//! │                     │  FrameDispatcher ──▶ Notifier ──▶ compositor    │ │
//! │                     └─────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use pixelrelay::{Notification, RelayConfig, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), pixelrelay::RelayError> {
//!     let server = Server::start(RelayConfig::default()).await?;
//!     let mut notifications = server.subscribe();
//!
//!     while let Some(notification) = notifications.recv().await {
//!         if let Notification::FrameReady { uri } = notification {
//!             if let Some(frame) = server.frame_dispatcher().take_latest_frame(&uri) {
//!                 draw(&uri, frame.into_payload());
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: wire messages, encoder and incremental decoder
//! - [`registry`]: the URI-indexed stream table
//! - [`dispatcher`]: frame reassembly and delivery
//! - [`commands`]: command grammar, dispatch and built-in handlers
//! - [`connection`]: per-connection state machine
//! - [`server`]: listener and compositor-facing API
//! - [`client`]: producer/observer client
//!
//! ## Design Highlights
//!
//! ### Per-Stream Locking
//!
//! The registry index is sharded; each stream's state sits behind its own
//! mutex. Segment ingestion, frame pulls and commands lock only the target
//! stream, so streams never contend with each other.
//!
//! ### Connections Owned by Their Stream
//!
//! A stream entry holds the send queue of its producer and observers.
//! Removing the entry drops those queues, which is what closes the
//! connections. Event subscribers are plain connection ids.

pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod server;

// Re-export commonly used types for convenience
pub use client::{ClientError, RelayClient};
pub use commands::{Command, CommandError, CommandHandler, CommandOrigin, CommandType};
pub use config::{RelayConfig, DEFAULT_HOST, DEFAULT_PORT, SERVICE_NAME};
pub use connection::{handle_connection, ConnectionStats};
pub use dispatcher::{Frame, FrameDispatcher};
pub use error::RelayError;
pub use notify::Notification;
pub use protocol::{FrameSegment, InteractionEvent, Message, ParseError, SizeHints};
pub use registry::{RegistryError, StreamRegistry};
pub use server::Server;

/// Version of pixelrelay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
