//! Stream Registry Module
//!
//! This module maps stream identities (URIs) to the per-stream state the
//! relay keeps: the producer's connection handle, observers, event
//! subscribers, size hints and buffered frames.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StreamRegistry                          │
//! │         sharded uri -> Arc<Mutex<StreamEntry>>              │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      StreamEntry                            │
//! │  producer handle │ observers │ subscribers │ frame state    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The registry performs no I/O. Connections are reached through
//! `PeerHandle`s, which only queue messages for the connection's task.

pub mod entry;
#[allow(clippy::module_inception)]
pub mod registry;

// Re-export commonly used types
pub use entry::{ConnectionId, Outbound, PeerHandle, StreamEntry, SubscriptionRefusal};
pub use registry::{Attached, RegistryError, RegistryStats, SharedEntry, StreamRegistry};
