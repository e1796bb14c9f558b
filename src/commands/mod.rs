//! Command Handler Module
//!
//! This module implements the command layer of the relay. Peers send
//! command lines alongside their frame traffic; each line is parsed into
//! a `CommandType`, a stream URI and arguments, then routed to the single
//! handler registered for that type.
//!
//! ## Architecture
//!
//! ```text
//! Peer COMMAND message
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  Command::parse │  (types)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (handler)
//! │                 │
//! │  - Lookup       │
//! │  - Invoke       │
//! │  - Log failures │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ Built-in or     │  (builtin)
//! │ compositor hook │
//! └─────────────────┘
//! ```
//!
//! ## Built-in Commands
//!
//! - `bind`, `event-subscribe`, `size-hint-update`, `close`
//!
//! `focus` and `web` are parsed but have no built-in handler.

pub mod builtin;
pub mod handler;
pub mod types;

// Re-export the main command types
pub use builtin::register_builtin_handlers;
pub use handler::{CommandHandler, CommandStats, Handler};
pub use types::{Command, CommandError, CommandOrigin, CommandType};
