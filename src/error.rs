//! Top-level relay errors.

use crate::registry::RegistryError;
use thiserror::Error;

/// Errors surfaced by the `Server` API.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// No live stream is registered under the URI
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// A registry operation was refused
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// I/O error outside a single connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
