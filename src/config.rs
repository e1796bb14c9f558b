//! Relay configuration.

use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_TILES_PER_FRAME};
use std::time::Duration;

/// Default port peers connect to.
pub const DEFAULT_PORT: u16 = 1701;

/// Default bind address.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Service name for local-network discovery.
pub const SERVICE_NAME: &str = "_deflect._tcp";

/// Default time a new connection has to complete its handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings for a relay `Server`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on; 0 picks a free port
    pub port: u16,
    /// How long a connection may take to send its handshake
    pub handshake_timeout: Duration,
    /// Largest message body accepted from a peer
    pub max_message_size: usize,
    /// Largest tile count a frame may declare
    pub max_tiles_per_frame: u32,
    /// Discovery service name
    pub service_name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_tiles_per_frame: DEFAULT_MAX_TILES_PER_FRAME,
            service_name: SERVICE_NAME.to_string(),
        }
    }
}

impl RelayConfig {
    /// Config listening on `port` with every other setting at its default.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Loopback config on an ephemeral port.
    pub fn local() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Self::default()
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
