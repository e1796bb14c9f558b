//! Relay Server
//!
//! `Server` owns the listening socket and the shared relay state. The
//! compositor drives everything through it: it listens for notifications,
//! pulls frames from the `FrameDispatcher`, wires extra command handlers
//! into the `CommandHandler` and pushes events and size-hint
//! acknowledgements back to producers.
//!
//! ```text
//!   accept loop ──spawn──▶ ConnectionHandler (one task per peer)
//!        │                        │
//!        ▼                        ▼
//!   RelayContext ─── registry / dispatcher / commands / notifier
//!        ▲
//!        │
//!   compositor ── subscribe(), take_latest_frame(), send_event(), ...
//! ```

use crate::commands::{register_builtin_handlers, CommandHandler};
use crate::config::RelayConfig;
use crate::connection::{handle_connection, ConnectionStats};
use crate::dispatcher::FrameDispatcher;
use crate::error::RelayError;
use crate::notify::{Notification, Notifier};
use crate::protocol::{InteractionEvent, Message, SizeHints};
use crate::registry::{ConnectionId, Outbound, StreamRegistry};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// State shared by the server and every connection task.
#[derive(Debug)]
pub struct RelayContext {
    pub config: RelayConfig,
    pub registry: Arc<StreamRegistry>,
    pub dispatcher: Arc<FrameDispatcher>,
    pub commands: Arc<CommandHandler>,
    pub notifier: Arc<Notifier>,
    pub stats: Arc<ConnectionStats>,
    next_id: AtomicU64,
}

impl RelayContext {
    /// Builds the relay state with the built-in command handlers installed.
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(StreamRegistry::new());
        let notifier = Arc::new(Notifier::new());
        let dispatcher = Arc::new(FrameDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&notifier),
        ));
        let commands = Arc::new(CommandHandler::new());
        register_builtin_handlers(&commands, &registry, &dispatcher, &notifier);

        Self {
            config,
            registry,
            dispatcher,
            commands,
            notifier,
            stats: Arc::new(ConnectionStats::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocates an id for a new connection. Never returns `ConnectionId::LOCAL`.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// A running relay.
///
/// Dropping the server stops accepting and closes every connection.
pub struct Server {
    ctx: Arc<RelayContext>,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("streams", &self.ctx.registry.len())
            .finish()
    }
}

impl Server {
    /// Binds the listening socket and starts accepting peers.
    ///
    /// Fails with `RelayError::Bind` if the address is unavailable.
    pub async fn start(config: RelayConfig) -> Result<Self, RelayError> {
        let addr = config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let ctx = Arc::new(RelayContext::new(config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&ctx), shutdown_rx));

        info!(addr = %local_addr, service = %ctx.config.service_name, "Relay listening");

        Ok(Self {
            ctx,
            local_addr,
            shutdown_tx,
            accept_task: Some(accept_task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.ctx.config
    }

    /// The command handler, for registering compositor handlers.
    pub fn command_handler(&self) -> &Arc<CommandHandler> {
        &self.ctx.commands
    }

    /// The frame dispatcher, for pulling frames.
    pub fn frame_dispatcher(&self) -> &Arc<FrameDispatcher> {
        &self.ctx.dispatcher
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.ctx.registry
    }

    pub fn connection_stats(&self) -> &Arc<ConnectionStats> {
        &self.ctx.stats
    }

    /// Attaches a notification listener.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        self.ctx.notifier.subscribe()
    }

    /// Relays an interaction event to the stream's event subscribers.
    ///
    /// Returns how many subscribers it was queued for.
    pub fn send_event(&self, uri: &str, event: InteractionEvent) -> Result<usize, RelayError> {
        let entry = self
            .ctx
            .registry
            .find(uri)
            .ok_or_else(|| RelayError::StreamNotFound(uri.to_string()))?;

        let delivered = entry.lock().unwrap().send_event(&event);
        debug!(uri = %uri, kind = ?event.kind, delivered, "Relayed event");
        Ok(delivered)
    }

    /// Echoes the size hints the compositor accepted to the stream's producer.
    pub fn acknowledge_size_hints(&self, uri: &str, hints: SizeHints) -> Result<(), RelayError> {
        let entry = self
            .ctx
            .registry
            .find(uri)
            .ok_or_else(|| RelayError::StreamNotFound(uri.to_string()))?;

        let sent = entry
            .lock()
            .unwrap()
            .send_to_producer(Outbound::Message(Message::SizeHintsAck {
                uri: uri.to_string(),
                hints,
            }));

        if !sent {
            return Err(RelayError::StreamNotFound(uri.to_string()));
        }
        Ok(())
    }

    /// Closes a stream from the compositor side.
    ///
    /// The producer and observers are disconnected. Returns false if no
    /// such stream exists.
    pub fn close_stream(&self, uri: &str) -> bool {
        self.ctx.dispatcher.close_stream(uri)
    }

    /// Stops accepting, closes every connection and waits for the accept loop.
    pub async fn shutdown(mut self) {
        info!(addr = %self.local_addr, "Shutting down relay");
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Accept loop panicked");
            }
        }

        for entry in self.ctx.registry.clear() {
            self.ctx.dispatcher.retire(&entry);
        }
        info!("Relay shutdown complete");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Accepts peers until shutdown, one task per connection.
async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let ctx = Arc::clone(&ctx);
                    let shutdown = shutdown.clone();

                    // Spawn a task to handle this connection
                    tokio::spawn(async move {
                        handle_connection(stream, addr, ctx, shutdown).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Accept loop stopped");
}
