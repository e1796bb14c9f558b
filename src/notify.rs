//! Compositor Notifications
//!
//! The wall's compositor does not touch sockets. It attaches listeners and
//! receives notifications about stream lifecycle, frames and metadata,
//! then pulls frames and pushes events through the `Server` API.

use crate::protocol::SizeHints;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// Something the compositor may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A producer completed its handshake and the stream is live.
    StreamOpened { uri: String },
    /// A new frame is ready to be pulled.
    FrameReady { uri: String },
    /// The stream is gone. Emitted once per stream.
    StreamClosed { uri: String },
    /// Outcome of an event subscription request.
    EventSubscription { uri: String, success: bool },
    /// The producer declared new size hints.
    SizeHintsChanged { uri: String, hints: SizeHints },
}

impl Notification {
    pub fn uri(&self) -> &str {
        match self {
            Notification::StreamOpened { uri }
            | Notification::FrameReady { uri }
            | Notification::StreamClosed { uri }
            | Notification::EventSubscription { uri, .. }
            | Notification::SizeHintsChanged { uri, .. } => uri,
        }
    }
}

/// Fan-out of notifications to every attached listener.
///
/// Listeners whose receiver was dropped are pruned on the next send.
#[derive(Debug, Default)]
pub struct Notifier {
    listeners: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new listener.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    pub fn notify(&self, notification: Notification) {
        trace!(?notification, "Notify");
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|tx| tx.send(notification.clone()).is_ok());
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}
