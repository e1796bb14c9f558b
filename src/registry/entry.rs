//! Per-Stream State
//!
//! A `StreamEntry` is the registry's unit of per-URI state. It owns the
//! producer's send queue handle, the buffered frame state, the observers
//! attached to the stream and the set of event subscribers.
//!
//! Subscribers are stored as connection ids, never as handles: a
//! subscriber can only be reached through the producer or observer handle
//! registered under the same id, so a subscriber whose connection went away
//! is simply skipped and then dropped when it detaches.

use crate::dispatcher::frame::FrameState;
use crate::protocol::{InteractionEvent, Message, SizeHints};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::trace;

/// Identifies one transport connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Commands issued in-process by the compositor rather than a peer.
    pub const LOCAL: ConnectionId = ConnectionId(0);

    pub fn new(raw: u64) -> Self {
        ConnectionId(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "local")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Items queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialize and write to the peer.
    Message(Message),
    /// The peer's stream was renamed; adopt `uri` before the next message.
    Rebind { uri: String },
}

/// Handle to one connection's send queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PeerHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues an item; returns false if the connection is gone.
    pub fn send(&self, item: Outbound) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Why an event subscription was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionRefusal {
    /// The requester is neither the producer nor an observer of the stream.
    NotAttached,
    /// An exclusive subscription conflicts with an existing subscriber.
    Exclusive,
}

/// State the registry keeps for one stream URI.
#[derive(Debug)]
pub struct StreamEntry {
    uri: String,
    producer: Option<PeerHandle>,
    observers: HashMap<ConnectionId, PeerHandle>,
    subscribers: HashSet<ConnectionId>,
    exclusive: bool,
    size_hints: SizeHints,
    frames: FrameState,
    closed: bool,
    created_at: Instant,
}

impl StreamEntry {
    /// Creates the entry for a newly bound producer.
    pub fn new(uri: impl Into<String>, producer: PeerHandle) -> Self {
        Self {
            uri: uri.into(),
            producer: Some(producer),
            observers: HashMap::new(),
            subscribers: HashSet::new(),
            exclusive: false,
            size_hints: SizeHints::default(),
            frames: FrameState::default(),
            closed: false,
            created_at: Instant::now(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub(crate) fn set_uri(&mut self, uri: String) {
        self.uri = uri;
    }

    pub fn producer_id(&self) -> Option<ConnectionId> {
        self.producer.as_ref().map(PeerHandle::id)
    }

    pub fn is_owned_by(&self, id: ConnectionId) -> bool {
        self.producer_id() == Some(id)
    }

    /// A stream is live while it has a producer and has not been closed.
    pub fn is_live(&self) -> bool {
        self.producer.is_some() && !self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Marks the stream closed. Returns false if it already was.
    pub(crate) fn mark_closed(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    pub fn size_hints(&self) -> SizeHints {
        self.size_hints
    }

    pub(crate) fn set_size_hints(&mut self, hints: SizeHints) {
        self.size_hints = hints;
    }

    pub(crate) fn frames_mut(&mut self) -> &mut FrameState {
        &mut self.frames
    }

    /// Returns true if a complete frame awaits the consumer.
    pub fn has_latest_frame(&self) -> bool {
        self.frames.has_latest()
    }

    pub fn has_pending_frame(&self) -> bool {
        self.frames.has_pending() || self.frames.has_latest()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn add_observer(&mut self, observer: PeerHandle) {
        self.observers.insert(observer.id(), observer);
    }

    /// Detaches an observer and drops its subscription.
    pub(crate) fn remove_observer(&mut self, id: ConnectionId) -> bool {
        self.unsubscribe(id);
        self.observers.remove(&id).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn is_attached(&self, id: ConnectionId) -> bool {
        self.is_owned_by(id) || self.observers.contains_key(&id)
    }

    fn peer(&self, id: ConnectionId) -> Option<&PeerHandle> {
        match &self.producer {
            Some(producer) if producer.id() == id => Some(producer),
            _ => self.observers.get(&id),
        }
    }

    /// Adds `id` to the event subscribers.
    ///
    /// Re-subscribing is idempotent. An exclusive stream refuses any other
    /// subscriber, and an exclusive request is refused while others exist.
    pub fn subscribe(
        &mut self,
        id: ConnectionId,
        exclusive: bool,
    ) -> Result<(), SubscriptionRefusal> {
        if !self.is_attached(id) {
            return Err(SubscriptionRefusal::NotAttached);
        }

        let others = self.subscribers.iter().any(|s| *s != id);
        if others && (self.exclusive || exclusive) {
            return Err(SubscriptionRefusal::Exclusive);
        }

        self.subscribers.insert(id);
        self.exclusive |= exclusive;
        Ok(())
    }

    pub fn unsubscribe(&mut self, id: ConnectionId) -> bool {
        let removed = self.subscribers.remove(&id);
        if self.subscribers.is_empty() {
            self.exclusive = false;
        }
        removed
    }

    pub fn subscribers(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.subscribers.iter().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// Queues an item for one attached connection.
    pub fn send_to(&self, id: ConnectionId, item: Outbound) -> bool {
        self.peer(id).map(|peer| peer.send(item)).unwrap_or(false)
    }

    /// Queues an item for the producer.
    pub fn send_to_producer(&self, item: Outbound) -> bool {
        self.producer
            .as_ref()
            .map(|producer| producer.send(item))
            .unwrap_or(false)
    }

    /// Relays an interaction event to every subscriber.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn send_event(&self, event: &InteractionEvent) -> usize {
        let message = Message::Event {
            uri: self.uri.clone(),
            event: *event,
        };

        self.subscribers
            .iter()
            .filter(|id| self.send_to(**id, Outbound::Message(message.clone())))
            .count()
    }

    /// Tells the producer and every observer that the stream was renamed.
    pub(crate) fn broadcast_rebind(&self) {
        let item = Outbound::Rebind {
            uri: self.uri.clone(),
        };
        self.send_to_producer(item.clone());
        for observer in self.observers.values() {
            observer.send(item.clone());
        }
    }

    /// Releases the connections held by this entry.
    ///
    /// Observers are told the stream closed before their handles are
    /// dropped; once every handle is gone their connections wind down.
    pub(crate) fn release(&mut self) {
        let closed = Message::StreamClosed {
            uri: self.uri.clone(),
        };

        for (id, observer) in self.observers.drain() {
            trace!(uri = %self.uri, observer = %id, "Notifying observer of closure");
            observer.send(Outbound::Message(closed.clone()));
        }

        self.producer = None;
        self.subscribers.clear();
        self.exclusive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: u64) -> (PeerHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerHandle::new(ConnectionId::new(id), tx), rx)
    }

    #[test]
    fn test_new_entry_is_live() {
        let (producer, _rx) = peer(1);
        let entry = StreamEntry::new("s", producer);

        assert!(entry.is_live());
        assert!(entry.is_owned_by(ConnectionId::new(1)));
        assert!(!entry.is_owned_by(ConnectionId::new(2)));
        assert_eq!(entry.size_hints(), SizeHints::default());
    }

    #[test]
    fn test_mark_closed_once() {
        let (producer, _rx) = peer(1);
        let mut entry = StreamEntry::new("s", producer);

        assert!(entry.mark_closed());
        assert!(!entry.mark_closed());
        assert!(!entry.is_live());
    }

    #[test]
    fn test_exclusive_subscription_rejects_second() {
        let (producer, _p) = peer(1);
        let (observer, _o) = peer(2);
        let mut entry = StreamEntry::new("s", producer);
        entry.add_observer(observer);

        assert_eq!(entry.subscribe(ConnectionId::new(1), true), Ok(()));
        assert_eq!(
            entry.subscribe(ConnectionId::new(2), false),
            Err(SubscriptionRefusal::Exclusive)
        );
        assert_eq!(entry.subscribers(), vec![ConnectionId::new(1)]);
        assert!(entry.is_exclusive());
    }

    #[test]
    fn test_exclusive_request_rejected_when_shared() {
        let (producer, _p) = peer(1);
        let (observer, _o) = peer(2);
        let mut entry = StreamEntry::new("s", producer);
        entry.add_observer(observer);

        assert_eq!(entry.subscribe(ConnectionId::new(1), false), Ok(()));
        assert_eq!(
            entry.subscribe(ConnectionId::new(2), true),
            Err(SubscriptionRefusal::Exclusive)
        );
        assert_eq!(entry.subscribe(ConnectionId::new(2), false), Ok(()));
        assert_eq!(entry.subscribers().len(), 2);
    }

    #[test]
    fn test_resubscribe_is_idempotent() {
        let (producer, _p) = peer(1);
        let mut entry = StreamEntry::new("s", producer);

        assert_eq!(entry.subscribe(ConnectionId::new(1), true), Ok(()));
        assert_eq!(entry.subscribe(ConnectionId::new(1), true), Ok(()));
        assert_eq!(entry.subscribers().len(), 1);
    }

    #[test]
    fn test_unattached_subscriber_refused() {
        let (producer, _p) = peer(1);
        let mut entry = StreamEntry::new("s", producer);

        assert_eq!(
            entry.subscribe(ConnectionId::new(9), false),
            Err(SubscriptionRefusal::NotAttached)
        );
    }

    #[test]
    fn test_observer_removal_clears_exclusivity() {
        let (producer, _p) = peer(1);
        let (observer, _o) = peer(2);
        let mut entry = StreamEntry::new("s", producer);
        entry.add_observer(observer);

        entry.subscribe(ConnectionId::new(2), true).unwrap();
        assert!(entry.remove_observer(ConnectionId::new(2)));
        assert!(!entry.is_exclusive());
        assert_eq!(entry.subscribe(ConnectionId::new(1), false), Ok(()));
    }

    #[test]
    fn test_send_event_reaches_subscribers_only() {
        let (producer, mut producer_rx) = peer(1);
        let (observer, mut observer_rx) = peer(2);
        let mut entry = StreamEntry::new("s", producer);
        entry.add_observer(observer);
        entry.subscribe(ConnectionId::new(2), false).unwrap();

        let delivered = entry.send_event(&InteractionEvent::press(0.5, 0.5));
        assert_eq!(delivered, 1);

        assert!(producer_rx.try_recv().is_err());
        assert_eq!(
            observer_rx.try_recv().unwrap(),
            Outbound::Message(Message::Event {
                uri: "s".to_string(),
                event: InteractionEvent::press(0.5, 0.5),
            })
        );
    }

    #[test]
    fn test_release_notifies_observers_and_drops_handles() {
        let (producer, mut producer_rx) = peer(1);
        let (observer, mut observer_rx) = peer(2);
        let mut entry = StreamEntry::new("s", producer);
        entry.add_observer(observer);
        entry.subscribe(ConnectionId::new(2), false).unwrap();

        entry.release();

        assert_eq!(
            observer_rx.try_recv().unwrap(),
            Outbound::Message(Message::StreamClosed {
                uri: "s".to_string()
            })
        );
        assert!(matches!(
            observer_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(
            producer_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(entry.subscribers().is_empty());
    }
}
