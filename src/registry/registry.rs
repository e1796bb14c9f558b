//! Thread-Safe Stream Registry
//!
//! This module maps stream URIs to their `StreamEntry`. It is the only
//! global index in the relay; everything else is reached through an entry.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StreamRegistry                          │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ uri ->  │ │ uri ->  │ │ uri ->  │ │ uri ->  │           │
//! │  │ Arc<    │ │ Arc<    │ │ Arc<    │ │ Arc<    │           │
//! │  │  Mutex< │ │  Mutex< │ │  Mutex< │ │  Mutex< │           │
//! │  │  Entry>>│ │  Entry>>│ │  Entry>>│ │  Entry>>│           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Creation, removal and renaming take a shard's write lock briefly.
//! Segment ingestion, frame pulls and command handling clone the entry's
//! `Arc` under a read lock, release it, and lock only that entry.
//!
//! Lock order is always shard before entry; when two shards are needed
//! they are taken in ascending index order.

use crate::protocol::{is_encodable_uri, MAX_URI_LEN};
use crate::registry::entry::{ConnectionId, PeerHandle, StreamEntry};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Number of shards for the registry index.
const NUM_SHARDS: usize = 16;

/// A stream entry shared between the registry and its users.
pub type SharedEntry = Arc<Mutex<StreamEntry>>;

/// Errors returned by registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The URI is bound to a live producer and no takeover was requested
    #[error("stream {0} is already bound to a live producer")]
    AlreadyBound(String),

    /// No stream is registered under the URI
    #[error("stream {0} not found")]
    NotFound(String),

    /// The connection is not the stream's producer
    #[error("connection {connection} does not own stream {uri}")]
    NotOwner { uri: String, connection: ConnectionId },

    /// The connection is neither producer nor observer of the stream
    #[error("connection {connection} is not attached to stream {uri}")]
    NotAttached { uri: String, connection: ConnectionId },

    /// The stream's event subscription is exclusive
    #[error("stream {0} already has a conflicting event subscriber")]
    ExclusiveSubscription(String),

    /// The URI is empty or too long to encode
    #[error("invalid stream uri of {len} bytes (max: {max})")]
    InvalidUri { len: usize, max: usize },
}

/// Result of binding a producer.
#[derive(Debug)]
pub struct Attached {
    /// The freshly created entry.
    pub entry: SharedEntry,
    /// The live entry displaced by a forced takeover, already released.
    pub displaced: Option<SharedEntry>,
}

#[derive(Debug)]
struct Shard {
    streams: RwLock<HashMap<String, SharedEntry>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }
}

/// Registry statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub streams: u64,
    pub registrations: u64,
    pub rejections: u64,
    pub takeovers: u64,
    pub removals: u64,
}

/// The index of live streams.
///
/// Designed to be wrapped in an `Arc` and shared by every connection task.
///
/// # Example
///
/// ```
/// use pixelrelay::registry::{ConnectionId, PeerHandle, StreamRegistry};
/// use tokio::sync::mpsc;
///
/// let registry = StreamRegistry::new();
/// let (tx, _rx) = mpsc::unbounded_channel();
/// let producer = PeerHandle::new(ConnectionId::new(1), tx);
///
/// registry.create_or_attach("wall/demo", producer, false).unwrap();
/// assert!(registry.find("wall/demo").is_some());
/// ```
pub struct StreamRegistry {
    shards: Vec<Shard>,
    registrations: AtomicU64,
    rejections: AtomicU64,
    takeovers: AtomicU64,
    removals: AtomicU64,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("shards", &self.shards.len())
            .field("streams", &self.len())
            .field("registrations", &self.registrations.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::new()).collect(),
            registrations: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            takeovers: AtomicU64::new(0),
            removals: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard_index(&self, uri: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        uri.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn get_shard(&self, uri: &str) -> &Shard {
        &self.shards[self.shard_index(uri)]
    }

    /// Binds `producer` to `uri`.
    ///
    /// Fails with `AlreadyBound` if a live producer holds the URI, unless
    /// `takeover` is set: then the old entry is released and returned as
    /// `displaced`. A closed entry still in the index is replaced silently.
    pub fn create_or_attach(
        &self,
        uri: &str,
        producer: PeerHandle,
        takeover: bool,
    ) -> Result<Attached, RegistryError> {
        check_uri(uri)?;
        let producer_id = producer.id();
        let mut streams = self.get_shard(uri).streams.write().unwrap();

        let mut displaced = None;
        if let Some(existing) = streams.get(uri) {
            let live = existing.lock().unwrap().is_live();
            if live && !takeover {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                debug!(uri = %uri, producer = %producer_id, "Rejected duplicate bind");
                return Err(RegistryError::AlreadyBound(uri.to_string()));
            }

            if let Some(old) = streams.remove(uri) {
                old.lock().unwrap().release();
                if live {
                    self.takeovers.fetch_add(1, Ordering::Relaxed);
                    info!(uri = %uri, producer = %producer_id, "Producer took over stream");
                    displaced = Some(old);
                }
            }
        }

        let entry = Arc::new(Mutex::new(StreamEntry::new(uri, producer)));
        streams.insert(uri.to_string(), Arc::clone(&entry));
        self.registrations.fetch_add(1, Ordering::Relaxed);

        Ok(Attached { entry, displaced })
    }

    /// Attaches an observer connection to a live stream.
    pub fn attach_observer(
        &self,
        uri: &str,
        observer: PeerHandle,
    ) -> Result<SharedEntry, RegistryError> {
        let entry = self
            .find(uri)
            .ok_or_else(|| RegistryError::NotFound(uri.to_string()))?;

        {
            let mut locked = entry.lock().unwrap();
            if !locked.is_live() {
                return Err(RegistryError::NotFound(uri.to_string()));
            }
            locked.add_observer(observer);
        }

        Ok(entry)
    }

    /// Detaches an observer; its subscription goes with it.
    pub fn detach_observer(&self, uri: &str, id: ConnectionId) -> bool {
        match self.find(uri) {
            Some(entry) => entry.lock().unwrap().remove_observer(id),
            None => false,
        }
    }

    /// Looks up the entry for `uri`.
    pub fn find(&self, uri: &str) -> Option<SharedEntry> {
        let streams = self.get_shard(uri).streams.read().unwrap();
        streams.get(uri).cloned()
    }

    /// Returns true if a live producer is bound to `uri`.
    pub fn is_live(&self, uri: &str) -> bool {
        self.find(uri)
            .map(|entry| entry.lock().unwrap().is_live())
            .unwrap_or(false)
    }

    /// Removes `uri` and releases the connections its entry held.
    ///
    /// Observers are sent a stream-closed message. Frame state is left for
    /// the dispatcher to retire.
    pub fn remove(&self, uri: &str) -> Option<SharedEntry> {
        let removed = self.get_shard(uri).streams.write().unwrap().remove(uri);

        if let Some(entry) = &removed {
            entry.lock().unwrap().release();
            self.removals.fetch_add(1, Ordering::Relaxed);
            debug!(uri = %uri, "Stream removed from registry");
        }

        removed
    }

    /// Removes `uri` only if `owner` is still its producer.
    ///
    /// A producer that was displaced by a takeover must not tear down the
    /// stream that replaced it.
    pub fn remove_if_owner(&self, uri: &str, owner: ConnectionId) -> Option<SharedEntry> {
        let mut streams = self.get_shard(uri).streams.write().unwrap();

        let owned = streams
            .get(uri)
            .map(|entry| entry.lock().unwrap().is_owned_by(owner))
            .unwrap_or(false);
        if !owned {
            return None;
        }

        let removed = streams.remove(uri);
        drop(streams);

        if let Some(entry) = &removed {
            entry.lock().unwrap().release();
            self.removals.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Re-keys a stream from `uri` to `new_uri`.
    ///
    /// Only the owning producer may rename. The producer and observers are
    /// queued a rebind so they adopt the new URI.
    pub fn rename(
        &self,
        uri: &str,
        new_uri: &str,
        requester: ConnectionId,
    ) -> Result<(), RegistryError> {
        check_uri(new_uri)?;
        let from = self.shard_index(uri);
        let to = self.shard_index(new_uri);

        let entry = if from == to {
            let mut streams = self.shards[from].streams.write().unwrap();
            let entry = check_rename(&streams, &streams, uri, new_uri, requester)?;
            streams.remove(uri);
            replace(&mut streams, new_uri, Arc::clone(&entry));
            entry
        } else {
            let (low, high) = (from.min(to), from.max(to));
            let mut low_streams = self.shards[low].streams.write().unwrap();
            let mut high_streams = self.shards[high].streams.write().unwrap();
            let (source, target) = if from < to {
                (&mut *low_streams, &mut *high_streams)
            } else {
                (&mut *high_streams, &mut *low_streams)
            };

            let entry = check_rename(source, target, uri, new_uri, requester)?;
            source.remove(uri);
            replace(target, new_uri, Arc::clone(&entry));
            entry
        };

        let mut locked = entry.lock().unwrap();
        locked.set_uri(new_uri.to_string());
        locked.broadcast_rebind();
        info!(from = %uri, to = %new_uri, "Stream renamed");
        Ok(())
    }

    /// Returns all registered URIs, sorted.
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self
            .shards
            .iter()
            .flat_map(|shard| {
                let streams = shard.streams.read().unwrap();
                streams.keys().cloned().collect::<Vec<_>>()
            })
            .collect();
        uris.sort();
        uris
    }

    /// Number of registered streams.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.streams.read().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and releases every stream (used at shutdown).
    pub fn clear(&self) -> Vec<SharedEntry> {
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut streams = shard.streams.write().unwrap();
            removed.extend(streams.drain().map(|(_, entry)| entry));
        }

        for entry in &removed {
            entry.lock().unwrap().release();
        }
        self.removals
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            streams: self.len() as u64,
            registrations: self.registrations.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            takeovers: self.takeovers.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}

fn check_uri(uri: &str) -> Result<(), RegistryError> {
    if is_encodable_uri(uri) {
        Ok(())
    } else {
        Err(RegistryError::InvalidUri {
            len: uri.len(),
            max: MAX_URI_LEN,
        })
    }
}

fn check_rename(
    source: &HashMap<String, SharedEntry>,
    target: &HashMap<String, SharedEntry>,
    uri: &str,
    new_uri: &str,
    requester: ConnectionId,
) -> Result<SharedEntry, RegistryError> {
    let entry = source
        .get(uri)
        .cloned()
        .ok_or_else(|| RegistryError::NotFound(uri.to_string()))?;

    if !entry.lock().unwrap().is_owned_by(requester) {
        return Err(RegistryError::NotOwner {
            uri: uri.to_string(),
            connection: requester,
        });
    }

    if uri != new_uri {
        if let Some(existing) = target.get(new_uri) {
            if existing.lock().unwrap().is_live() {
                return Err(RegistryError::AlreadyBound(new_uri.to_string()));
            }
        }
    }

    Ok(entry)
}

/// Inserts `entry`, releasing any closed entry it replaces.
fn replace(streams: &mut HashMap<String, SharedEntry>, uri: &str, entry: SharedEntry) {
    if let Some(stale) = streams.insert(uri.to_string(), entry.clone()) {
        if !Arc::ptr_eq(&stale, &entry) {
            stale.lock().unwrap().release();
        }
    }
}
