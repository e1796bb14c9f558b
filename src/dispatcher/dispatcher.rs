//! Frame Dispatcher
//!
//! The dispatcher decouples producer and consumer rates. Producers push
//! segments as fast as they like; the consumer pulls whenever it is ready
//! and always gets the freshest complete frame. Frames completed while the
//! consumer was busy are dropped, never queued.
//!
//! ```text
//!   producer ──segments──▶ ingest_segment ──▶ FrameState ──▶ FrameReady
//!                                                  │
//!   consumer ◀──────────── take_latest_frame ◀─────┘
//! ```
//!
//! Each call locks only the target stream's entry.

use crate::dispatcher::frame::{DropReason, Frame, IngestOutcome};
use crate::notify::{Notification, Notifier};
use crate::protocol::FrameSegment;
use crate::registry::{ConnectionId, SharedEntry, StreamRegistry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Dispatcher statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub segments_ingested: u64,
    pub segments_dropped: u64,
    pub frames_completed: u64,
    pub frames_delivered: u64,
    /// Complete frames replaced before the consumer pulled them.
    pub frames_superseded: u64,
    /// Incomplete frames given up on (newer frame or disconnect).
    pub frames_abandoned: u64,
}

#[derive(Debug, Default)]
struct Counters {
    segments_ingested: AtomicU64,
    segments_dropped: AtomicU64,
    frames_completed: AtomicU64,
    frames_delivered: AtomicU64,
    frames_superseded: AtomicU64,
    frames_abandoned: AtomicU64,
}

/// Reassembles frames per stream and hands the latest one to the consumer.
#[derive(Debug)]
pub struct FrameDispatcher {
    registry: Arc<StreamRegistry>,
    notifier: Arc<Notifier>,
    counters: Counters,
}

impl FrameDispatcher {
    pub fn new(registry: Arc<StreamRegistry>, notifier: Arc<Notifier>) -> Self {
        Self {
            registry,
            notifier,
            counters: Counters::default(),
        }
    }

    /// Adds a segment to its stream's frame in flight.
    ///
    /// Completing a frame makes it the stream's latest frame. `FrameReady`
    /// is emitted only when no undelivered frame was waiting, so a slow
    /// consumer holds at most one notification per stream. Segments for
    /// unknown or closed streams and for abandoned frames are dropped.
    pub fn ingest_segment(&self, segment: FrameSegment) -> IngestOutcome {
        self.counters.segments_ingested.fetch_add(1, Ordering::Relaxed);

        let Some(entry) = self.registry.find(&segment.stream_uri) else {
            return self.dropped(&segment, DropReason::UnknownStream);
        };

        let uri = segment.stream_uri.clone();
        let frame_index = segment.frame_index;
        let report = {
            let mut locked = entry.lock().unwrap();
            if locked.is_closed() {
                None
            } else {
                Some(locked.frames_mut().ingest(&uri, segment))
            }
        };

        let Some(report) = report else {
            self.counters.segments_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(uri = %uri, frame = frame_index, "Segment for closed stream dropped");
            return IngestOutcome::Dropped(DropReason::StreamClosed);
        };

        if let Some(abandoned) = report.abandoned {
            self.counters.frames_abandoned.fetch_add(1, Ordering::Relaxed);
            debug!(uri = %uri, frame = abandoned, "Incomplete frame abandoned");
        }
        if let Some(superseded) = report.superseded {
            self.counters.frames_superseded.fetch_add(1, Ordering::Relaxed);
            trace!(uri = %uri, frame = superseded, "Undelivered frame superseded");
        }

        match report.outcome {
            IngestOutcome::Completed => {
                self.counters.frames_completed.fetch_add(1, Ordering::Relaxed);
                // A superseded frame's notification is still outstanding
                if report.superseded.is_none() {
                    trace!(uri = %uri, frame = frame_index, "Frame ready");
                    self.notifier.notify(Notification::FrameReady { uri });
                }
            }
            IngestOutcome::Dropped(reason) => {
                self.counters.segments_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(uri = %uri, frame = frame_index, ?reason, "Segment dropped");
            }
            IngestOutcome::Buffered => {}
        }

        report.outcome
    }

    fn dropped(&self, segment: &FrameSegment, reason: DropReason) -> IngestOutcome {
        self.counters.segments_dropped.fetch_add(1, Ordering::Relaxed);
        debug!(
            uri = %segment.stream_uri,
            frame = segment.frame_index,
            ?reason,
            "Segment dropped"
        );
        IngestOutcome::Dropped(reason)
    }

    /// Returns the newest undelivered frame for `uri`, clearing it.
    ///
    /// Never blocks; returns `None` when nothing new arrived since the
    /// last pull or the stream does not exist.
    pub fn take_latest_frame(&self, uri: &str) -> Option<Frame> {
        let entry = self.registry.find(uri)?;
        let frame = entry.lock().unwrap().frames_mut().take_latest();

        if frame.is_some() {
            self.counters.frames_delivered.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Discards all frame state of `uri` and emits `StreamClosed`.
    ///
    /// Returns false if the stream is unknown or was already closed.
    pub fn on_producer_disconnected(&self, uri: &str) -> bool {
        match self.registry.find(uri) {
            Some(entry) => self.retire(&entry),
            None => false,
        }
    }

    /// Closes an entry's frame state, emitting `StreamClosed` exactly once.
    pub(crate) fn retire(&self, entry: &SharedEntry) -> bool {
        let (uri, abandoned) = {
            let mut locked = entry.lock().unwrap();
            if !locked.mark_closed() {
                return false;
            }
            let abandoned = locked.frames_mut().clear();
            (locked.uri().to_string(), abandoned)
        };

        if abandoned {
            self.counters.frames_abandoned.fetch_add(1, Ordering::Relaxed);
        }

        info!(uri = %uri, "Stream closed");
        self.notifier.notify(Notification::StreamClosed { uri });
        true
    }

    /// Removes `uri` from the registry and retires it.
    pub fn close_stream(&self, uri: &str) -> bool {
        match self.registry.remove(uri) {
            Some(entry) => {
                self.retire(&entry);
                true
            }
            None => false,
        }
    }

    /// Removes and retires `uri` only if `owner` still produces it.
    pub(crate) fn close_owned_stream(&self, uri: &str, owner: ConnectionId) -> bool {
        match self.registry.remove_if_owner(uri, owner) {
            Some(entry) => {
                self.retire(&entry);
                true
            }
            None => false,
        }
    }

    pub fn registry(&self) -> &Arc<StreamRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            segments_ingested: self.counters.segments_ingested.load(Ordering::Relaxed),
            segments_dropped: self.counters.segments_dropped.load(Ordering::Relaxed),
            frames_completed: self.counters.frames_completed.load(Ordering::Relaxed),
            frames_delivered: self.counters.frames_delivered.load(Ordering::Relaxed),
            frames_superseded: self.counters.frames_superseded.load(Ordering::Relaxed),
            frames_abandoned: self.counters.frames_abandoned.load(Ordering::Relaxed),
        }
    }
}
