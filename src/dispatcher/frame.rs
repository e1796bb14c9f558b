//! Frame Reassembly
//!
//! Producers cut each frame into tiles and send them as independent
//! segments. `FrameState` collects the tiles of the frame in flight and
//! keeps at most one complete frame waiting for the consumer.
//!
//! ## Rules
//!
//! - Tiles of one frame may arrive in any order; the assembled frame is
//!   ordered by tile index.
//! - A segment with a newer frame index abandons the frame in flight.
//! - Segments for an abandoned or already delivered frame index are dropped.
//! - A completed frame replaces any undelivered one.

use crate::protocol::FrameSegment;
use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// One complete frame, tiles ordered by tile index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    uri: String,
    index: u64,
    tiles: Vec<Bytes>,
}

impl Frame {
    pub fn new(uri: impl Into<String>, index: u64, tiles: Vec<Bytes>) -> Self {
        Self {
            uri: uri.into(),
            index,
            tiles,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn tiles(&self) -> &[Bytes] {
        &self.tiles
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Total payload size over all tiles.
    pub fn payload_len(&self) -> usize {
        self.tiles.iter().map(Bytes::len).sum()
    }

    /// Concatenates the tiles in order.
    pub fn into_payload(self) -> Bytes {
        if self.tiles.len() == 1 {
            return self.tiles.into_iter().next().unwrap_or_default();
        }

        let mut payload = BytesMut::with_capacity(self.payload_len());
        for tile in &self.tiles {
            payload.extend_from_slice(tile);
        }
        payload.freeze()
    }
}

/// Why a segment was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The segment's frame was abandoned or already delivered.
    Stale,
    /// The segment disagrees with its frame's tile count.
    TileCountMismatch,
    /// The tile index is outside the frame.
    InvalidTile,
    /// The stream has been closed.
    StreamClosed,
    /// No stream is registered under the segment's URI.
    UnknownStream,
}

/// What happened to an ingested segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored; the frame still has missing tiles.
    Buffered,
    /// Completed its frame, which is now the latest frame.
    Completed,
    /// Discarded without affecting any frame.
    Dropped(DropReason),
}

/// Side effects of one ingestion, for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IngestReport {
    pub outcome: IngestOutcome,
    /// Index of an incomplete frame abandoned by this segment.
    pub abandoned: Option<u64>,
    /// Index of an undelivered frame replaced by this segment's frame.
    pub superseded: Option<u64>,
}

impl IngestReport {
    fn dropped(reason: DropReason) -> Self {
        Self {
            outcome: IngestOutcome::Dropped(reason),
            abandoned: None,
            superseded: None,
        }
    }
}

#[derive(Debug)]
struct PendingFrame {
    index: u64,
    total_tiles: u32,
    /// Grows as tiles arrive; never sized from the declared tile count.
    tiles: BTreeMap<u32, Bytes>,
}

impl PendingFrame {
    fn new(index: u64, total_tiles: u32) -> Self {
        Self {
            index,
            total_tiles,
            tiles: BTreeMap::new(),
        }
    }

    /// Stores a tile; a repeated tile replaces the earlier copy.
    fn insert(&mut self, tile_index: u32, payload: Bytes) {
        self.tiles.insert(tile_index, payload);
    }

    fn is_complete(&self) -> bool {
        self.tiles.len() == self.total_tiles as usize
    }

    fn into_frame(self, uri: &str) -> Frame {
        let tiles = self.tiles.into_values().collect();
        Frame::new(uri, self.index, tiles)
    }
}

/// Reassembly and delivery state for one stream.
#[derive(Debug, Default)]
pub struct FrameState {
    pending: Option<PendingFrame>,
    latest: Option<Frame>,
    last_completed: Option<u64>,
}

impl FrameState {
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn has_latest(&self) -> bool {
        self.latest.is_some()
    }

    pub fn last_completed(&self) -> Option<u64> {
        self.last_completed
    }

    pub(crate) fn ingest(&mut self, uri: &str, segment: FrameSegment) -> IngestReport {
        if segment.total_tiles == 0 || segment.tile_index >= segment.total_tiles {
            return IngestReport::dropped(DropReason::InvalidTile);
        }

        if matches!(self.last_completed, Some(last) if segment.frame_index <= last) {
            return IngestReport::dropped(DropReason::Stale);
        }

        let mut abandoned = None;
        if let Some(pending) = &self.pending {
            if segment.frame_index < pending.index {
                return IngestReport::dropped(DropReason::Stale);
            }
            if segment.frame_index > pending.index {
                abandoned = Some(pending.index);
                self.pending = None;
            }
        }

        let pending = self
            .pending
            .get_or_insert_with(|| PendingFrame::new(segment.frame_index, segment.total_tiles));

        if pending.total_tiles != segment.total_tiles {
            return IngestReport {
                outcome: IngestOutcome::Dropped(DropReason::TileCountMismatch),
                abandoned,
                superseded: None,
            };
        }

        pending.insert(segment.tile_index, segment.payload);
        if !pending.is_complete() {
            return IngestReport {
                outcome: IngestOutcome::Buffered,
                abandoned,
                superseded: None,
            };
        }

        let mut superseded = None;
        if let Some(complete) = self.pending.take() {
            let frame = complete.into_frame(uri);
            self.last_completed = Some(frame.index());
            superseded = self.latest.replace(frame).map(|old| old.index());
        }

        IngestReport {
            outcome: IngestOutcome::Completed,
            abandoned,
            superseded,
        }
    }

    /// Returns and clears the undelivered frame.
    pub(crate) fn take_latest(&mut self) -> Option<Frame> {
        self.latest.take()
    }

    /// Discards all frame state; returns true if a frame was in flight.
    pub(crate) fn clear(&mut self) -> bool {
        self.latest = None;
        self.pending.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(frame: u64, index: u32, total: u32) -> FrameSegment {
        FrameSegment::new(
            "s",
            frame,
            index,
            total,
            Bytes::from(format!("f{}t{}", frame, index)),
        )
    }

    #[test]
    fn test_single_tile_frame_completes() {
        let mut state = FrameState::default();
        let report = state.ingest("s", tile(0, 0, 1));

        assert_eq!(report.outcome, IngestOutcome::Completed);
        let frame = state.take_latest().unwrap();
        assert_eq!(frame.index(), 0);
        assert_eq!(frame.into_payload(), Bytes::from("f0t0"));
        assert!(state.take_latest().is_none());
    }

    #[test]
    fn test_reassembly_independent_of_arrival_order() {
        let orders: [[u32; 3]; 4] = [[0, 1, 2], [2, 1, 0], [1, 2, 0], [2, 0, 1]];
        let mut frames = Vec::new();

        for order in orders {
            let mut state = FrameState::default();
            for (n, index) in order.iter().enumerate() {
                let report = state.ingest("s", tile(5, *index, 3));
                let expected = if n == 2 {
                    IngestOutcome::Completed
                } else {
                    IngestOutcome::Buffered
                };
                assert_eq!(report.outcome, expected);
            }
            frames.push(state.take_latest().unwrap());
        }

        assert!(frames.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(frames[0].clone().into_payload(), Bytes::from("f5t0f5t1f5t2"));
    }

    #[test]
    fn test_duplicate_tile_does_not_complete_frame() {
        let mut state = FrameState::default();

        state.ingest("s", tile(0, 0, 2));
        let report = state.ingest("s", tile(0, 0, 2));

        assert_eq!(report.outcome, IngestOutcome::Buffered);
        assert!(!state.has_latest());
    }

    #[test]
    fn test_newer_frame_abandons_pending() {
        let mut state = FrameState::default();

        state.ingest("s", tile(0, 0, 3));
        state.ingest("s", tile(0, 1, 3));
        let report = state.ingest("s", tile(1, 0, 1));

        assert_eq!(report.abandoned, Some(0));
        assert_eq!(report.outcome, IngestOutcome::Completed);

        // The abandoned frame's late tile is dropped, never reassembled
        let late = state.ingest("s", tile(0, 2, 3));
        assert_eq!(late.outcome, IngestOutcome::Dropped(DropReason::Stale));
        assert_eq!(state.take_latest().unwrap().index(), 1);
    }

    #[test]
    fn test_older_segment_than_pending_dropped() {
        let mut state = FrameState::default();

        state.ingest("s", tile(4, 0, 2));
        let report = state.ingest("s", tile(3, 0, 2));

        assert_eq!(report.outcome, IngestOutcome::Dropped(DropReason::Stale));
        assert!(state.has_pending());
    }

    #[test]
    fn test_latest_frame_superseded() {
        let mut state = FrameState::default();

        state.ingest("s", tile(0, 0, 1));
        let report = state.ingest("s", tile(1, 0, 1));

        assert_eq!(report.superseded, Some(0));
        assert_eq!(state.take_latest().unwrap().index(), 1);
    }

    #[test]
    fn test_tile_count_mismatch_dropped() {
        let mut state = FrameState::default();

        state.ingest("s", tile(0, 0, 3));
        let report = state.ingest("s", tile(0, 1, 4));

        assert_eq!(
            report.outcome,
            IngestOutcome::Dropped(DropReason::TileCountMismatch)
        );
    }

    #[test]
    fn test_invalid_tile_dropped() {
        let mut state = FrameState::default();
        let report = state.ingest("s", tile(0, 3, 3));
        assert_eq!(report.outcome, IngestOutcome::Dropped(DropReason::InvalidTile));
    }

    #[test]
    fn test_huge_tile_count_stores_only_received_tiles() {
        let mut state = FrameState::default();

        let report = state.ingest("s", tile(0, 0, u32::MAX));
        assert_eq!(report.outcome, IngestOutcome::Buffered);
        assert_eq!(state.pending.as_ref().map(|p| p.tiles.len()), Some(1));
    }

    #[test]
    fn test_clear_reports_pending() {
        let mut state = FrameState::default();

        state.ingest("s", tile(0, 0, 1));
        state.ingest("s", tile(1, 0, 2));

        assert!(state.clear());
        assert!(!state.has_latest());
        assert!(!state.clear());
    }
}
